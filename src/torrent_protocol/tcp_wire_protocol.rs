use anyhow::Result;
use core::str;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::torrent_protocol::wire_protocol::{
    BlockRequest, Handshake, Message, Protocol, ProtocolError, ProtocolReadHalf,
    ProtocolWriteHalf, HANDSHAKE_LEN, PROTOCOL_STRING,
};

const MAX_MESSAGE_LEN: u32 = 2 * 1024 * 1024; // id byte plus payload
const MAX_BLOCK_LEN: u32 = 128 * 1024;

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Protocol for T {
    async fn send_handshake(&mut self, handshake: &Handshake) -> Result<()> {
        let mut buf: [u8; HANDSHAKE_LEN] = [0; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        buf[20..28].copy_from_slice(&handshake.reserved);
        buf[28..48].copy_from_slice(&handshake.info_hash);
        buf[48..68].copy_from_slice(&handshake.peer_id);
        self.write_all(&buf).await?;
        self.flush().await?;
        Ok(())
    }

    async fn receive_handshake(&mut self) -> Result<Handshake> {
        let mut pstr_len_buf: [u8; 1] = [0; 1];
        self.read_exact(&mut pstr_len_buf).await?;
        if pstr_len_buf[0] as usize != PROTOCOL_STRING.len() {
            return Err(ProtocolError::BadProtocolString(format!(
                "<protocol string of length {}>",
                pstr_len_buf[0]
            ))
            .into());
        }

        let mut buf: [u8; HANDSHAKE_LEN - 1] = [0; HANDSHAKE_LEN - 1];
        self.read_exact(&mut buf).await?;
        if &buf[0..19] != PROTOCOL_STRING {
            let pstr = str::from_utf8(&buf[0..19])
                .unwrap_or("unknown non utf8 protocol string")
                .to_string();
            return Err(ProtocolError::BadProtocolString(pstr).into());
        }

        let mut handshake = Handshake::new([0; 20], [0; 20]);
        handshake.reserved.copy_from_slice(&buf[19..27]);
        handshake.info_hash.copy_from_slice(&buf[27..47]);
        handshake.peer_id.copy_from_slice(&buf[47..67]);
        Ok(handshake)
    }
}

impl<T: AsyncWrite + Unpin + Send> ProtocolWriteHalf for T {
    async fn send(&mut self, message: Message) -> Result<()> {
        self.write_all(&encode_message(&message)).await?;
        Ok(())
    }
}

impl<T: AsyncRead + Unpin + Send> ProtocolReadHalf for T {
    async fn receive(&mut self) -> Result<Message> {
        // get size of message
        let mut size_message_buf: [u8; 4] = [0; 4];
        self.read_exact(&mut size_message_buf).await?;
        let size_message = u32::from_be_bytes(size_message_buf);
        if size_message == 0 {
            return Ok(Message::KeepAlive);
        }

        // get type of message
        let mut type_message_buf: [u8; 1] = [0; 1];
        self.read_exact(&mut type_message_buf).await?;
        let id = type_message_buf[0];
        let payload_len = size_message - 1;
        let valid_len = match id {
            0..=3 => payload_len == 0,
            4 => payload_len == 4,
            5 => true,
            6 | 8 => payload_len == 12,
            7 => (8..=8 + MAX_BLOCK_LEN).contains(&payload_len),
            9 => payload_len == 2,
            20 => payload_len >= 1,
            unknown_message_id => {
                return Err(ProtocolError::UnknownMessageId(unknown_message_id).into())
            }
        };
        if !valid_len || size_message > MAX_MESSAGE_LEN {
            return Err(ProtocolError::InvalidLength {
                id,
                len: size_message,
            }
            .into());
        }

        let mut payload = vec![0; payload_len as usize];
        self.read_exact(&mut payload).await?;
        Ok(decode_payload(id, payload))
    }
}

fn be_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

// payload length has already been checked against the message id
fn decode_payload(id: u8, mut payload: Vec<u8>) -> Message {
    let block_request = |p: &[u8]| BlockRequest {
        piece_idx: be_u32(&p[0..4]),
        block_begin: be_u32(&p[4..8]),
        data_len: be_u32(&p[8..12]),
    };
    match id {
        0 => Message::Choke,
        1 => Message::Unchoke,
        2 => Message::Interested,
        3 => Message::NotInterested,
        4 => Message::Have(be_u32(&payload)),
        5 => Message::Bitfield(payload),
        6 => Message::Request(block_request(&payload)),
        7 => {
            let block = payload.split_off(8);
            Message::Piece(be_u32(&payload[0..4]), be_u32(&payload[4..8]), block)
        }
        8 => Message::Cancel(block_request(&payload)),
        9 => Message::Port(u16::from_be_bytes([payload[0], payload[1]])),
        _ => Message::Extended(payload[0]),
    }
}

fn frame(id: u8, payload_len: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + payload_len);
    buf.extend_from_slice(&(1 + payload_len as u32).to_be_bytes());
    buf.push(id);
    buf
}

fn encode_block_request(id: u8, block_request: &BlockRequest) -> Vec<u8> {
    let mut buf = frame(id, 12);
    buf.extend_from_slice(&block_request.piece_idx.to_be_bytes());
    buf.extend_from_slice(&block_request.block_begin.to_be_bytes());
    buf.extend_from_slice(&block_request.data_len.to_be_bytes());
    buf
}

pub fn encode_message(message: &Message) -> Vec<u8> {
    match message {
        Message::KeepAlive => vec![0; 4],
        Message::Choke => frame(0, 0),
        Message::Unchoke => frame(1, 0),
        Message::Interested => frame(2, 0),
        Message::NotInterested => frame(3, 0),
        Message::Have(piece_idx) => {
            let mut buf = frame(4, 4);
            buf.extend_from_slice(&piece_idx.to_be_bytes());
            buf
        }
        Message::Bitfield(bitfield) => {
            let mut buf = frame(5, bitfield.len());
            buf.extend_from_slice(bitfield);
            buf
        }
        Message::Request(block_request) => encode_block_request(6, block_request),
        Message::Piece(index, begin, block) => {
            let mut buf = frame(7, 8 + block.len());
            buf.extend_from_slice(&index.to_be_bytes());
            buf.extend_from_slice(&begin.to_be_bytes());
            buf.extend_from_slice(block);
            buf
        }
        Message::Cancel(block_request) => encode_block_request(8, block_request),
        Message::Port(port) => {
            let mut buf = frame(9, 2);
            buf.extend_from_slice(&port.to_be_bytes());
            buf
        }
        Message::Extended(id) => {
            let mut buf = frame(20, 1);
            buf.push(*id);
            buf
        }
    }
}
