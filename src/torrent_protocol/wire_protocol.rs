use std::fmt;

use anyhow::Result;
use thiserror::Error;

pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

#[derive(Eq, PartialEq, Hash, Clone, Copy, Debug)]
pub struct BlockRequest {
    pub piece_idx: u32,
    pub block_begin: u32,
    pub data_len: u32,
}

impl fmt::Display for BlockRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "piece idx: {}, begin: {}, length: {}",
            self.piece_idx, self.block_begin, self.data_len
        )
    }
}

#[derive(PartialEq, Debug, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),         // piece index
    Bitfield(Vec<u8>), // raw bitmap, the high bit in the first byte corresponds to piece index 0
    Request(BlockRequest),
    Piece(u32, u32, Vec<u8>), // index, begin, block of data
    Cancel(BlockRequest),
    Port(u16),     // DHT listening port, accepted but never acted on
    Extended(u8),  // extension protocol message id, payload is skipped
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep-alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have(piece_idx) => write!(f, "have piece id {piece_idx}"),
            Message::Bitfield(bitfield) => write!(f, "bitfield of {} bytes", bitfield.len()),
            Message::Request(block_request) => write!(f, "request: {block_request}"),
            Message::Piece(piece_idx, begin, data) => write!(
                f,
                "piece: piece idx: {piece_idx}, begin: {begin}, data len: {}",
                data.len()
            ),
            Message::Cancel(block_request) => write!(f, "cancel: {block_request}"),
            Message::Port(p) => write!(f, "port {p}"),
            Message::Extended(id) => write!(f, "extension message id {id}"),
        }
    }
}

/// Optional protocol extensions a peer advertises in the handshake reserved bytes.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub struct Extensions {
    pub extension_protocol: bool,
    pub dht: bool,
}

impl Extensions {
    pub fn from_reserved(reserved: [u8; 8]) -> Self {
        Extensions {
            extension_protocol: reserved[5] & 0x10 != 0,
            dht: reserved[7] & 0x01 != 0,
        }
    }
}

#[derive(PartialEq, Clone, Debug)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn extensions(&self) -> Extensions {
        Extensions::from_reserved(self.reserved)
    }
}

#[trait_variant::make(Send)]
pub trait Protocol {
    async fn send_handshake(&mut self, handshake: &Handshake) -> Result<()>;
    async fn receive_handshake(&mut self) -> Result<Handshake>;
}

#[trait_variant::make(Send)]
pub trait ProtocolReadHalf {
    async fn receive(&mut self) -> Result<Message>;
}

#[trait_variant::make(Send)]
pub trait ProtocolWriteHalf {
    async fn send(&mut self, message: Message) -> Result<()>;
}

/// Violations of the wire protocol. These are fatal to the single connection
/// that produced them and are kept apart from plain I/O errors for auditing.
#[derive(Debug, Error, PartialEq, Clone)]
pub enum ProtocolError {
    #[error("unexpected protocol string in handshake: {0:?}")]
    BadProtocolString(String),
    #[error("info hash mismatch: expected {expected}, received {received}")]
    InfoHashMismatch { expected: String, received: String },
    #[error("bitfield of {received} bytes, expected {expected} bytes")]
    BitfieldSize { received: usize, expected: usize },
    #[error("bitfield has spare bits set")]
    BitfieldSpareBits,
    #[error("bitfield received after the first message")]
    BitfieldOutOfPosition,
    #[error("unknown message id {0}")]
    UnknownMessageId(u8),
    #[error("message id {id} with invalid length {len}")]
    InvalidLength { id: u8, len: u32 },
    #[error("piece index {0} out of range")]
    PieceIndexOutOfRange(u32),
}
