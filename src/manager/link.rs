use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::bitfield::{self, Bitfield};
use crate::torrent_protocol::wire_protocol::{
    BlockRequest, Extensions, Handshake, Message, Protocol, ProtocolError, ProtocolReadHalf,
    ProtocolWriteHalf,
};
use crate::util::{force_string, pretty_info_hash};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const SEND_TIMEOUT: Duration = Duration::from_secs(10);
const KEEP_ALIVE_FREQ: Duration = Duration::from_secs(90); // send a keep-alive after this much outbound silence
const IDLE_TIMEOUT: Duration = Duration::from_secs(180); // drop peers silent for this long, keep-alives included
const MIN_SERVED_REQUEST_LEN: u32 = 8 * 1024;
const MAX_SERVED_REQUEST_LEN: u32 = 128 * 1024;
const INBOX_CAPACITY: usize = 512;
const OUTBOX_CAPACITY: usize = 512;
const CANCEL_CHANNEL_CAPACITY: usize = 64;
const MAX_REMEMBERED_CANCELS: usize = 64;

/// Commands the scheduler can push into a link's outbox.
#[derive(PartialEq, Debug, Clone)]
pub enum Command {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Request(BlockRequest),
    Piece(u32, u32, Vec<u8>), // index, begin, data
}

#[derive(PartialEq, Debug, Clone)]
pub struct Block {
    pub piece_idx: u32,
    pub begin: u32,
    pub data: Vec<u8>,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct LinkFlags {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for LinkFlags {
    fn default() -> Self {
        LinkFlags {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

#[derive(PartialEq, Debug, Clone)]
pub enum LinkFailure {
    Protocol(ProtocolError),
    Io(String),
    Closed,
}

impl fmt::Display for LinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LinkFailure::Protocol(e) => write!(f, "protocol violation: {e}"),
            LinkFailure::Io(e) => write!(f, "{e}"),
            LinkFailure::Closed => write!(f, "closed"),
        }
    }
}

/// What the scheduler sees of a connection. Implemented by [`Link`] and by
/// test doubles.
#[trait_variant::make(Send)]
pub trait PeerLink {
    fn addr(&self) -> SocketAddr;
    fn is_alive(&self) -> bool;
    /// Why the link went down, `None` while it is alive.
    fn failure(&self) -> Option<LinkFailure>;
    fn flags(&self) -> LinkFlags;
    fn outstanding_requests(&self) -> usize;
    fn reset_outstanding_requests(&self);
    /// The remote bitfield, returned once after the peer sent it.
    fn take_remote_bitfield(&self) -> Option<Bitfield>;
    fn poll_have(&mut self) -> Option<u32>;
    fn poll_block(&mut self) -> Option<Block>;
    fn poll_request(&mut self) -> Option<BlockRequest>;
    /// Queues a command without waiting. A link whose outbox is full is
    /// failed as a slow consumer; `false` means the command was dropped.
    fn send(&mut self, command: Command) -> bool;
    fn close(&self);
    async fn join(self);
}

struct LinkState {
    flags: LinkFlags,
    remote_bitfield: Bitfield,
    remote_bitfield_pending: bool,
    outstanding_requests: usize,
    failure: Option<LinkFailure>,
}

type SharedState = Arc<Mutex<LinkState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, LinkState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Link {
    addr: SocketAddr,
    state: SharedState,
    outbox: Sender<Command>,
    blocks: Receiver<Block>,
    requests: Receiver<BlockRequest>,
    haves: Receiver<u32>,
    stop: Arc<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

pub async fn connect(
    addr: SocketAddr,
    info_hash: [u8; 20],
    own_peer_id: [u8; 20],
    local_bitfield: Bitfield,
) -> Result<Link> {
    log::trace!("initiating connection to peer: {addr}");
    let mut stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Err(_elapsed) => bail!("timed out connecting to peer {addr}"),
        Ok(result) => result?,
    };
    let handshake = outbound_handshake(&mut stream, info_hash, own_peer_id).await?;
    log::debug!(
        "peer {addr}: connected, peer id {}",
        force_string(&handshake.peer_id)
    );
    Ok(Link::start(
        addr,
        stream,
        handshake.extensions(),
        local_bitfield,
    ))
}

/// Sends our handshake and waits for the peer's one, which must carry the
/// same info hash.
pub async fn outbound_handshake<S: AsyncRead + AsyncWrite + Unpin + Send>(
    stream: &mut S,
    info_hash: [u8; 20],
    own_peer_id: [u8; 20],
) -> Result<Handshake> {
    stream
        .send_handshake(&Handshake::new(info_hash, own_peer_id))
        .await?;
    let theirs = await_handshake(stream).await?;
    check_info_hash(info_hash, &theirs)?;
    Ok(theirs)
}

/// Reads the handshake of a peer that connected to us, routes it by info
/// hash and answers with ours.
pub async fn inbound_handshake<S: AsyncRead + AsyncWrite + Unpin + Send>(
    stream: &mut S,
    info_hash: [u8; 20],
    own_peer_id: [u8; 20],
) -> Result<Handshake> {
    let theirs = await_handshake(stream).await?;
    check_info_hash(info_hash, &theirs)?;
    stream
        .send_handshake(&Handshake::new(info_hash, own_peer_id))
        .await?;
    Ok(theirs)
}

async fn await_handshake<S: AsyncRead + AsyncWrite + Unpin + Send>(
    stream: &mut S,
) -> Result<Handshake> {
    match timeout(HANDSHAKE_TIMEOUT, stream.receive_handshake()).await {
        Err(_elapsed) => bail!("handshake timed out after {HANDSHAKE_TIMEOUT:?}"),
        Ok(result) => result,
    }
}

fn check_info_hash(info_hash: [u8; 20], theirs: &Handshake) -> Result<()> {
    if theirs.info_hash != info_hash {
        return Err(ProtocolError::InfoHashMismatch {
            expected: pretty_info_hash(info_hash),
            received: pretty_info_hash(theirs.info_hash),
        }
        .into());
    }
    Ok(())
}

impl Link {
    /// Spawns the read and write loops over an already handshaken stream.
    /// The local bitfield is the first message sent.
    pub fn start<S: AsyncRead + AsyncWrite + Send + 'static>(
        addr: SocketAddr,
        stream: S,
        extensions: Extensions,
        local_bitfield: Bitfield,
    ) -> Link {
        if extensions != Extensions::default() {
            log::trace!("peer {addr}: advertises {extensions:?}, none of which are used");
        }
        let num_pieces = local_bitfield.num_pieces();
        let state = Arc::new(Mutex::new(LinkState {
            flags: LinkFlags::default(),
            remote_bitfield: Bitfield::new(num_pieces),
            remote_bitfield_pending: false,
            outstanding_requests: 0,
            failure: None,
        }));
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (blocks_tx, blocks_rx) = mpsc::channel(INBOX_CAPACITY);
        let (requests_tx, requests_rx) = mpsc::channel(INBOX_CAPACITY);
        let (haves_tx, haves_rx) = mpsc::channel(INBOX_CAPACITY);
        let (cancel_tx, cancel_rx) = mpsc::channel(CANCEL_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop = Arc::new(stop_tx);

        let (read, write) = tokio::io::split(stream);
        let reader = Reader {
            addr,
            num_pieces,
            state: state.clone(),
            blocks_tx,
            requests_tx,
            haves_tx,
            cancel_tx,
            received_first_message: false,
        };
        let writer = Writer {
            addr,
            state: state.clone(),
            cancel_rx,
            cancellations: VecDeque::new(),
        };
        let tasks = vec![
            tokio::spawn(rcv_message_handler(reader, read, stop.clone(), stop_rx.clone())),
            tokio::spawn(snd_message_handler(
                writer,
                write,
                outbox_rx,
                local_bitfield,
                stop.clone(),
                stop_rx,
            )),
        ];

        Link {
            addr,
            state,
            outbox: outbox_tx,
            blocks: blocks_rx,
            requests: requests_rx,
            haves: haves_rx,
            stop,
            tasks,
        }
    }
}

impl PeerLink for Link {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn is_alive(&self) -> bool {
        lock(&self.state).failure.is_none()
    }

    fn failure(&self) -> Option<LinkFailure> {
        lock(&self.state).failure.clone()
    }

    fn flags(&self) -> LinkFlags {
        lock(&self.state).flags
    }

    fn outstanding_requests(&self) -> usize {
        lock(&self.state).outstanding_requests
    }

    fn reset_outstanding_requests(&self) {
        lock(&self.state).outstanding_requests = 0;
    }

    fn take_remote_bitfield(&self) -> Option<Bitfield> {
        let mut state = lock(&self.state);
        if !state.remote_bitfield_pending {
            return None;
        }
        state.remote_bitfield_pending = false;
        Some(state.remote_bitfield.clone())
    }

    fn poll_have(&mut self) -> Option<u32> {
        self.haves.try_recv().ok()
    }

    fn poll_block(&mut self) -> Option<Block> {
        self.blocks.try_recv().ok()
    }

    fn poll_request(&mut self) -> Option<BlockRequest> {
        self.requests.try_recv().ok()
    }

    fn send(&mut self, command: Command) -> bool {
        if !self.is_alive() {
            log::trace!("peer {}: link is down, command dropped", self.addr);
            return false;
        }
        match self.outbox.try_reserve() {
            Ok(permit) => {
                let mut state = lock(&self.state);
                match &command {
                    Command::Choke => state.flags.am_choking = true,
                    Command::Unchoke => state.flags.am_choking = false,
                    Command::Interested => state.flags.am_interested = true,
                    Command::NotInterested => state.flags.am_interested = false,
                    Command::Request(_) => state.outstanding_requests += 1,
                    Command::Have(_) | Command::Piece(..) => {}
                }
                drop(state);
                permit.send(command);
                true
            }
            Err(TrySendError::Full(())) => {
                log::debug!("peer {}: outbox full, dropping slow peer", self.addr);
                mark_failed(
                    &self.state,
                    LinkFailure::Io(format!("outbox of {OUTBOX_CAPACITY} commands full")),
                );
                self.close();
                false
            }
            Err(TrySendError::Closed(())) => {
                log::trace!("peer {}: link is down, command dropped", self.addr);
                false
            }
        }
    }

    fn close(&self) {
        self.stop.send_replace(true);
    }

    async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!("peer {}: link task failed: {e}", self.addr);
            }
        }
    }
}

fn mark_failed(state: &SharedState, failure: LinkFailure) {
    let mut state = lock(state);
    if state.failure.is_none() {
        state.failure = Some(failure);
    }
}

fn classify(addr: SocketAddr, result: Result<()>) -> LinkFailure {
    match result {
        Ok(()) => {
            log::debug!("peer {addr}: link closed");
            LinkFailure::Closed
        }
        Err(e) => match e.downcast_ref::<ProtocolError>() {
            Some(protocol_error) => {
                log::warn!("peer {addr}: protocol violation, closing link: {protocol_error}");
                LinkFailure::Protocol(protocol_error.clone())
            }
            None => {
                log::debug!("peer {addr}: link failed: {e}");
                LinkFailure::Io(e.to_string())
            }
        },
    }
}

struct Reader {
    addr: SocketAddr,
    num_pieces: usize,
    state: SharedState,
    blocks_tx: Sender<Block>,
    requests_tx: Sender<BlockRequest>,
    haves_tx: Sender<u32>,
    cancel_tx: Sender<BlockRequest>,
    received_first_message: bool,
}

impl Reader {
    async fn next_message<R: ProtocolReadHalf>(&mut self, read: &mut R) -> Result<()> {
        let message = match timeout(IDLE_TIMEOUT, read.receive()).await {
            Err(_elapsed) => bail!("nothing received (not even keep-alives) in {IDLE_TIMEOUT:?}"),
            Ok(result) => result?,
        };
        log::trace!("received from {}: {}", self.addr, message);
        if message == Message::KeepAlive {
            return Ok(());
        }
        let first_message = !self.received_first_message;
        self.received_first_message = true;

        match message {
            Message::KeepAlive => {}
            Message::Choke => lock(&self.state).flags.peer_choking = true,
            Message::Unchoke => lock(&self.state).flags.peer_choking = false,
            Message::Interested => lock(&self.state).flags.peer_interested = true,
            Message::NotInterested => lock(&self.state).flags.peer_interested = false,
            Message::Have(piece_idx) => {
                self.check_piece_idx(piece_idx)?;
                lock(&self.state).remote_bitfield.set(piece_idx as usize);
                self.haves_tx.send(piece_idx).await?;
            }
            Message::Bitfield(bytes) => {
                if !first_message {
                    return Err(ProtocolError::BitfieldOutOfPosition.into());
                }
                let expected = bitfield::byte_len(self.num_pieces);
                if bytes.len() != expected {
                    return Err(ProtocolError::BitfieldSize {
                        received: bytes.len(),
                        expected,
                    }
                    .into());
                }
                let remote_bitfield = Bitfield::from_bytes(bytes, self.num_pieces)
                    .map_err(|_| ProtocolError::BitfieldSpareBits)?;
                let mut state = lock(&self.state);
                state.remote_bitfield = remote_bitfield;
                state.remote_bitfield_pending = true;
            }
            Message::Request(block_request) => {
                self.check_piece_idx(block_request.piece_idx)?;
                if block_request.data_len < MIN_SERVED_REQUEST_LEN
                    || block_request.data_len > MAX_SERVED_REQUEST_LEN
                {
                    log::trace!(
                        "peer {}: ignoring request with unreasonable length: {block_request}",
                        self.addr
                    );
                } else if self.requests_tx.try_send(block_request).is_err() {
                    log::trace!(
                        "peer {}: too many queued requests, dropping {block_request}",
                        self.addr
                    );
                }
            }
            Message::Piece(piece_idx, begin, data) => {
                self.check_piece_idx(piece_idx)?;
                {
                    let mut state = lock(&self.state);
                    state.outstanding_requests = state.outstanding_requests.saturating_sub(1);
                }
                self.blocks_tx
                    .send(Block {
                        piece_idx,
                        begin,
                        data,
                    })
                    .await?;
            }
            Message::Cancel(block_request) => {
                // the writer is the only consumer; losing a cancel only costs bandwidth
                let _ = self.cancel_tx.try_send(block_request);
            }
            Message::Port(port) => {
                log::trace!("peer {}: ignoring DHT port {port}", self.addr);
            }
            Message::Extended(id) => {
                log::trace!("peer {}: ignoring extension message {id}", self.addr);
            }
        }
        Ok(())
    }

    fn check_piece_idx(&self, piece_idx: u32) -> Result<()> {
        if piece_idx as usize >= self.num_pieces {
            return Err(ProtocolError::PieceIndexOutOfRange(piece_idx).into());
        }
        Ok(())
    }
}

async fn rcv_message_handler<R: ProtocolReadHalf>(
    mut reader: Reader,
    mut read: R,
    stop: Arc<watch::Sender<bool>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let result = loop {
        tokio::select! {
            _ = stop_rx.changed() => break Ok(()),
            r = reader.next_message(&mut read) => {
                if let Err(e) = r {
                    break Err(e);
                }
            }
        }
    };
    mark_failed(&reader.state, classify(reader.addr, result));
    stop.send_replace(true);
}

struct Writer {
    addr: SocketAddr,
    state: SharedState,
    cancel_rx: Receiver<BlockRequest>,
    cancellations: VecDeque<BlockRequest>,
}

impl Writer {
    /// Translates a command to its wire message, or `None` when it is a
    /// piece the peer cancelled meanwhile.
    fn to_message(&mut self, command: Command) -> Option<Message> {
        let message = match command {
            Command::Choke => Message::Choke,
            Command::Unchoke => Message::Unchoke,
            Command::Interested => Message::Interested,
            Command::NotInterested => Message::NotInterested,
            Command::Have(piece_idx) => Message::Have(piece_idx),
            Command::Request(block_request) => Message::Request(block_request),
            Command::Piece(piece_idx, begin, data) => {
                while let Ok(cancel) = self.cancel_rx.try_recv() {
                    if self.cancellations.len() == MAX_REMEMBERED_CANCELS {
                        self.cancellations.pop_front();
                    }
                    self.cancellations.push_back(cancel);
                }
                let block_request = BlockRequest {
                    piece_idx,
                    block_begin: begin,
                    data_len: data.len() as u32,
                };
                if let Some(pos) = self.cancellations.iter().position(|c| *c == block_request) {
                    self.cancellations.remove(pos);
                    log::trace!(
                        "peer {}: not sending cancelled block ({block_request})",
                        self.addr
                    );
                    return None;
                }
                Message::Piece(piece_idx, begin, data)
            }
        };
        Some(message)
    }
}

async fn snd_message_handler<W: ProtocolWriteHalf>(
    mut writer: Writer,
    mut write: W,
    mut outbox_rx: Receiver<Command>,
    local_bitfield: Bitfield,
    stop: Arc<watch::Sender<bool>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut next = Some(Message::Bitfield(local_bitfield.as_bytes().to_vec()));
    let result: Result<()> = loop {
        let message = match next.take() {
            Some(message) => message,
            None => tokio::select! {
                _ = stop_rx.changed() => break Ok(()),
                c = timeout(KEEP_ALIVE_FREQ, outbox_rx.recv()) => match c {
                    Err(_elapsed) => Message::KeepAlive,
                    Ok(None) => break Ok(()),
                    Ok(Some(command)) => match writer.to_message(command) {
                        Some(message) => message,
                        None => continue,
                    },
                },
            },
        };
        log::trace!("sending message {} to peer {}", message, writer.addr);
        let sent = tokio::select! {
            _ = stop_rx.changed() => break Ok(()),
            sent = timeout(SEND_TIMEOUT, write.send(message)) => sent,
        };
        match sent {
            Err(_elapsed) => break Err(anyhow!("timed out sending message")),
            Ok(Err(e)) => break Err(e),
            Ok(Ok(())) => {}
        }
    };
    mark_failed(&writer.state, classify(writer.addr, result));
    stop.send_replace(true);
}
