use std::cmp;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use size::Size;
use tokio::sync::mpsc::Receiver;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::bitfield::Bitfield;
use crate::manager::ledger::{Cursor, Ledger};
use crate::manager::link::{Block, Command, PeerLink};
use crate::manager::rarity::RarityTable;
use crate::persistence::file_manager::FileManager;
use crate::torrent_protocol::wire_protocol::BlockRequest;

pub const BLOCK_SIZE: u32 = 16 * 1024;
pub const MAX_OUTSTANDING_REQUESTS: usize = 10;
const TICK: Duration = Duration::from_millis(50);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const ZERO_PEERS_REPOLL: Duration = Duration::from_secs(60); // ask the tracker again when alone for this long
const LOG_STATS_FREQ: Duration = Duration::from_secs(10);

/// Where new peer addresses come from, and where progress goes.
pub trait PeerSource {
    fn has_new_peers(&self) -> bool;
    fn take_new_peers(&mut self) -> Vec<SocketAddr>;
    fn report_progress(&self, downloaded: u64, uploaded: u64, left: u64);
    /// Asks for an announce as soon as possible instead of at the next interval.
    fn request_update(&self);
}

/// Opens outbound connections without blocking the caller; the outcome is
/// delivered later as a [`NewLink`].
pub trait Dialer {
    fn dial(&self, addr: SocketAddr, local_bitfield: Bitfield);
}

pub enum NewLink<L> {
    Established(L),
    Failed(SocketAddr),
}

impl<L: PeerLink> fmt::Debug for NewLink<L> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NewLink::Established(link) => write!(f, "established link to {}", link.addr()),
            NewLink::Failed(addr) => write!(f, "failed connection to {addr}"),
        }
    }
}

pub struct SchedulerConfig {
    pub max_peers: usize,
    pub upload: bool,
}

struct PeerEntry<L> {
    link: L,
    counted: Bitfield, // pieces of this peer added to the rarity table
    without_downloads: bool,
}

pub struct Scheduler<L: PeerLink, P: PeerSource, D: Dialer> {
    storage: Arc<FileManager>,
    peer_source: P,
    dialer: D,
    new_links: Receiver<NewLink<L>>,
    config: SchedulerConfig,
    peers: HashMap<SocketAddr, PeerEntry<L>>,
    dialing: HashSet<SocketAddr>,
    closing: JoinSet<()>,
    rarity: RarityTable,
    ledger: Ledger,
    rng: StdRng,
    alone_since: Option<Instant>,
    last_stats: Option<Instant>,
    completed: bool,
}

impl<L, P, D> Scheduler<L, P, D>
where
    L: PeerLink + Send + 'static,
    P: PeerSource,
    D: Dialer,
{
    pub fn new(
        storage: Arc<FileManager>,
        peer_source: P,
        dialer: D,
        new_links: Receiver<NewLink<L>>,
        config: SchedulerConfig,
    ) -> Self {
        let num_pieces = storage.num_pieces();
        let mut rarity = RarityTable::new(num_pieces);
        for idx in storage.bitfield().iter_set() {
            rarity.take(idx as u32);
        }
        Scheduler {
            completed: storage.is_complete(),
            storage,
            peer_source,
            dialer,
            new_links,
            config,
            peers: HashMap::new(),
            dialing: HashSet::new(),
            closing: JoinSet::new(),
            rarity,
            ledger: Ledger::new(),
            rng: StdRng::from_os_rng(),
            alone_since: None,
            last_stats: None,
        }
    }

    /// Ticks until `shutdown` turns true, then closes every link and waits
    /// for them.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(Instant::now()),
                r = shutdown.changed() => if r.is_err() || *shutdown.borrow() {
                    break;
                },
            }
        }
        self.close_all().await;
    }

    pub async fn close_all(&mut self) {
        for (_, peer) in self.peers.drain() {
            peer.link.close();
            self.closing.spawn(peer.link.join());
        }
        while self.closing.join_next().await.is_some() {}
        log::debug!("all links closed");
    }

    /// One round of the exchange policy. Never waits on a link.
    pub fn tick(&mut self, now: Instant) {
        self.reclaim_dead_links();
        self.admit_peers();
        self.sweep_timeouts(now);
        self.announce_verified();
        self.reschedule_corrupted();

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in &addrs {
            if let Some(mut peer) = self.peers.remove(addr) {
                self.intake(*addr, &mut peer, now);
                self.peers.insert(*addr, peer);
            }
        }
        for addr in &addrs {
            if let Some(mut peer) = self.peers.remove(addr) {
                self.apply_policy(*addr, &mut peer, now);
                self.peers.insert(*addr, peer);
            }
        }

        self.report_progress(now);
    }

    fn reclaim_dead_links(&mut self) {
        while self.closing.try_join_next().is_some() {}
        let dead: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|(_, p)| !p.link.is_alive())
            .map(|(a, _)| *a)
            .collect();
        for addr in dead {
            if let Some(peer) = self.peers.remove(&addr) {
                for idx in peer.counted.iter_set() {
                    self.rarity.remove_holder(idx as u32);
                }
                // what it left half requested can be adopted by the other holders
                for piece_idx in self.ledger.partial_of(addr) {
                    for other in self.peers.values_mut() {
                        if other.counted.has(piece_idx as usize) {
                            other.without_downloads = false;
                        }
                    }
                }
                let reason = peer
                    .link
                    .failure()
                    .map_or_else(|| "unknown reason".to_string(), |f| f.to_string());
                log::debug!(
                    "peer {addr}: link is down ({reason}), removed ({} peers left)",
                    self.peers.len()
                );
                self.closing.spawn(peer.link.join());
            }
        }
    }

    fn has_room(&self) -> bool {
        self.peers.len() + self.dialing.len() < self.config.max_peers
    }

    fn admit_peers(&mut self) {
        while let Ok(new_link) = self.new_links.try_recv() {
            match new_link {
                NewLink::Failed(addr) => {
                    self.dialing.remove(&addr);
                }
                NewLink::Established(link) => {
                    let addr = link.addr();
                    self.dialing.remove(&addr);
                    if self.peers.contains_key(&addr) || !self.has_room() {
                        log::debug!("peer {addr}: not admitted (duplicate or peer cap reached)");
                        link.close();
                        self.closing.spawn(link.join());
                        continue;
                    }
                    log::debug!("peer {addr}: admitted");
                    self.peers.insert(
                        addr,
                        PeerEntry {
                            link,
                            counted: Bitfield::new(self.storage.num_pieces()),
                            without_downloads: true,
                        },
                    );
                }
            }
        }

        if !self.peer_source.has_new_peers() {
            return;
        }
        let mut bitfield = None;
        for addr in self.peer_source.take_new_peers() {
            if !self.has_room() {
                break;
            }
            if self.peers.contains_key(&addr) || !self.dialing.insert(addr) {
                continue;
            }
            let bitfield = bitfield.get_or_insert_with(|| self.storage.bitfield());
            self.dialer.dial(addr, bitfield.clone());
        }
    }

    fn sweep_timeouts(&mut self, now: Instant) {
        let expired = self.ledger.expired(now, REQUEST_TIMEOUT);
        if expired.is_empty() {
            return;
        }
        for piece_idx in expired {
            self.ledger.remove(piece_idx);
            self.storage.discard_partial(piece_idx);
            log::debug!("piece {piece_idx}: no block for {REQUEST_TIMEOUT:?}, rescheduling");
            self.return_to_pool(piece_idx);
        }
        // which link owes which block is not tracked once pipelined
        for peer in self.peers.values() {
            peer.link.reset_outstanding_requests();
        }
    }

    fn announce_verified(&mut self) {
        for piece_idx in self.storage.take_verified() {
            self.ledger.remove(piece_idx);
            self.rarity.take(piece_idx);
            for peer in self.peers.values_mut() {
                peer.link.send(Command::Have(piece_idx));
            }
        }
    }

    fn reschedule_corrupted(&mut self) {
        for piece_idx in self.storage.take_corrupted() {
            self.ledger.remove(piece_idx);
            self.return_to_pool(piece_idx);
        }
    }

    fn return_to_pool(&mut self, piece_idx: u32) {
        if self.storage.has_piece(piece_idx) {
            return;
        }
        self.rarity.restore(piece_idx);
        for peer in self.peers.values_mut() {
            if peer.counted.has(piece_idx as usize) {
                peer.without_downloads = false;
            }
        }
    }

    fn intake(&mut self, addr: SocketAddr, peer: &mut PeerEntry<L>, now: Instant) {
        if let Some(remote) = peer.link.take_remote_bitfield() {
            for idx in remote.iter_set() {
                self.count_holder(peer, idx as u32);
            }
            log::debug!("peer {addr}: has {} pieces", remote.count());
        }
        while let Some(piece_idx) = peer.link.poll_have() {
            self.count_holder(peer, piece_idx);
        }
        while let Some(block) = peer.link.poll_block() {
            self.accept_block(addr, block, now);
        }
    }

    fn count_holder(&mut self, peer: &mut PeerEntry<L>, piece_idx: u32) {
        if (piece_idx as usize) >= peer.counted.num_pieces() || peer.counted.has(piece_idx as usize)
        {
            return;
        }
        peer.counted.set(piece_idx as usize);
        self.rarity.add_holder(piece_idx);
        if !self.storage.has_piece(piece_idx) {
            peer.without_downloads = false;
        }
    }

    fn accept_block(&mut self, addr: SocketAddr, block: Block, now: Instant) {
        let piece_idx = block.piece_idx;
        let Some(entry) = self.ledger.get_mut(piece_idx) else {
            log::debug!("peer {addr}: unrequested block for piece {piece_idx}, discarded");
            return;
        };
        if entry.owner != addr {
            log::debug!(
                "peer {addr}: block for piece {piece_idx} was requested from {}, discarded",
                entry.owner
            );
            return;
        }
        if block.data.is_empty() || self.storage.has_piece(piece_idx) {
            log::trace!("peer {addr}: empty or redundant block for piece {piece_idx}");
            return;
        }
        entry.last_activity = now;
        if let Err(e) = self.storage.submit_block(piece_idx, block.begin, &block.data) {
            log::error!("could not store block of piece {piece_idx}: {e}");
        }
    }

    fn apply_policy(&mut self, addr: SocketAddr, peer: &mut PeerEntry<L>, now: Instant) {
        let downloading = !self.storage.is_complete();
        let flags = peer.link.flags();
        if flags.am_interested != downloading {
            let command = if downloading {
                Command::Interested
            } else {
                Command::NotInterested
            };
            peer.link.send(command);
        }
        if flags.am_choking == self.config.upload {
            let command = if self.config.upload {
                Command::Unchoke
            } else {
                Command::Choke
            };
            peer.link.send(command);
        }

        let flags = peer.link.flags();
        if flags.am_choking {
            // requests from a choked peer are void
            while peer.link.poll_request().is_some() {}
        } else if flags.peer_interested {
            self.serve_request(addr, peer);
        }

        if flags.am_interested && !flags.peer_choking && !peer.without_downloads {
            self.issue_requests(addr, peer, now);
        }
    }

    fn serve_request(&mut self, addr: SocketAddr, peer: &mut PeerEntry<L>) {
        let Some(request) = peer.link.poll_request() else {
            return;
        };
        match self
            .storage
            .fill_request(request.piece_idx, request.block_begin, request.data_len)
        {
            Ok(Some(data)) => {
                peer.link
                    .send(Command::Piece(request.piece_idx, request.block_begin, data));
            }
            Ok(None) => log::trace!("peer {addr}: cannot serve {request}, data unavailable"),
            Err(e) => log::warn!("peer {addr}: error reading {request}: {e}"),
        }
    }

    /// Next piece to request from this peer: one it already started, then one
    /// a departed peer left half requested, then the rarest it holds.
    fn next_piece(&mut self, addr: SocketAddr, peer: &PeerEntry<L>, now: Instant) -> Option<u32> {
        if let Some(piece_idx) = self.ledger.resumable_by(addr) {
            return Some(piece_idx);
        }
        let peers = &self.peers;
        let orphan = self.ledger.orphan(
            |owner| owner == addr || peers.contains_key(&owner),
            |i| peer.counted.has(i as usize),
        );
        if let Some(piece_idx) = orphan {
            if let Some(entry) = self.ledger.get_mut(piece_idx) {
                log::debug!("peer {addr}: adopting piece {piece_idx} from {}", entry.owner);
                entry.owner = addr;
                entry.last_activity = now;
            }
            return Some(piece_idx);
        }
        let storage = &self.storage;
        let piece_idx = self.rarity.pick(&mut self.rng, |i| {
            peer.counted.has(i as usize) && !storage.has_piece(i)
        })?;
        self.rarity.take(piece_idx);
        self.ledger.open(piece_idx, addr, now);
        Some(piece_idx)
    }

    /// Fills the pipeline of `peer`. A piece's cursor only moves past
    /// requests the link accepted.
    fn issue_requests(&mut self, addr: SocketAddr, peer: &mut PeerEntry<L>, now: Instant) {
        let mut budget = MAX_OUTSTANDING_REQUESTS.saturating_sub(peer.link.outstanding_requests());
        let mut issued = 0;
        while budget > 0 {
            let Some(piece_idx) = self.next_piece(addr, peer, now) else {
                if issued == 0 {
                    peer.without_downloads = true;
                }
                break;
            };
            let piece_len = self.storage.piece_len(piece_idx) as u32;
            let Some(entry) = self.ledger.get_mut(piece_idx) else {
                break;
            };
            let Cursor::Next(mut offset) = entry.cursor else {
                break;
            };
            entry.last_activity = now;
            while budget > 0 && offset < piece_len {
                let data_len = cmp::min(BLOCK_SIZE, piece_len - offset);
                let request = BlockRequest {
                    piece_idx,
                    block_begin: offset,
                    data_len,
                };
                if !peer.link.send(Command::Request(request)) {
                    entry.cursor = Cursor::Next(offset);
                    log::debug!("peer {addr}: link refused {request}, stopped requesting");
                    return;
                }
                offset += data_len;
                budget -= 1;
                issued += 1;
            }
            entry.cursor = if offset >= piece_len {
                Cursor::InFlight
            } else {
                Cursor::Next(offset)
            };
        }
        if issued > 0 {
            log::trace!("peer {addr}: requested {issued} blocks");
        }
    }

    fn report_progress(&mut self, now: Instant) {
        let downloaded = self.storage.downloaded();
        let uploaded = self.storage.uploaded();
        let left = self.storage.bytes_left();
        self.peer_source.report_progress(downloaded, uploaded, left);

        if !self.completed && self.storage.is_complete() {
            self.completed = true;
            log::info!("download complete");
            self.peer_source.request_update();
        }

        if self.peers.is_empty() {
            let since = *self.alone_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= ZERO_PEERS_REPOLL {
                log::info!("no peers for {ZERO_PEERS_REPOLL:?}, asking the tracker for more");
                self.peer_source.request_update();
                self.alone_since = Some(now);
            }
        } else {
            self.alone_since = None;
        }

        if self
            .last_stats
            .map_or(true, |t| now.saturating_duration_since(t) >= LOG_STATS_FREQ)
        {
            self.last_stats = Some(now);
            let have = self.storage.bitfield().count();
            log::info!(
                "pieces: {have}/{}, downloading: {}, peers: {}, downloaded: {}, uploaded: {}, left: {}",
                self.storage.num_pieces(),
                self.ledger.len(),
                self.peers.len(),
                Size::from_bytes(downloaded),
                Size::from_bytes(uploaded),
                Size::from_bytes(left),
            );
        }
    }
}
