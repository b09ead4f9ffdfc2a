use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Where requesting of a piece stands.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Cursor {
    /// Offset of the next block to request.
    Next(u32),
    /// Every block was requested, waiting for the trailing ones to arrive.
    InFlight,
}

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Entry {
    pub cursor: Cursor,
    pub owner: SocketAddr,
    pub last_activity: Instant,
}

/// One entry per piece currently being downloaded.
#[derive(Default)]
pub struct Ledger {
    entries: HashMap<u32, Entry>,
}

impl Ledger {
    pub fn new() -> Self {
        Ledger::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get_mut(&mut self, piece_idx: u32) -> Option<&mut Entry> {
        self.entries.get_mut(&piece_idx)
    }

    pub fn open(&mut self, piece_idx: u32, owner: SocketAddr, now: Instant) {
        self.entries.insert(
            piece_idx,
            Entry {
                cursor: Cursor::Next(0),
                owner,
                last_activity: now,
            },
        );
    }

    pub fn remove(&mut self, piece_idx: u32) -> Option<Entry> {
        self.entries.remove(&piece_idx)
    }

    /// Lowest piece `owner` started requesting and can carry on with.
    pub fn resumable_by(&self, owner: SocketAddr) -> Option<u32> {
        self.entries
            .iter()
            .filter(|(_, e)| e.owner == owner && e.cursor != Cursor::InFlight)
            .map(|(i, _)| *i)
            .min()
    }

    /// Pieces `owner` left partially requested.
    pub fn partial_of(&self, owner: SocketAddr) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|(_, e)| e.owner == owner && e.cursor != Cursor::InFlight)
            .map(|(i, _)| *i)
            .collect()
    }

    /// Lowest partially requested piece whose owner is gone and that
    /// `adoptable` accepts.
    pub fn orphan(
        &self,
        is_live: impl Fn(SocketAddr) -> bool,
        adoptable: impl Fn(u32) -> bool,
    ) -> Option<u32> {
        self.entries
            .iter()
            .filter(|(i, e)| e.cursor != Cursor::InFlight && !is_live(e.owner) && adoptable(**i))
            .map(|(i, _)| *i)
            .min()
    }

    /// Pieces with no activity for longer than `timeout`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<u32> {
        let mut expired: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_activity) > timeout)
            .map(|(i, _)| *i)
            .collect();
        expired.sort_unstable();
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn resumable_skips_in_flight_and_foreign_entries() {
        let now = Instant::now();
        let mut ledger = Ledger::new();
        ledger.open(4, addr(1), now);
        ledger.open(2, addr(1), now);
        ledger.open(1, addr(2), now);
        ledger.get_mut(2).unwrap().cursor = Cursor::InFlight;
        assert_eq!(ledger.resumable_by(addr(1)), Some(4));
        assert_eq!(ledger.resumable_by(addr(3)), None);
    }

    #[test]
    fn orphans_belong_to_dead_owners() {
        let now = Instant::now();
        let mut ledger = Ledger::new();
        ledger.open(3, addr(1), now);
        ledger.open(5, addr(2), now);
        ledger.get_mut(5).unwrap().cursor = Cursor::Next(16384);
        assert_eq!(ledger.orphan(|a| a == addr(1), |_| true), Some(5));
        assert_eq!(ledger.orphan(|a| a == addr(1), |i| i != 5), None);
        ledger.get_mut(5).unwrap().cursor = Cursor::InFlight;
        assert_eq!(ledger.orphan(|_| false, |_| true), Some(3));
    }

    #[test]
    fn partial_pieces_of_an_owner() {
        let now = Instant::now();
        let mut ledger = Ledger::new();
        ledger.open(1, addr(1), now);
        ledger.open(2, addr(1), now);
        ledger.open(3, addr(2), now);
        ledger.get_mut(2).unwrap().cursor = Cursor::InFlight;
        assert_eq!(ledger.partial_of(addr(1)), vec![1]);
        assert!(ledger.partial_of(addr(3)).is_empty());
    }

    #[test]
    fn expiry_follows_last_activity() {
        let start = Instant::now();
        let mut ledger = Ledger::new();
        ledger.open(7, addr(1), start);
        ledger.open(8, addr(1), start + Duration::from_secs(30));
        let timeout = Duration::from_secs(60);
        assert!(ledger.expired(start + Duration::from_secs(60), timeout).is_empty());
        assert_eq!(ledger.expired(start + Duration::from_secs(61), timeout), vec![7]);
        assert_eq!(
            ledger.expired(start + Duration::from_secs(120), timeout),
            vec![7, 8]
        );
    }
}
