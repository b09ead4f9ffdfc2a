use std::collections::BTreeSet;

use rand::seq::SliceRandom;
use rand::Rng;

/// Per piece count of connected peers holding it, plus the pieces still
/// waiting to be requested grouped by that count (rarest group first).
///
/// A piece is "pooled" while it is neither verified nor claimed by a request
/// ledger entry; only pooled pieces held by at least one peer appear in a
/// group.
pub struct RarityTable {
    holders: Vec<usize>,
    pooled: Vec<bool>,
    groups: Vec<BTreeSet<u32>>, // groups[n - 1]: pooled pieces held by n peers
}

impl RarityTable {
    pub fn new(num_pieces: usize) -> Self {
        RarityTable {
            holders: vec![0; num_pieces],
            pooled: vec![true; num_pieces],
            groups: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn holders(&self, piece_idx: u32) -> usize {
        self.holders[piece_idx as usize]
    }

    #[cfg(test)]
    pub fn is_pooled(&self, piece_idx: u32) -> bool {
        self.pooled[piece_idx as usize]
    }

    pub fn add_holder(&mut self, piece_idx: u32) {
        let idx = piece_idx as usize;
        self.ungroup(piece_idx);
        self.holders[idx] += 1;
        self.group(piece_idx);
    }

    pub fn remove_holder(&mut self, piece_idx: u32) {
        let idx = piece_idx as usize;
        self.ungroup(piece_idx);
        self.holders[idx] = self.holders[idx].saturating_sub(1);
        self.group(piece_idx);
    }

    /// Takes the piece out of the pool, it is being requested or is verified.
    pub fn take(&mut self, piece_idx: u32) {
        self.ungroup(piece_idx);
        self.pooled[piece_idx as usize] = false;
    }

    /// Puts the piece back in the pool so it can be requested again.
    pub fn restore(&mut self, piece_idx: u32) {
        if !self.pooled[piece_idx as usize] {
            self.pooled[piece_idx as usize] = true;
            self.group(piece_idx);
        }
    }

    /// First pooled piece accepted by `eligible`, scanning groups from the
    /// rarest; ties inside a group are broken at random. The piece stays
    /// pooled until [`RarityTable::take`] is called.
    pub fn pick<R: Rng>(&self, rng: &mut R, eligible: impl Fn(u32) -> bool) -> Option<u32> {
        for group in &self.groups {
            let mut candidates: Vec<u32> = group.iter().copied().filter(|i| eligible(*i)).collect();
            if candidates.is_empty() {
                continue;
            }
            candidates.shuffle(rng);
            return candidates.first().copied();
        }
        None
    }

    fn group(&mut self, piece_idx: u32) {
        let holders = self.holders[piece_idx as usize];
        if holders == 0 || !self.pooled[piece_idx as usize] {
            return;
        }
        if self.groups.len() < holders {
            self.groups.resize_with(holders, BTreeSet::new);
        }
        self.groups[holders - 1].insert(piece_idx);
    }

    fn ungroup(&mut self, piece_idx: u32) {
        let holders = self.holders[piece_idx as usize];
        if holders > 0 && holders <= self.groups.len() {
            self.groups[holders - 1].remove(&piece_idx);
        }
    }
}
