//! Fixed-depth replay windows.
//!
//! Each peer gets a ring of its last [`WINDOW_DEPTH`] `(sequence, coordinate)`
//! pairs. A retried `move` or a late `ack` is only honoured if it still
//! names a pair in the ring. Anything else at or below the newest sequence
//! in the ring is stale.

use std::collections::HashMap;

use crate::types::{Coordinate, PeerId};

/// Entries remembered per peer.
pub const WINDOW_DEPTH: usize = 3;

/// Ring of recent moves for one peer.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    slots: [Option<(u64, Coordinate)>; WINDOW_DEPTH],
    next: usize,
}

impl ReplayWindow {
    /// Push a pair, overwriting the oldest once the ring is full.
    pub fn push(&mut self, sequence: u64, coord: Coordinate) {
        self.slots[self.next] = Some((sequence, coord));
        self.next = (self.next + 1) % WINDOW_DEPTH;
    }

    pub fn contains(&self, sequence: u64, coord: Coordinate) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|&(s, c)| s == sequence && c == coord)
    }

    /// Highest sequence pushed so far.
    pub fn newest(&self) -> Option<u64> {
        self.slots.iter().flatten().map(|&(s, _)| s).max()
    }
}

/// Replay windows for every peer this node has seen moves from (or sent).
#[derive(Debug, Default)]
pub struct ReplayGuard {
    windows: HashMap<PeerId, ReplayWindow>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, peer: &str, sequence: u64, coord: Coordinate) {
        self.windows
            .entry(peer.to_string())
            .or_default()
            .push(sequence, coord);
    }

    /// Whether `(sequence, coord)` is among `peer`'s recent moves.
    pub fn matches(&self, peer: &str, sequence: u64, coord: Coordinate) -> bool {
        self.windows
            .get(peer)
            .is_some_and(|w| w.contains(sequence, coord))
    }

    /// Whether `sequence` is not newer than the last move applied for `peer`.
    pub fn is_stale(&self, peer: &str, sequence: u64) -> bool {
        self.windows
            .get(peer)
            .and_then(ReplayWindow::newest)
            .is_some_and(|newest| sequence <= newest)
    }

    pub fn forget(&mut self, peer: &str) {
        self.windows.remove(peer);
    }
}
