//! Acknowledgement bookkeeping for the move currently awaiting quorum.

use std::collections::{BTreeMap, HashSet};

/// Distinct acking peers per sequence number.
///
/// Entries strictly older than the awaited sequence are dropped on every
/// insert, so late acks for abandoned or accepted moves never pile up.
#[derive(Debug, Default, Clone)]
pub struct AckSet {
    acks: BTreeMap<u64, HashSet<String>>,
}

impl AckSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an ack from `peer` for `sequence` while `awaited` is outstanding.
    ///
    /// Returns true if this peer had not acked this sequence before.
    pub fn record(&mut self, awaited: u64, sequence: u64, peer: &str) -> bool {
        self.prune_before(awaited);
        if sequence < awaited {
            return false;
        }
        self.acks
            .entry(sequence)
            .or_default()
            .insert(peer.to_string())
    }

    /// Number of distinct peers that acked `sequence`.
    pub fn count(&self, sequence: u64) -> usize {
        self.acks.get(&sequence).map_or(0, HashSet::len)
    }

    /// Drop everything recorded for `sequence`.
    pub fn clear(&mut self, sequence: u64) {
        self.acks.remove(&sequence);
    }

    /// Drop every entry strictly older than `sequence`.
    pub fn prune_before(&mut self, sequence: u64) {
        self.acks = self.acks.split_off(&sequence);
    }
}
