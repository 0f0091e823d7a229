//! Commit-reveal move validation.
//!
//! Before a player discloses a move it publishes a [`MoveCommit`]: a BLAKE3
//! hash over `(x, y, id)` signed with the player's key. A receiver only
//! applies the later `move` message if the revealed coordinate hashes to a
//! commitment it already holds for that sender and sequence. A third node
//! cannot forge another player's move without that player's key.
//!
//! ```text
//! mover                               receiver
//!   │  moveCommit{seq, H(x,y,id), sig}   │  verify sig, store H under (id, seq)
//!   │ ─────────────────────────────────▶ │
//!   │  move{seq, (x,y), sig}             │  H(x,y,id) == stored? consume, apply
//!   │ ─────────────────────────────────▶ │
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::keys::{self, NodeKeys, SignaturePair};
use crate::types::{Coordinate, PeerId};

/// Unconsumed commitments kept per sender before the oldest is dropped.
pub const MAX_PENDING_PER_PEER: usize = 16;

/// Deterministic commitment hash over a coordinate and the mover's id.
pub fn calculate_hash(coord: Coordinate, id: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&coord.x.to_le_bytes());
    hasher.update(&coord.y.to_le_bytes());
    hasher.update(id.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Sign a commitment hash with this node's key.
pub fn sign_commit(keys: &NodeKeys, hash: &[u8; 32]) -> SignaturePair {
    keys.sign(hash)
}

/// Binding commitment to a not-yet-disclosed move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveCommit {
    pub sequence: u64,
    /// Hex of the 32-byte commitment hash.
    pub hash: String,
    pub signature: SignaturePair,
}

impl MoveCommit {
    /// Commit `id` to moving to `coord` as move number `sequence`.
    pub fn new(keys: &NodeKeys, id: &str, sequence: u64, coord: Coordinate) -> Self {
        let hash = calculate_hash(coord, id);
        Self {
            sequence,
            hash: hex::encode(hash),
            signature: sign_commit(keys, &hash),
        }
    }

    fn hash_bytes(&self) -> Result<[u8; 32]> {
        let bytes = hex::decode(&self.hash).map_err(|_| Error::Malformed("commit hash"))?;
        <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| Error::Malformed("commit hash"))
    }
}

#[derive(Debug, Clone)]
struct PendingCommit {
    hash: String,
    received_at: Instant,
}

/// Verified, not yet consumed commitments, keyed by sender then sequence.
#[derive(Debug, Default)]
pub struct CommitBook {
    pending: HashMap<PeerId, BTreeMap<u64, PendingCommit>>,
}

impl CommitBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify `commit`'s signature against `sender`'s key and store it.
    ///
    /// `key` is `None` only when the caller runs with unknown keys allowed;
    /// the signature check is then skipped. An unconsumed commitment for the
    /// same sender and sequence is never overwritten.
    pub fn verify_commit(
        &mut self,
        sender: &str,
        commit: &MoveCommit,
        key: Option<&VerifyingKey>,
    ) -> Result<()> {
        let hash = commit.hash_bytes()?;
        if let Some(key) = key {
            keys::verify(key, &hash, &commit.signature, sender)
                .map_err(|_| Error::IncorrectPlayer(sender.to_string()))?;
        }

        let commits = self.pending.entry(sender.to_string()).or_default();
        commits.entry(commit.sequence).or_insert_with(|| PendingCommit {
            hash: commit.hash.clone(),
            received_at: Instant::now(),
        });
        while commits.len() > MAX_PENDING_PER_PEER {
            commits.pop_first();
        }
        debug!(sender, sequence = commit.sequence, "stored move commitment");
        Ok(())
    }

    /// Check a revealed move against the stored commitment and consume it.
    ///
    /// Returns false, leaving the book untouched, when no commitment exists
    /// for `(sender, sequence)` or the revealed coordinate does not match it.
    pub fn verify_move_against_commit(
        &mut self,
        sender: &str,
        sequence: u64,
        coord: Coordinate,
    ) -> bool {
        let Some(commits) = self.pending.get_mut(sender) else {
            return false;
        };
        let revealed = hex::encode(calculate_hash(coord, sender));
        match commits.get(&sequence) {
            Some(pending) if pending.hash == revealed => {
                commits.remove(&sequence);
                if commits.is_empty() {
                    self.pending.remove(sender);
                }
                true
            }
            _ => false,
        }
    }

    /// Number of unconsumed commitments held for `sender`.
    pub fn pending_for(&self, sender: &str) -> usize {
        self.pending.get(sender).map_or(0, BTreeMap::len)
    }

    /// Drop everything held for a departed peer.
    pub fn forget(&mut self, sender: &str) {
        self.pending.remove(sender);
    }

    /// Drop commitments older than `ttl`. Returns how many were dropped.
    pub fn prune(&mut self, ttl: Duration) -> usize {
        let mut dropped = 0;
        self.pending.retain(|_, commits| {
            let before = commits.len();
            commits.retain(|_, c| c.received_at.elapsed() < ttl);
            dropped += before - commits.len();
            !commits.is_empty()
        });
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(seed: u8) -> NodeKeys {
        NodeKeys::from_seed([seed; 32])
    }

    #[test]
    fn hash_is_deterministic() {
        let c = Coordinate::new(10, 6);
        assert_eq!(calculate_hash(c, "p1"), calculate_hash(c, "p1"));
        assert_ne!(calculate_hash(c, "p1"), calculate_hash(c, "p2"));
        assert_ne!(calculate_hash(c, "p1"), calculate_hash(Coordinate::new(10, 7), "p1"));
    }

    #[test]
    fn commit_then_reveal() {
        let keys = player(1);
        let coord = Coordinate::new(3, 4);
        let commit = MoveCommit::new(&keys, "p1", 1, coord);

        let mut book = CommitBook::new();
        book.verify_commit("p1", &commit, Some(&keys.verifying_key()))
            .unwrap();
        assert_eq!(book.pending_for("p1"), 1);

        assert!(book.verify_move_against_commit("p1", 1, coord));
        // Consumed exactly once.
        assert!(!book.verify_move_against_commit("p1", 1, coord));
        assert_eq!(book.pending_for("p1"), 0);
    }

    #[test]
    fn single_bit_changes_break_the_reveal() {
        let keys = player(1);
        let coord = Coordinate::new(3, 4);
        let commit = MoveCommit::new(&keys, "p1", 9, coord);
        let mut book = CommitBook::new();
        book.verify_commit("p1", &commit, Some(&keys.verifying_key()))
            .unwrap();

        assert!(!book.verify_move_against_commit("p1", 9, Coordinate::new(2, 4)));
        assert!(!book.verify_move_against_commit("p1", 9, Coordinate::new(3, 5)));
        // Same coordinate claimed under an id one bit away ('p' ^ 1 == 'q').
        assert!(!book.verify_move_against_commit("q1", 9, coord));
        // Mismatches leave the commitment in place.
        assert!(book.verify_move_against_commit("p1", 9, coord));
    }

    #[test]
    fn commit_signed_by_someone_else_is_rejected() {
        let mallory = player(6);
        let alice = player(1);
        let forged = MoveCommit::new(&mallory, "alice", 1, Coordinate::new(1, 1));

        let mut book = CommitBook::new();
        let err = book
            .verify_commit("alice", &forged, Some(&alice.verifying_key()))
            .unwrap_err();
        assert!(matches!(err, Error::IncorrectPlayer(_)));
        assert_eq!(book.pending_for("alice"), 0);
    }

    #[test]
    fn unconsumed_commit_is_not_overwritten() {
        let keys = player(1);
        let first = MoveCommit::new(&keys, "p1", 5, Coordinate::new(1, 1));
        let second = MoveCommit::new(&keys, "p1", 5, Coordinate::new(1, 2));

        let mut book = CommitBook::new();
        let vk = keys.verifying_key();
        book.verify_commit("p1", &first, Some(&vk)).unwrap();
        book.verify_commit("p1", &second, Some(&vk)).unwrap();

        assert!(!book.verify_move_against_commit("p1", 5, Coordinate::new(1, 2)));
        assert!(book.verify_move_against_commit("p1", 5, Coordinate::new(1, 1)));
    }

    #[test]
    fn missing_commit_means_no_match() {
        let mut book = CommitBook::new();
        assert!(!book.verify_move_against_commit("p1", 1, Coordinate::new(0, 0)));
    }

    #[test]
    fn pending_is_bounded_per_peer() {
        let keys = player(2);
        let vk = keys.verifying_key();
        let mut book = CommitBook::new();
        for seq in 0..(MAX_PENDING_PER_PEER as u64 + 4) {
            let commit = MoveCommit::new(&keys, "p2", seq, Coordinate::new(0, 0));
            book.verify_commit("p2", &commit, Some(&vk)).unwrap();
        }
        assert_eq!(book.pending_for("p2"), MAX_PENDING_PER_PEER);
        // Oldest were evicted first.
        assert!(!book.verify_move_against_commit("p2", 0, Coordinate::new(0, 0)));
    }

    #[test]
    fn forget_and_prune() {
        let keys = player(3);
        let mut book = CommitBook::new();
        let commit = MoveCommit::new(&keys, "p3", 1, Coordinate::new(0, 0));
        book.verify_commit("p3", &commit, None).unwrap();
        book.forget("p3");
        assert_eq!(book.pending_for("p3"), 0);

        book.verify_commit("p3", &commit, None).unwrap();
        assert_eq!(book.prune(Duration::from_secs(60)), 0);
        assert_eq!(book.prune(Duration::ZERO), 1);
        assert_eq!(book.pending_for("p3"), 0);
    }
}
