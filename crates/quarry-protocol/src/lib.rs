//! Quarry Protocol - commit-reveal moves and the node-to-node wire format
//!
//! Everything two logic nodes need to agree on before they can talk:
//!
//! - **Types**: [`PeerId`], [`Coordinate`], [`Direction`], [`GameSnapshot`]
//! - **Keys**: Ed25519 node keys, hex string encodings, `(r, s)` signatures
//! - **Commit-reveal**: [`MoveCommit`] and the receiver-side [`CommitBook`]
//! - **Replay guard**: 3-deep per-peer windows of recent moves
//! - **Wire**: JSON [`Envelope`] decoded into a closed [`Message`] enum
//!
//! # Example
//!
//! ```rust
//! use quarry_protocol::{CommitBook, Coordinate, MoveCommit, NodeKeys};
//!
//! let keys = NodeKeys::generate();
//! let target = Coordinate::new(3, 4);
//! let commit = MoveCommit::new(&keys, "player1", 1, target);
//!
//! let mut book = CommitBook::new();
//! book.verify_commit("player1", &commit, Some(&keys.verifying_key())).unwrap();
//! assert!(book.verify_move_against_commit("player1", 1, target));
//! ```

pub mod commit;
pub mod error;
pub mod keys;
pub mod replay;
pub mod types;
pub mod wire;

pub use commit::{calculate_hash, sign_commit, CommitBook, MoveCommit};
pub use error::{Error, Result};
pub use keys::{decode_public_key, encode_public_key, NodeKeys, SignaturePair};
pub use replay::{ReplayGuard, ReplayWindow, WINDOW_DEPTH};
pub use types::{is_prey, Coordinate, Direction, GameSnapshot, PeerId, PREY_ID};
pub use wire::{
    CausalLog, Envelope, Message, MessageBody, MessageType, Passthrough, SignedMove, WireCodec,
};

// Re-export the key type so callers don't need their own ed25519 dependency
pub use ed25519_dalek::VerifyingKey;
