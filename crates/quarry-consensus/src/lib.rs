//! Quorum Acceptance Rules
//!
//! Quarry has no central sequencer. A node's own move becomes authoritative
//! once enough of its currently connected peers acknowledge it.
//!
//! # Scaled Quorum
//!
//! ```text
//! PEERS   ACKS NEEDED   WHY
//! ──────────────────────────────────────────────
//!   0         0         nobody to ask
//!   1         1         lockstep with the prey
//!   2         1         n/2
//!   n>2     n/2 + 1     strict majority
//! ```
//!
//! Tolerates lost and duplicate datagrams plus a minority of silent peers.
//! It does not tolerate a malicious majority.

mod acks;
mod quorum;

pub use acks::AckSet;
pub use quorum::{meets_quorum, required_acks, DEFAULT_RETRY_CEILING, LOCKSTEP_RETRY_CEILING};
