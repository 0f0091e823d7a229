//! Error types for the Quarry node.

use quarry_protocol::{Coordinate, PeerId};
use thiserror::Error;

use crate::registrar::RegistrarError;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Game rule violations found while validating inbound or local moves.
///
/// None of these are fatal; the offending message simply has no effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    /// Out of bounds, into a wall, or more than one cell away.
    #[error("invalid move to {coord}: {reason}")]
    InvalidMove {
        coord: Coordinate,
        reason: &'static str,
    },

    /// Claimed capture is not where the prey is.
    #[error("invalid prey capture at {claimed} (prey at {prey:?})")]
    InvalidPreyCapture {
        claimed: Coordinate,
        prey: Option<Coordinate>,
    },

    /// Score delta is not exactly one catch.
    #[error("invalid score update for {player}: claimed {claimed}, expected {expected}")]
    InvalidScoreUpdate {
        player: PeerId,
        claimed: i64,
        expected: i64,
    },

    /// Player has never had a location on this node.
    #[error("unknown player: {0}")]
    UnknownPlayer(PeerId),
}

/// Errors that can occur in node operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Game rule violation
    #[error("Game error: {0}")]
    Game(#[from] GameError),

    /// Wire or signature error
    #[error("Protocol error: {0}")]
    Protocol(#[from] quarry_protocol::Error),

    /// Registration service error
    #[error("Registration error: {0}")]
    Registrar(#[from] RegistrarError),

    /// Socket setup error
    #[error("Network error: {0}")]
    Network(String),

    /// Sender is not in the peer table and unknown keys are not allowed
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// A revealed move with no matching verified commitment
    #[error("no commitment from {peer} for sequence {sequence}")]
    MissingCommitment { peer: PeerId, sequence: u64 },

    /// A move at or below the sender's last applied sequence
    #[error("stale move from {peer}: sequence {sequence} already superseded")]
    StaleMove { peer: PeerId, sequence: u64 },

    /// A node task went away
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
