//! Peer-count scaled acceptance threshold for locally originated moves.
//!
//! The threshold scales with the number of connected peers `n` (self excluded):
//! - 0 peers → 0 acks (a lone node is authoritative over itself)
//! - 1 peer → 1 ack (only the prey is around, lockstep with it)
//! - 2 peers → n/2 = 1 ack
//! - n > 2 → strict majority, more than n/2 acks
//!
//! This is a loss-tolerance heuristic, not Byzantine agreement.

/// Retry ceiling when the prey is the only connected peer.
pub const LOCKSTEP_RETRY_CEILING: u32 = 5;

/// Retry ceiling when other players are connected.
pub const DEFAULT_RETRY_CEILING: u32 = 10;

/// Minimum number of distinct acking peers required for `peers` connected peers.
///
/// # Examples
///
/// ```
/// use quarry_consensus::required_acks;
///
/// assert_eq!(required_acks(0), 0);
/// assert_eq!(required_acks(1), 1);
/// assert_eq!(required_acks(2), 1);
/// assert_eq!(required_acks(5), 3);
/// ```
pub const fn required_acks(peers: usize) -> usize {
    match peers {
        0 => 0,
        1 => 1,
        2 => peers / 2,
        _ => peers / 2 + 1,
    }
}

/// Check if `acks` distinct acknowledgements satisfy the quorum for `peers`.
pub const fn meets_quorum(peers: usize, acks: usize) -> bool {
    acks >= required_acks(peers)
}
