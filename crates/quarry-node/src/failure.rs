//! Strike-based failure detector.
//!
//! The directory reports the outcome of every datagram it writes to a known
//! peer. Consecutive failures accumulate as strikes; at the strike-out
//! threshold the peer is evicted through the directory's removal path.
//! The prey is never struck out.

use std::collections::HashMap;

use quarry_protocol::{is_prey, PeerId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::directory::DirectoryHandle;

/// Consecutive send failures before a peer is evicted.
pub const STRIKE_OUT: u32 = 3;

/// Outcome of one write to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrikeEvent {
    Failed(PeerId),
    Delivered(PeerId),
}

/// Strike bookkeeping, kept separate from the task so it can be tested alone.
#[derive(Debug)]
pub struct StrikeCounter {
    strike_out: u32,
    strikes: HashMap<PeerId, u32>,
}

impl StrikeCounter {
    pub fn new(strike_out: u32) -> Self {
        Self {
            strike_out: strike_out.max(1),
            strikes: HashMap::new(),
        }
    }

    /// Count one failure. Returns true when `peer` has just struck out;
    /// its counter is reset at that point.
    pub fn record_failure(&mut self, peer: &str) -> bool {
        if is_prey(peer) {
            return false;
        }
        let count = self.strikes.entry(peer.to_string()).or_insert(0);
        *count += 1;
        debug!(peer, strikes = *count, "send strike");
        if *count >= self.strike_out {
            self.strikes.remove(peer);
            true
        } else {
            false
        }
    }

    /// Strikes only count while consecutive.
    pub fn record_delivery(&mut self, peer: &str) {
        self.strikes.remove(peer);
    }

    pub fn strikes(&self, peer: &str) -> u32 {
        self.strikes.get(peer).copied().unwrap_or(0)
    }
}

/// Drain strike events until the directory drops its sender.
pub async fn run_failure_detector(
    mut counter: StrikeCounter,
    mut events: mpsc::Receiver<StrikeEvent>,
    directory: DirectoryHandle,
) {
    while let Some(event) = events.recv().await {
        match event {
            StrikeEvent::Delivered(peer) => counter.record_delivery(&peer),
            StrikeEvent::Failed(peer) => {
                if !counter.record_failure(&peer) {
                    continue;
                }
                info!(peer = %peer, "peer struck out, evicting");
                if let Err(e) = directory.remove(&peer).await {
                    warn!(peer = %peer, "eviction failed: {}", e);
                    return;
                }
            }
        }
    }
    debug!("failure detector stopped");
}
