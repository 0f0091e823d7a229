//! Quorum Acceptance Engine.
//!
//! Owns the node's single outstanding move. Each local move is
//! grid-checked, committed, announced, then applied only once enough
//! distinct peers have acked it (see [`quarry_consensus::required_acks`]).
//! Moves that never reach quorum are retried with the same sequence and
//! eventually abandoned; the player stays where it last was accepted.
//!
//! ```text
//! submit(dir) ─▶ validate ─▶ seq = next() ─▶ announce ─▶ await acks ─┬─▶ accept
//!                                               ▲                    │
//!                                               └──── retry < ceil ◀─┴─▶ abandon
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quarry_consensus::{meets_quorum, AckSet, DEFAULT_RETRY_CEILING, LOCKSTEP_RETRY_CEILING};
use quarry_protocol::{
    is_prey, Coordinate, Direction, Message, MessageBody, MoveCommit, NodeKeys, PeerId,
    ReplayGuard, SignedMove,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::directory::DirectoryHandle;
use crate::error::{GameError, Result};
use crate::grid::{check_move, GridValidator};
use crate::render::RenderNotifier;
use crate::state::GameState;

/// Capacity of the dispatcher → engine ack queue.
pub const ACK_QUEUE: usize = 30;

/// Timing and retry budget for move acceptance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumConfig {
    /// How long one attempt waits for acks.
    pub ack_timeout: Duration,
    /// Attempts when the prey is the only peer.
    pub lockstep_retries: u32,
    /// Attempts otherwise.
    pub default_retries: u32,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(500),
            lockstep_retries: LOCKSTEP_RETRY_CEILING,
            default_retries: DEFAULT_RETRY_CEILING,
        }
    }
}

impl QuorumConfig {
    pub fn retry_ceiling(&self, peers: usize) -> u32 {
        if peers == 1 {
            self.lockstep_retries
        } else {
            self.default_retries
        }
    }
}

/// Per-node move sequence. Shared with the dispatcher, which reads the
/// last accepted value for lockstep replies.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter(Arc<Counters>);

#[derive(Debug, Default)]
struct Counters {
    issued: AtomicU64,
    accepted: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next sequence number (the first is 1).
    pub fn next(&self) -> u64 {
        self.0.issued.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record that `sequence` reached quorum and was applied locally.
    pub fn mark_accepted(&self, sequence: u64) {
        self.0.accepted.fetch_max(sequence, Ordering::AcqRel);
    }

    /// Last sequence applied locally; 0 before the first accepted move.
    pub fn accepted(&self) -> u64 {
        self.0.accepted.load(Ordering::Acquire)
    }
}

/// An ack for one of our moves, as forwarded by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckNotice {
    pub from: PeerId,
    pub sequence: u64,
}

/// The one move in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingMove {
    pub sequence: u64,
    pub coordinate: Coordinate,
    pub rejection_count: u32,
}

/// How a submitted move ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    Accepted(Coordinate),
    /// Retry budget exhausted without quorum.
    Abandoned { sequence: u64, coordinate: Coordinate },
    /// Failed local validation, nothing was sent.
    Rejected(GameError),
}

/// Emitted for embedders that want to react to engine decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A move was dropped after its last retry; local state may now lag peers.
    Abandoned { sequence: u64, coordinate: Coordinate },
}

/// A move request queued by the node handle.
#[derive(Debug)]
pub struct MoveCommand {
    pub direction: Direction,
    pub reply: Option<oneshot::Sender<MoveOutcome>>,
}

/// Everything the engine needs from the rest of the node.
pub struct EngineContext {
    pub self_id: PeerId,
    pub keys: Arc<NodeKeys>,
    pub state: Arc<GameState>,
    pub directory: DirectoryHandle,
    pub grid: Arc<dyn GridValidator>,
    pub sequence: SequenceCounter,
    pub render: RenderNotifier,
    pub catch_worth: i64,
}

pub struct QuorumEngine {
    ctx: EngineContext,
    config: QuorumConfig,
    acks_rx: mpsc::Receiver<AckNotice>,
    acks: AckSet,
    sent: ReplayGuard,
    events: Option<mpsc::Sender<EngineEvent>>,
}

impl QuorumEngine {
    pub fn new(ctx: EngineContext, config: QuorumConfig, acks_rx: mpsc::Receiver<AckNotice>) -> Self {
        Self {
            ctx,
            config,
            acks_rx,
            acks: AckSet::new(),
            sent: ReplayGuard::new(),
            events: None,
        }
    }

    /// Report abandoned moves on `events`.
    pub fn with_events(mut self, events: mpsc::Sender<EngineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Resolve queued moves one at a time until the queue closes.
    pub async fn run(mut self, mut moves: mpsc::Receiver<MoveCommand>) {
        while let Some(cmd) = moves.recv().await {
            let outcome = match self.submit(cmd.direction).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("quorum engine stopping: {}", e);
                    return;
                }
            };
            if let Some(reply) = cmd.reply {
                let _ = reply.send(outcome);
            }
        }
        debug!("quorum engine stopped");
    }

    /// Validate one step in `direction` and drive it to a decision.
    pub async fn submit(&mut self, direction: Direction) -> Result<MoveOutcome> {
        let self_id = self.ctx.self_id.clone();
        let from = self.ctx.state.location(&self_id).await;
        let Some(from) = from else {
            return Ok(MoveOutcome::Rejected(GameError::UnknownPlayer(self_id)));
        };
        let target = from.step(direction);
        if let Err(e) = check_move(self.ctx.grid.as_ref(), Some(from), target) {
            debug!(%from, %target, "local move rejected: {}", e);
            return Ok(MoveOutcome::Rejected(e));
        }

        let pending = PendingMove {
            sequence: self.ctx.sequence.next(),
            coordinate: target,
            rejection_count: 0,
        };
        self.drive(pending).await
    }

    /// Announce and retry `pending` until it is accepted or abandoned.
    pub async fn drive(&mut self, mut pending: PendingMove) -> Result<MoveOutcome> {
        loop {
            let peers = self.ctx.directory.count().await?;
            if peers == 0 {
                self.accept(&pending).await?;
                return Ok(MoveOutcome::Accepted(pending.coordinate));
            }

            self.announce(&pending).await?;
            let acks = self.await_quorum(&pending, peers).await;
            if meets_quorum(peers, acks) {
                self.accept(&pending).await?;
                return Ok(MoveOutcome::Accepted(pending.coordinate));
            }

            pending.rejection_count += 1;
            let ceiling = self.config.retry_ceiling(peers);
            if pending.rejection_count >= ceiling {
                self.abandon(&pending);
                return Ok(MoveOutcome::Abandoned {
                    sequence: pending.sequence,
                    coordinate: pending.coordinate,
                });
            }
            debug!(
                seq = pending.sequence,
                acks,
                peers,
                attempt = pending.rejection_count,
                "quorum not met, retrying"
            );
        }
    }

    /// Broadcast the commitment (players only), then the signed move.
    pub async fn announce(&mut self, pending: &PendingMove) -> Result<()> {
        let ctx = &self.ctx;
        if !is_prey(&ctx.self_id) {
            let commit = MoveCommit::new(&ctx.keys, &ctx.self_id, pending.sequence, pending.coordinate);
            ctx.directory
                .broadcast(Message::new(
                    ctx.self_id.clone(),
                    None,
                    MessageBody::MoveCommit(commit),
                ))
                .await?;
        }
        let body = MessageBody::Move {
            sequence: pending.sequence,
            signed: SignedMove::sign(&ctx.keys, pending.coordinate),
        };
        ctx.directory
            .broadcast(Message::new(ctx.self_id.clone(), None, body))
            .await?;
        self.sent
            .add(&ctx.self_id, pending.sequence, pending.coordinate);
        Ok(())
    }

    /// Collect acks for `pending` until quorum or the attempt deadline.
    /// Returns the distinct ack count.
    pub async fn await_quorum(&mut self, pending: &PendingMove, peers: usize) -> usize {
        let deadline = Instant::now() + self.config.ack_timeout;
        let seq = pending.sequence;
        while !meets_quorum(peers, self.acks.count(seq)) {
            match timeout_at(deadline, self.acks_rx.recv()).await {
                Ok(Some(ack)) => {
                    // Only acks for what we actually sent count.
                    if ack.sequence == seq
                        && self.sent.matches(&self.ctx.self_id, seq, pending.coordinate)
                    {
                        self.acks.record(seq, ack.sequence, &ack.from);
                    } else {
                        self.acks.prune_before(seq);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        self.acks.count(seq)
    }

    /// Commit `pending` to local state and settle any capture it makes.
    pub async fn accept(&mut self, pending: &PendingMove) -> Result<()> {
        let ctx = &self.ctx;
        ctx.state.set_location(&ctx.self_id, pending.coordinate).await;
        // Location first: a lockstep reply may pair an older sequence with
        // the new cell, never this sequence with the old one.
        ctx.sequence.mark_accepted(pending.sequence);
        self.acks.clear(pending.sequence);
        ctx.render.notify();
        debug!(seq = pending.sequence, to = %pending.coordinate, "move accepted");

        if is_prey(&ctx.self_id) || ctx.state.prey_location().await != Some(pending.coordinate) {
            return Ok(());
        }
        match ctx.state.award_catch(&ctx.self_id, ctx.catch_worth).await {
            Ok(score) => {
                info!(at = %pending.coordinate, score, "caught the prey");
                ctx.render.notify();
                let body = MessageBody::Captured {
                    signed: SignedMove::sign(&ctx.keys, pending.coordinate),
                    score,
                };
                ctx.directory
                    .broadcast(Message::new(ctx.self_id.clone(), None, body))
                    .await?;
            }
            Err(e) => warn!("capture not scored: {}", e),
        }
        Ok(())
    }

    fn abandon(&mut self, pending: &PendingMove) {
        warn!(
            seq = pending.sequence,
            to = %pending.coordinate,
            attempts = pending.rejection_count,
            "move abandoned without quorum"
        );
        self.acks.clear(pending.sequence);
        if let Some(events) = &self.events {
            let _ = events.try_send(EngineEvent::Abandoned {
                sequence: pending.sequence,
                coordinate: pending.coordinate,
            });
        }
    }
}
