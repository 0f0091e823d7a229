//! Inbound message dispatcher.
//!
//! Owns the UDP receive side, the commit book and the replay window. One
//! task multiplexes three inputs:
//!
//! - datagrams from the socket, decoded and routed by message type
//! - peer ids to forget, sent by the directory when a peer is removed
//! - a prune tick that drops stale commitments
//!
//! Every handler returns a `Result`; failures are logged and the offending
//! datagram has no effect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quarry_protocol::{
    decode_public_key, is_prey, CommitBook, Coordinate, Message, MessageBody, MoveCommit,
    NodeKeys, PeerId, ReplayGuard, SignedMove, WireCodec,
};
use quarry_transfer::{TransportHandle, MAX_DATAGRAM};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::directory::{DirectoryHandle, PeerEntry};
use crate::error::{Error, Result};
use crate::grid::{check_move, GridValidator};
use crate::quorum::{AckNotice, SequenceCounter};
use crate::render::RenderNotifier;
use crate::state::GameState;

/// Rules that shape how strict the dispatcher is.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub catch_worth: i64,
    /// Accept messages from senders whose key we do not have, unchecked.
    pub allow_unknown_keys: bool,
    /// Unconsumed commitments older than this are dropped.
    pub commit_ttl: Duration,
}

/// Handles the dispatcher shares with the rest of the node.
pub struct DispatchContext {
    pub self_id: PeerId,
    pub self_addr: SocketAddr,
    pub keys: Arc<NodeKeys>,
    pub transport: TransportHandle,
    pub codec: WireCodec,
    pub state: Arc<GameState>,
    pub directory: DirectoryHandle,
    pub grid: Arc<dyn GridValidator>,
    pub sequence: SequenceCounter,
    pub acks: mpsc::Sender<AckNotice>,
    pub render: RenderNotifier,
}

pub struct Dispatcher {
    ctx: DispatchContext,
    config: DispatchConfig,
    commits: CommitBook,
    replay: ReplayGuard,
}

impl Dispatcher {
    pub fn new(ctx: DispatchContext, config: DispatchConfig) -> Self {
        Self {
            ctx,
            config,
            commits: CommitBook::new(),
            replay: ReplayGuard::new(),
        }
    }

    /// Listen until `stop` fires or the socket fails.
    pub async fn run(
        mut self,
        mut forget: mpsc::Receiver<PeerId>,
        mut stop: oneshot::Receiver<()>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let ttl = self.config.commit_ttl.max(Duration::from_millis(1));
        let mut prune = interval_at(Instant::now() + ttl, ttl);
        prune.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(id = %self.ctx.self_id, addr = %self.ctx.self_addr, "dispatcher listening");

        loop {
            tokio::select! {
                _ = &mut stop => break,
                received = self.ctx.transport.recv_raw(&mut buf) => {
                    let (len, src) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("UDP recv error: {}", e);
                            continue;
                        }
                    };
                    let msg = match self.ctx.codec.decode(&buf[..len]) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(%src, "dropping undecodable datagram: {}", e);
                            continue;
                        }
                    };
                    let kind = msg.message_type();
                    let from = msg.from.clone();
                    if let Err(e) = self.handle(msg, src).await {
                        warn!(peer = %from, %kind, "message rejected: {}", e);
                    }
                }
                Some(peer) = forget.recv() => {
                    self.commits.forget(&peer);
                    self.replay.forget(&peer);
                    debug!(peer = %peer, "forgot commitments and replay window");
                }
                _ = prune.tick() => {
                    let dropped = self.commits.prune(ttl);
                    if dropped > 0 {
                        debug!(dropped, "pruned stale commitments");
                    }
                }
            }
        }
        debug!("dispatcher stopped");
    }

    /// Route one decoded message.
    pub async fn handle(&mut self, msg: Message, src: SocketAddr) -> Result<()> {
        if msg.from == self.ctx.self_id {
            return Ok(());
        }
        let reply_addr = msg.addr.unwrap_or(src);
        let from = msg.from;
        debug!(peer = %from, kind = %msg.body.message_type(), "received");

        match msg.body {
            MessageBody::Connect { public_key } => {
                self.on_connect(&from, &public_key, reply_addr).await
            }
            MessageBody::Connected => {
                debug!(peer = %from, "connection confirmed");
                Ok(())
            }
            MessageBody::GameStateRequest => {
                let snapshot = self.ctx.state.snapshot().await;
                let reply = self.message(MessageBody::GameState(snapshot));
                self.ctx.directory.send_to_addr(reply_addr, reply).await
            }
            MessageBody::GameState(snapshot) => {
                if self.ctx.state.merge_incoming(&self.ctx.self_id, snapshot).await {
                    self.ctx.render.notify();
                } else {
                    debug!(peer = %from, "initial state already applied, ignoring");
                }
                Ok(())
            }
            MessageBody::MoveCommit(commit) => self.on_commit(&from, &commit, reply_addr).await,
            MessageBody::Move { sequence, signed } => {
                self.on_move(&from, sequence, &signed, reply_addr).await
            }
            MessageBody::Captured { signed, score } => self.on_captured(&from, &signed, score).await,
            MessageBody::Ack { sequence } => {
                let notice = AckNotice { from, sequence };
                if let Err(mpsc::error::TrySendError::Full(n)) = self.ctx.acks.try_send(notice) {
                    debug!(peer = %n.from, seq = n.sequence, "ack queue full, dropping ack");
                }
                Ok(())
            }
        }
    }

    fn message(&self, body: MessageBody) -> Message {
        Message::new(self.ctx.self_id.clone(), Some(self.ctx.self_addr), body)
    }

    async fn on_connect(&self, from: &str, public_key: &str, addr: SocketAddr) -> Result<()> {
        let key = decode_public_key(public_key)?;
        self.ctx
            .directory
            .add(from, PeerEntry { addr, key: Some(key) })
            .await?;
        self.ctx
            .directory
            .send(from, self.message(MessageBody::Connected))
            .await
    }

    /// The sender's directory entry, or `None` if it is unknown and unknown
    /// senders are tolerated.
    async fn sender(&self, from: &str) -> Result<Option<PeerEntry>> {
        match self.ctx.directory.lookup(from).await? {
            Some(entry) if entry.key.is_some() || self.config.allow_unknown_keys => Ok(Some(entry)),
            None if self.config.allow_unknown_keys => Ok(None),
            _ => Err(Error::UnknownPeer(from.to_string())),
        }
    }

    /// Check a signed coordinate against the sender's key.
    async fn authenticate(&self, from: &str, signed: &SignedMove) -> Result<Coordinate> {
        let key = self.sender(from).await?.and_then(|entry| entry.key);
        let coord = match key {
            Some(key) => signed.verify(&key, from)?,
            None => signed.coordinate()?,
        };
        Ok(coord)
    }

    async fn on_commit(&mut self, from: &str, commit: &MoveCommit, addr: SocketAddr) -> Result<()> {
        let key = self.sender(from).await?.and_then(|entry| entry.key);
        if self.replay.is_stale(from, commit.sequence) {
            // A retry of a move already applied; its reveal will only be re-acked.
            debug!(peer = from, seq = commit.sequence, "commitment for applied move, not stored");
        } else {
            self.commits.verify_commit(from, commit, key.as_ref())?;
        }

        // Lockstep: the prey answers each player commitment with its last
        // accepted move, never the one still awaiting quorum.
        if is_prey(&self.ctx.self_id) && !is_prey(from) {
            // Sequence before location; the engine writes them the other way round.
            let sequence = self.ctx.sequence.accepted();
            if let Some(here) = self.ctx.state.location(&self.ctx.self_id).await {
                let body = MessageBody::Move {
                    sequence,
                    signed: SignedMove::sign(&self.ctx.keys, here),
                };
                self.ctx
                    .directory
                    .send_to_addr(addr, self.message(body))
                    .await?;
            }
        }
        Ok(())
    }

    async fn on_move(
        &mut self,
        from: &str,
        sequence: u64,
        signed: &SignedMove,
        addr: SocketAddr,
    ) -> Result<()> {
        let coord = self.authenticate(from, signed).await?;

        if self.replay.matches(from, sequence, coord) {
            debug!(peer = from, seq = sequence, "duplicate move, re-acking");
            return self.ack(sequence, addr).await;
        }
        if self.replay.is_stale(from, sequence) {
            return Err(Error::StaleMove {
                peer: from.to_string(),
                sequence,
            });
        }
        if !is_prey(from) && !self.commits.verify_move_against_commit(from, sequence, coord) {
            return Err(Error::MissingCommitment {
                peer: from.to_string(),
                sequence,
            });
        }

        let prev = self.ctx.state.location(from).await;
        check_move(self.ctx.grid.as_ref(), prev, coord)?;

        self.ctx.state.set_location(from, coord).await;
        self.replay.add(from, sequence, coord);
        self.ack(sequence, addr).await?;
        self.ctx.render.notify();
        debug!(peer = from, seq = sequence, to = %coord, "applied move");
        Ok(())
    }

    async fn ack(&self, sequence: u64, addr: SocketAddr) -> Result<()> {
        self.ctx
            .directory
            .send_to_addr(addr, self.message(MessageBody::Ack { sequence }))
            .await
    }

    async fn on_captured(&self, from: &str, signed: &SignedMove, score: i64) -> Result<()> {
        let coord = self.authenticate(from, signed).await?;
        self.ctx.state.validate_capture(coord).await?;
        self.ctx
            .state
            .check_and_update_score(from, score, self.config.catch_worth)
            .await?;
        info!(peer = from, score, "peer caught the prey");
        self.ctx.render.notify();
        Ok(())
    }
}
