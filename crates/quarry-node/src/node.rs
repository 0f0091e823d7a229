//! Quarry Node - wires every component of one logic node together.
//!
//! Architecture:
//! - One listening UDP socket read by the dispatcher; the peer directory
//!   writes through per-peer connected sockets and stamps the listening
//!   address on everything it sends
//! - One task per loop (directory, failure detector, dispatcher, quorum
//!   engine, heartbeat, render push) talking over bounded channels
//! - The game state store is the only shared state

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use quarry_protocol::{
    is_prey, CausalLog, Direction, Message, MessageBody, NodeKeys, Passthrough, PeerId, WireCodec,
    PREY_ID,
};
use quarry_transfer::{TransportConfig, TransportHandle};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::directory::{Directory, DirectoryHandle, PeerEntry, DIRECTORY_QUEUE};
use crate::dispatch::{DispatchConfig, DispatchContext, Dispatcher};
use crate::error::{Error, Result};
use crate::failure::{run_failure_detector, StrikeCounter, STRIKE_OUT};
use crate::grid::{GridValidator, WalledGrid};
use crate::heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatHandle};
use crate::quorum::{
    EngineContext, EngineEvent, MoveCommand, MoveOutcome, QuorumConfig, QuorumEngine,
    SequenceCounter, ACK_QUEUE,
};
use crate::registrar::{Registrar, Registration};
use crate::render::{run_render_loop, GameRenderState, RenderNotifier};
use crate::state::GameState;

/// Configuration for a Quarry node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// UDP listen address; port 0 picks a free one.
    pub bind_addr: SocketAddr,

    /// Ask the registrar for the prey id
    pub wants_prey: bool,

    /// Ack timeout and retry ceilings
    pub quorum: QuorumConfig,

    /// Consecutive send failures before eviction
    pub strike_out: u32,

    /// Unconsumed commitments are pruned after this long
    pub commit_ttl: Duration,

    /// Skip signature checks for senders with no known key (tests only)
    pub allow_unknown_keys: bool,

    /// Pause between re-registration attempts
    pub heartbeat_backoff: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Read `name` from the environment, falling back to `default` when it is
/// unset or does not parse.
pub fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("ignoring invalid {}={:?}", name, raw);
            default
        }),
        Err(_) => default,
    }
}

impl NodeConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Self {
        let defaults = QuorumConfig::default();
        Self {
            bind_addr: env_or(
                "QUARRY_BIND_ADDR",
                SocketAddr::from(([127, 0, 0, 1], 0)),
            ),
            wants_prey: false,
            quorum: QuorumConfig {
                ack_timeout: Duration::from_millis(env_or(
                    "QUARRY_ACK_TIMEOUT_MS",
                    defaults.ack_timeout.as_millis() as u64,
                )),
                lockstep_retries: env_or("QUARRY_PREY_ONLY_RETRIES", defaults.lockstep_retries),
                default_retries: env_or("QUARRY_PLAYER_RETRIES", defaults.default_retries),
            },
            strike_out: env_or("QUARRY_STRIKE_OUT", STRIKE_OUT),
            commit_ttl: Duration::from_millis(env_or("QUARRY_COMMIT_TTL_MS", 30_000)),
            allow_unknown_keys: env_or("QUARRY_ALLOW_UNKNOWN_KEYS", false),
            heartbeat_backoff: Duration::from_secs(1),
        }
    }

    pub fn prey(mut self) -> Self {
        self.wants_prey = true;
        self
    }
}

/// Who this node is. Fixed once registration succeeds.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub id: PeerId,
    pub keys: Arc<NodeKeys>,
    pub address: SocketAddr,
}

/// Pluggable collaborators; defaults come from the registrar's config.
#[derive(Clone)]
pub struct Collaborators {
    /// Overrides the grid built from the registrar's game config.
    pub grid: Option<Arc<dyn GridValidator>>,
    pub causal_log: Arc<dyn CausalLog>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            grid: None,
            causal_log: Arc::new(Passthrough),
        }
    }
}

/// A running node.
pub struct NodeHandle {
    identity: NodeIdentity,
    state: Arc<GameState>,
    directory: DirectoryHandle,
    moves: mpsc::Sender<MoveCommand>,
    view: watch::Receiver<GameRenderState>,
    events: Option<mpsc::Receiver<EngineEvent>>,
    heartbeat: HeartbeatHandle,
    stop_dispatch: oneshot::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn address(&self) -> SocketAddr {
        self.identity.address
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn state(&self) -> Arc<GameState> {
        Arc::clone(&self.state)
    }

    /// Latest render snapshot, updated whenever the board changes.
    pub fn view(&self) -> watch::Receiver<GameRenderState> {
        self.view.clone()
    }

    /// Connected peers, self excluded.
    pub async fn peers(&self) -> Result<Vec<PeerId>> {
        self.directory.peers().await
    }

    /// Abandoned-move notifications. Can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<EngineEvent>> {
        self.events.take()
    }

    /// Queue one step and wait for the quorum engine's verdict.
    ///
    /// Waits for the previous move to resolve first.
    pub async fn submit(&self, direction: Direction) -> Result<MoveOutcome> {
        let (reply, rx) = oneshot::channel();
        self.moves
            .send(MoveCommand {
                direction,
                reply: Some(reply),
            })
            .await
            .map_err(|_| Error::ChannelClosed("moves"))?;
        rx.await.map_err(|_| Error::ChannelClosed("moves"))
    }

    /// Stop every loop of this node.
    pub async fn shutdown(self) {
        self.heartbeat.stop().await;
        let _ = self.stop_dispatch.send(());
        drop(self.moves);
        // The directory and failure detector hold each other's senders.
        for task in self.tasks {
            task.abort();
        }
        info!(id = %self.identity.id, "node stopped");
    }
}

/// Entry point for starting logic nodes.
pub struct Node;

impl Node {
    /// Start a node with the default collaborators.
    pub async fn start(config: NodeConfig, registrar: Arc<dyn Registrar>) -> Result<NodeHandle> {
        Self::start_with(config, registrar, Collaborators::default()).await
    }

    /// Bind, register, spawn every loop, then announce ourselves to the
    /// peers the registrar reported.
    pub async fn start_with(
        config: NodeConfig,
        registrar: Arc<dyn Registrar>,
        collaborators: Collaborators,
    ) -> Result<NodeHandle> {
        let transport = TransportHandle::new(TransportConfig::bound_to(config.bind_addr))
            .await
            .map_err(|e| Error::Network(format!("bind {}: {}", config.bind_addr, e)))?;
        let address = transport
            .local_addr()
            .map_err(|e| Error::Network(e.to_string()))?;

        let keys = Arc::new(NodeKeys::generate());
        let registration = Registration {
            public_key: keys.public_key_string(),
            address,
            wants_prey: config.wants_prey,
        };
        let reply = registrar.register(&registration).await?;
        let identity = NodeIdentity {
            id: reply.id.clone(),
            keys: Arc::clone(&keys),
            address,
        };
        info!(id = %identity.id, %address, peers = reply.peers.len(), "registered");

        let game = reply.config.clone();
        let state = Arc::new(GameState::new());
        if is_prey(&identity.id) {
            state.set_location(&identity.id, game.prey_start).await;
        } else {
            state.set_location(&identity.id, game.player_start).await;
            state.set_location(PREY_ID, game.prey_start).await;
        }

        let grid: Arc<dyn GridValidator> = match collaborators.grid {
            Some(grid) => grid,
            None => Arc::new(WalledGrid::from_config(&game.grid)),
        };
        let codec = WireCodec::new(collaborators.causal_log);
        let sequence = SequenceCounter::new();
        let mut tasks = Vec::new();

        // Peer directory + failure detector
        let (dir_tx, dir_rx) = mpsc::channel(DIRECTORY_QUEUE);
        let (strike_tx, strike_rx) = mpsc::channel(DIRECTORY_QUEUE);
        let (forget_tx, forget_rx) = mpsc::channel(DIRECTORY_QUEUE);
        let directory = DirectoryHandle::new(dir_tx);
        tasks.push(tokio::spawn(
            Directory::new(
                identity.id.clone(),
                Arc::new(transport.clone()),
                codec.clone(),
                Arc::clone(&state),
                dir_rx,
                strike_tx,
                forget_tx,
            )
            .with_reply_addr(address)
            .run(),
        ));
        tasks.push(tokio::spawn(run_failure_detector(
            StrikeCounter::new(config.strike_out),
            strike_rx,
            directory.clone(),
        )));

        // Render push
        let (render, pokes) = RenderNotifier::channel();
        let (view_tx, view) = watch::channel(state.render_state(&identity.id).await);
        tasks.push(tokio::spawn(run_render_loop(
            identity.id.clone(),
            Arc::clone(&state),
            pokes,
            view_tx,
        )));

        // Dispatcher
        let (acks_tx, acks_rx) = mpsc::channel(ACK_QUEUE);
        let (stop_dispatch, stop_rx) = oneshot::channel();
        let dispatcher = Dispatcher::new(
            DispatchContext {
                self_id: identity.id.clone(),
                self_addr: address,
                keys: Arc::clone(&keys),
                transport,
                codec,
                state: Arc::clone(&state),
                directory: directory.clone(),
                grid: Arc::clone(&grid),
                sequence: sequence.clone(),
                acks: acks_tx,
                render: render.clone(),
            },
            DispatchConfig {
                catch_worth: game.catch_worth,
                allow_unknown_keys: config.allow_unknown_keys,
                commit_ttl: config.commit_ttl,
            },
        );
        tasks.push(tokio::spawn(dispatcher.run(forget_rx, stop_rx)));

        // Quorum engine
        let (moves, moves_rx) = mpsc::channel(1);
        let (events_tx, events) = mpsc::channel(16);
        let engine = QuorumEngine::new(
            EngineContext {
                self_id: identity.id.clone(),
                keys: Arc::clone(&keys),
                state: Arc::clone(&state),
                directory: directory.clone(),
                grid,
                sequence,
                render,
                catch_worth: game.catch_worth,
            },
            config.quorum.clone(),
            acks_rx,
        )
        .with_events(events_tx);
        tasks.push(tokio::spawn(engine.run(moves_rx)));

        // Heartbeat
        let heartbeat = Heartbeat::new(
            identity.id.clone(),
            registrar,
            registration.clone(),
            directory.clone(),
            HeartbeatConfig {
                interval: game.heartbeat_interval(),
                retry_backoff: config.heartbeat_backoff,
            },
        )
        .spawn();

        // Join: connect to everyone and ask for their view of the game
        let mut joined = 0usize;
        for (id, record) in &reply.peers {
            if *id == identity.id {
                continue;
            }
            let entry = match PeerEntry::from_record(record) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(peer = %id, "skipping peer with bad key: {}", e);
                    continue;
                }
            };
            directory.add(id, entry).await?;
            let hello = MessageBody::Connect {
                public_key: registration.public_key.clone(),
            };
            directory
                .send(id, Message::new(identity.id.clone(), Some(address), hello))
                .await?;
            directory
                .send(
                    id,
                    Message::new(identity.id.clone(), Some(address), MessageBody::GameStateRequest),
                )
                .await?;
            joined += 1;
        }
        if joined == 0 {
            state.mark_initial_state();
            info!("no peers at join, starting from local state");
        }

        Ok(NodeHandle {
            identity,
            state,
            directory,
            moves,
            view,
            events: Some(events),
            heartbeat,
            stop_dispatch,
            tasks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registrar::LocalRegistrar;

    #[test]
    fn env_or_falls_back_on_garbage() {
        std::env::set_var("QUARRY_TEST_ENV_OR", "not-a-number");
        assert_eq!(env_or("QUARRY_TEST_ENV_OR", 7u32), 7);
        std::env::set_var("QUARRY_TEST_ENV_OR", " 12 ");
        assert_eq!(env_or("QUARRY_TEST_ENV_OR", 7u32), 12);
        std::env::remove_var("QUARRY_TEST_ENV_OR");
        assert_eq!(env_or("QUARRY_TEST_ENV_OR", 7u32), 7);
    }

    #[test]
    fn defaults_match_the_protocol_constants() {
        let config = NodeConfig::from_env();
        assert_eq!(config.quorum.ack_timeout, Duration::from_millis(500));
        assert_eq!(config.quorum.lockstep_retries, 5);
        assert_eq!(config.quorum.default_retries, 10);
        assert_eq!(config.strike_out, 3);
        assert!(!config.allow_unknown_keys);
    }

    #[tokio::test]
    async fn lone_node_has_initial_state_and_moves_freely() {
        let registrar = Arc::new(LocalRegistrar::default());
        let node = Node::start(NodeConfig::from_env(), registrar).await.unwrap();
        assert!(node.state().has_initial_state());
        assert_eq!(node.id(), "player1");

        let outcome = node.submit(Direction::Right).await.unwrap();
        assert_eq!(outcome, MoveOutcome::Accepted(quarry_protocol::Coordinate::new(2, 1)));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_address_is_fatal() {
        let registrar = Arc::new(LocalRegistrar::default());
        let first = Node::start(NodeConfig::from_env(), registrar.clone()).await.unwrap();
        let config = NodeConfig {
            bind_addr: first.address(),
            ..NodeConfig::from_env()
        };
        // Either the bind or the registration refuses the second node.
        assert!(Node::start(config, registrar).await.is_err());
        first.shutdown().await;
    }
}
