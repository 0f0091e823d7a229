//! Rendezvous/registration service interface.
//!
//! The registrar hands out peer ids, peer lists and the game configuration,
//! and tracks liveness through heartbeats. It has no say in gameplay.
//! [`LocalRegistrar`] is an in-process implementation used by tests and
//! the simulation binary.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use quarry_protocol::{Coordinate, PeerId, PREY_ID};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors surfaced by the registration service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrarError {
    #[error("address {0} already registered")]
    AddressAlreadyRegistered(SocketAddr),

    #[error("public key already registered")]
    KeyAlreadyRegistered,

    #[error("unknown public key")]
    UnknownKey,

    #[error("registrar unreachable: {0}")]
    Disconnected(String),
}

/// How to reach a peer and check its signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: SocketAddr,
    pub public_key: String,
}

/// Board layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridConfig {
    pub width: i32,
    pub height: i32,
    pub walls: Vec<Coordinate>,
}

/// Game parameters handed out at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameConfig {
    /// Registrar liveness window in microseconds; nodes beat twice per window.
    pub global_server_hb_us: u64,
    /// Score awarded per capture.
    pub catch_worth: i64,
    pub player_start: Coordinate,
    pub prey_start: Coordinate,
    pub grid: GridConfig,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            global_server_hb_us: 2_000_000,
            catch_worth: 1,
            player_start: Coordinate::new(1, 1),
            prey_start: Coordinate::new(8, 8),
            grid: GridConfig {
                width: 10,
                height: 10,
                walls: Vec::new(),
            },
        }
    }
}

impl GameConfig {
    /// Period of the heartbeat loop: half the registrar's liveness window.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_micros((self.global_server_hb_us / 2).max(1))
    }
}

/// What a node tells the registrar about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub public_key: String,
    pub address: SocketAddr,
    /// Ask for the reserved prey id.
    pub wants_prey: bool,
}

/// Registrar's answer: our id, who else is around, and the rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationReply {
    pub id: PeerId,
    pub peers: HashMap<PeerId, PeerRecord>,
    pub config: GameConfig,
}

/// Registration service consumed by every node.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(
        &self,
        registration: &Registration,
    ) -> Result<RegistrationReply, RegistrarError>;

    async fn heartbeat(&self, public_key: &str) -> Result<(), RegistrarError>;

    async fn get_nodes(
        &self,
        public_key: &str,
    ) -> Result<HashMap<PeerId, PeerRecord>, RegistrarError>;
}

#[derive(Debug)]
struct LiveNode {
    id: PeerId,
    address: SocketAddr,
    last_seen: Instant,
}

#[derive(Debug)]
struct Inner {
    config: GameConfig,
    live: HashMap<String, LiveNode>,
    /// Ids stay stable for a returning key.
    ids: HashMap<String, PeerId>,
    next_player: u32,
    online: bool,
    registrations: u32,
}

impl Inner {
    fn expire(&mut self) {
        let window = Duration::from_micros(self.config.global_server_hb_us);
        self.live.retain(|_, node| {
            let alive = node.last_seen.elapsed() <= window;
            if !alive {
                info!(id = %node.id, "registrar: node expired");
            }
            alive
        });
    }

    fn peers_except(&self, key: &str) -> HashMap<PeerId, PeerRecord> {
        self.live
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, node)| {
                (
                    node.id.clone(),
                    PeerRecord {
                        address: node.address,
                        public_key: k.clone(),
                    },
                )
            })
            .collect()
    }

    fn ensure_online(&self) -> Result<(), RegistrarError> {
        if self.online {
            Ok(())
        } else {
            Err(RegistrarError::Disconnected("registrar offline".into()))
        }
    }
}

/// In-process registrar.
#[derive(Debug)]
pub struct LocalRegistrar {
    inner: Mutex<Inner>,
}

impl Default for LocalRegistrar {
    fn default() -> Self {
        Self::new(GameConfig::default())
    }
}

impl LocalRegistrar {
    pub fn new(config: GameConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                config,
                live: HashMap::new(),
                ids: HashMap::new(),
                next_player: 1,
                online: true,
                registrations: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate the service going away (every call fails with `Disconnected`).
    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    /// Forget a live registration as if its heartbeats had stopped.
    pub fn expire(&self, public_key: &str) {
        self.lock().live.remove(public_key);
    }

    /// Successful `register` calls so far.
    pub fn registrations(&self) -> u32 {
        self.lock().registrations
    }
}

#[async_trait]
impl Registrar for LocalRegistrar {
    async fn register(
        &self,
        registration: &Registration,
    ) -> Result<RegistrationReply, RegistrarError> {
        let mut inner = self.lock();
        inner.ensure_online()?;
        inner.expire();

        let key = registration.public_key.as_str();
        if inner.live.contains_key(key) {
            return Err(RegistrarError::KeyAlreadyRegistered);
        }
        if inner
            .live
            .values()
            .any(|node| node.address == registration.address)
        {
            return Err(RegistrarError::AddressAlreadyRegistered(
                registration.address,
            ));
        }

        let known = inner.ids.get(key).cloned();
        let id = match known {
            Some(id) => id,
            None => {
                let prey_taken = inner.ids.values().any(|id| id == PREY_ID);
                let id = if registration.wants_prey && !prey_taken {
                    PREY_ID.to_string()
                } else {
                    let n = inner.next_player;
                    inner.next_player += 1;
                    format!("player{n}")
                };
                inner.ids.insert(key.to_string(), id.clone());
                id
            }
        };

        let peers = inner.peers_except(key);
        inner.live.insert(
            key.to_string(),
            LiveNode {
                id: id.clone(),
                address: registration.address,
                last_seen: Instant::now(),
            },
        );
        inner.registrations += 1;
        info!(%id, addr = %registration.address, peers = peers.len(), "registrar: node registered");

        Ok(RegistrationReply {
            id,
            peers,
            config: inner.config.clone(),
        })
    }

    async fn heartbeat(&self, public_key: &str) -> Result<(), RegistrarError> {
        let mut inner = self.lock();
        inner.ensure_online()?;
        let node = inner
            .live
            .get_mut(public_key)
            .ok_or(RegistrarError::UnknownKey)?;
        node.last_seen = Instant::now();
        debug!(id = %node.id, "registrar: heartbeat");
        Ok(())
    }

    async fn get_nodes(
        &self,
        public_key: &str,
    ) -> Result<HashMap<PeerId, PeerRecord>, RegistrarError> {
        let mut inner = self.lock();
        inner.ensure_online()?;
        inner.expire();
        if !inner.live.contains_key(public_key) {
            return Err(RegistrarError::UnknownKey);
        }
        Ok(inner.peers_except(public_key))
    }
}
