//! Registrar heartbeat loop.
//!
//! Beats every half liveness window. When a beat fails the node assumes the
//! registrar lost track of it and re-registers every `retry_backoff` until it
//! gets through, then adds whatever peers the registrar reports and resumes
//! beating on the (possibly new) interval.

use std::sync::Arc;
use std::time::Duration;

use quarry_protocol::{Message, MessageBody, PeerId};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::directory::{DirectoryHandle, PeerEntry};
use crate::registrar::{Registrar, RegistrarError, Registration, RegistrationReply};

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Beat period.
    pub interval: Duration,
    /// Pause between failed re-registration attempts.
    pub retry_backoff: Duration,
}

impl HeartbeatConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Stops the heartbeat task.
#[derive(Debug)]
pub struct HeartbeatHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Signal the loop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

pub struct Heartbeat {
    self_id: PeerId,
    registrar: Arc<dyn Registrar>,
    registration: Registration,
    directory: DirectoryHandle,
    config: HeartbeatConfig,
}

impl Heartbeat {
    pub fn new(
        self_id: PeerId,
        registrar: Arc<dyn Registrar>,
        registration: Registration,
        directory: DirectoryHandle,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            self_id,
            registrar,
            registration,
            directory,
            config,
        }
    }

    pub fn spawn(self) -> HeartbeatHandle {
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(stop_rx));
        HeartbeatHandle { stop, task }
    }

    fn ticker(period: Duration) -> Interval {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        let mut ticker = Self::ticker(self.config.interval);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    let beat = self.registrar.heartbeat(&self.registration.public_key).await;
                    let Err(e) = beat else { continue };
                    warn!("heartbeat failed: {}, re-registering", e);
                    if !self.reregister(&mut stop).await {
                        break;
                    }
                    ticker = Self::ticker(self.config.interval);
                }
            }
        }
        debug!("heartbeat stopped");
    }

    /// Retry registration until it succeeds. Returns false if stopped first.
    async fn reregister(&mut self, stop: &mut oneshot::Receiver<()>) -> bool {
        loop {
            match self.registrar.register(&self.registration).await {
                Ok(reply) => {
                    info!(id = %reply.id, peers = reply.peers.len(), "re-registered");
                    self.adopt(reply).await;
                    return true;
                }
                Err(RegistrarError::KeyAlreadyRegistered) => {
                    debug!("registrar still knows us");
                    return true;
                }
                Err(e) => warn!("re-registration failed: {}", e),
            }
            tokio::select! {
                _ = &mut *stop => return false,
                _ = sleep(self.config.retry_backoff) => {}
            }
        }
    }

    /// Take on the registrar's view: new interval, and any peers it reports.
    async fn adopt(&mut self, reply: RegistrationReply) {
        self.config.interval = reply.config.heartbeat_interval();
        let connect = MessageBody::Connect {
            public_key: self.registration.public_key.clone(),
        };
        for (id, record) in reply.peers {
            if id == self.self_id {
                continue;
            }
            let entry = match PeerEntry::from_record(&record) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(peer = %id, "skipping peer with bad key: {}", e);
                    continue;
                }
            };
            let msg = Message::new(
                self.self_id.clone(),
                Some(self.registration.address),
                connect.clone(),
            );
            let sent = async {
                self.directory.add(&id, entry).await?;
                self.directory.send(&id, msg).await
            };
            if let Err(e) = sent.await {
                warn!(peer = %id, "could not add peer: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use quarry_protocol::{NodeKeys, WireCodec};
    use quarry_transfer::Link;
    use tokio::sync::mpsc;

    use crate::directory::{Directory, DIRECTORY_QUEUE};
    use crate::registrar::{GameConfig, LocalRegistrar};
    use crate::state::GameState;

    struct Sink;

    #[async_trait::async_trait]
    impl Link for Sink {
        async fn send_to(&self, _data: &[u8], _addr: SocketAddr) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn directory() -> DirectoryHandle {
        let (tx, rx) = mpsc::channel(DIRECTORY_QUEUE);
        let (strike_tx, _strike_rx) = mpsc::channel(DIRECTORY_QUEUE);
        let (forget_tx, _forget_rx) = mpsc::channel(DIRECTORY_QUEUE);
        tokio::spawn(
            Directory::new(
                "player1".into(),
                Arc::new(Sink),
                WireCodec::default(),
                Arc::new(GameState::new()),
                rx,
                strike_tx,
                forget_tx,
            )
            .run(),
        );
        DirectoryHandle::new(tx)
    }

    fn registration(seed: u8, port: u16) -> Registration {
        Registration {
            public_key: NodeKeys::from_seed([seed; 32]).public_key_string(),
            address: SocketAddr::from(([127, 0, 0, 1], port)),
            wants_prey: false,
        }
    }

    fn fast() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(10),
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn reregisters_after_being_forgotten_and_learns_peers() {
        let registrar = Arc::new(LocalRegistrar::new(GameConfig {
            global_server_hb_us: 60_000_000,
            ..Default::default()
        }));
        let me = registration(1, 7001);
        let reply = registrar.register(&me).await.unwrap();
        registrar.register(&registration(2, 7002)).await.unwrap();

        let dir = directory();
        let handle = Heartbeat::new(reply.id, registrar.clone(), me.clone(), dir.clone(), fast())
            .spawn();

        registrar.expire(&me.public_key);
        assert!(eventually(|| registrar.registrations() == 3).await);

        let mut learned = false;
        for _ in 0..200 {
            if dir.count().await.unwrap() == 1 {
                learned = true;
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(learned, "peer from re-registration never added");
        handle.stop().await;
    }

    #[tokio::test]
    async fn keeps_retrying_while_registrar_is_offline() {
        let registrar = Arc::new(LocalRegistrar::default());
        let me = registration(1, 7001);
        let reply = registrar.register(&me).await.unwrap();
        registrar.set_online(false);

        let handle = Heartbeat::new(reply.id, registrar.clone(), me, directory(), fast()).spawn();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(registrar.registrations(), 1);

        // Back online and still live: KeyAlreadyRegistered counts as success.
        registrar.set_online(true);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(registrar.registrations(), 1);

        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stop_ends_the_loop() {
        let registrar = Arc::new(LocalRegistrar::default());
        let me = registration(1, 7001);
        let reply = registrar.register(&me).await.unwrap();
        let handle = Heartbeat::new(reply.id, registrar, me, directory(), fast()).spawn();
        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .unwrap();
    }
}
