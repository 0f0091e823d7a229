//! Peer Directory.
//!
//! The single owner of the peer table. One task drains one ordered request
//! queue, so an add or remove is always fully applied before the next send
//! looks at the table, and no lock is needed around it.
//!
//! ```text
//! dispatcher ─┐                        ┌─▶ Link::send_to ──▶ UDP
//! quorum    ──┼─▶ DirectoryRequest ──▶ │
//! heartbeat ──┤    (mpsc, ordered)     ├─▶ StrikeEvent ──▶ failure detector
//! detector  ──┘                        └─▶ forget(peer) ──▶ dispatcher
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use quarry_protocol::{decode_public_key, is_prey, Message, PeerId, VerifyingKey, WireCodec};
use quarry_transfer::Link;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::failure::StrikeEvent;
use crate::registrar::PeerRecord;
use crate::state::GameState;

/// Queue depth of the directory's request channel.
pub const DIRECTORY_QUEUE: usize = 30;

/// One row of the peer table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub addr: SocketAddr,
    /// `None` only for peers learned without a key (test mode).
    pub key: Option<VerifyingKey>,
}

impl PeerEntry {
    pub fn from_record(record: &PeerRecord) -> Result<Self> {
        Ok(Self {
            addr: record.address,
            key: Some(decode_public_key(&record.public_key)?),
        })
    }
}

/// Everything the directory task can be asked to do.
#[derive(Debug)]
pub enum DirectoryRequest {
    Send { to: PeerId, msg: Message },
    Broadcast { msg: Message },
    SendToAddr { addr: SocketAddr, msg: Message },
    Add { id: PeerId, entry: PeerEntry },
    Remove { id: PeerId },
    Lookup { id: PeerId, reply: oneshot::Sender<Option<PeerEntry>> },
    Count { reply: oneshot::Sender<usize> },
    Snapshot { reply: oneshot::Sender<HashMap<PeerId, PeerEntry>> },
}

/// Cloneable front-end to the directory task.
#[derive(Debug, Clone)]
pub struct DirectoryHandle {
    tx: mpsc::Sender<DirectoryRequest>,
}

impl DirectoryHandle {
    pub fn new(tx: mpsc::Sender<DirectoryRequest>) -> Self {
        Self { tx }
    }

    async fn request(&self, req: DirectoryRequest) -> Result<()> {
        self.tx
            .send(req)
            .await
            .map_err(|_| Error::ChannelClosed("directory"))
    }

    async fn ask<T>(&self, req: DirectoryRequest, rx: oneshot::Receiver<T>) -> Result<T> {
        self.request(req).await?;
        rx.await.map_err(|_| Error::ChannelClosed("directory"))
    }

    pub async fn send(&self, to: &str, msg: Message) -> Result<()> {
        self.request(DirectoryRequest::Send {
            to: to.to_string(),
            msg,
        })
        .await
    }

    pub async fn broadcast(&self, msg: Message) -> Result<()> {
        self.request(DirectoryRequest::Broadcast { msg }).await
    }

    pub async fn send_to_addr(&self, addr: SocketAddr, msg: Message) -> Result<()> {
        self.request(DirectoryRequest::SendToAddr { addr, msg }).await
    }

    pub async fn add(&self, id: &str, entry: PeerEntry) -> Result<()> {
        self.request(DirectoryRequest::Add {
            id: id.to_string(),
            entry,
        })
        .await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.request(DirectoryRequest::Remove { id: id.to_string() })
            .await
    }

    pub async fn lookup(&self, id: &str) -> Result<Option<PeerEntry>> {
        let (reply, rx) = oneshot::channel();
        self.ask(
            DirectoryRequest::Lookup {
                id: id.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Connected peers, self excluded.
    pub async fn count(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.ask(DirectoryRequest::Count { reply }, rx).await
    }

    /// Copy of the whole peer table.
    pub async fn snapshot(&self) -> Result<HashMap<PeerId, PeerEntry>> {
        let (reply, rx) = oneshot::channel();
        self.ask(DirectoryRequest::Snapshot { reply }, rx).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerId>> {
        Ok(self.snapshot().await?.into_keys().collect())
    }
}

/// The directory task's state.
pub struct Directory {
    self_id: PeerId,
    peers: HashMap<PeerId, PeerEntry>,
    link: Arc<dyn Link>,
    codec: WireCodec,
    reply_addr: Option<SocketAddr>,
    state: Arc<GameState>,
    requests: mpsc::Receiver<DirectoryRequest>,
    strikes: mpsc::Sender<StrikeEvent>,
    forget: mpsc::Sender<PeerId>,
}

impl Directory {
    pub fn new(
        self_id: PeerId,
        link: Arc<dyn Link>,
        codec: WireCodec,
        state: Arc<GameState>,
        requests: mpsc::Receiver<DirectoryRequest>,
        strikes: mpsc::Sender<StrikeEvent>,
        forget: mpsc::Sender<PeerId>,
    ) -> Self {
        Self {
            self_id,
            peers: HashMap::new(),
            link,
            codec,
            reply_addr: None,
            state,
            requests,
            strikes,
            forget,
        }
    }

    /// Stamp `addr` on outgoing messages that carry no return address.
    /// Writes leave from per-peer sockets, so the datagram source is not
    /// where replies should go.
    pub fn with_reply_addr(mut self, addr: SocketAddr) -> Self {
        self.reply_addr = Some(addr);
        self
    }

    /// Process requests one at a time until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(req) = self.requests.recv().await {
            self.handle(req).await;
        }
        debug!("peer directory stopped");
    }

    async fn handle(&mut self, req: DirectoryRequest) {
        match req {
            DirectoryRequest::Send { to, msg } => {
                let Some(addr) = self.peers.get(&to).map(|p| p.addr) else {
                    debug!(peer = %to, kind = %msg.message_type(), "send to unknown peer dropped");
                    return;
                };
                if let Some(bytes) = self.encode(msg) {
                    self.deliver(&to, addr, &bytes).await;
                }
            }
            DirectoryRequest::Broadcast { msg } => {
                let Some(bytes) = self.encode(msg) else {
                    return;
                };
                let targets: Vec<(PeerId, SocketAddr)> = self
                    .peers
                    .iter()
                    .map(|(id, p)| (id.clone(), p.addr))
                    .collect();
                for (id, addr) in targets {
                    self.deliver(&id, addr, &bytes).await;
                }
            }
            DirectoryRequest::SendToAddr { addr, msg } => {
                if let Some(bytes) = self.encode(msg) {
                    if let Err(e) = self.link.send_to(&bytes, addr).await {
                        warn!(%addr, "send failed: {}", e);
                    }
                }
            }
            DirectoryRequest::Add { id, entry } => {
                if id == self.self_id {
                    return;
                }
                if self.peers.insert(id.clone(), entry).is_none() {
                    info!(peer = %id, "peer added");
                }
            }
            DirectoryRequest::Remove { id } => self.remove(id).await,
            DirectoryRequest::Lookup { id, reply } => {
                let _ = reply.send(self.peers.get(&id).cloned());
            }
            DirectoryRequest::Count { reply } => {
                let _ = reply.send(self.peers.len());
            }
            DirectoryRequest::Snapshot { reply } => {
                let _ = reply.send(self.peers.clone());
            }
        }
    }

    fn encode(&self, mut msg: Message) -> Option<Vec<u8>> {
        if msg.addr.is_none() {
            msg.addr = self.reply_addr;
        }
        match self.codec.encode(msg) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("failed to encode outgoing message: {}", e);
                None
            }
        }
    }

    async fn deliver(&self, id: &str, addr: SocketAddr, bytes: &[u8]) {
        let event = match self.link.send_to(bytes, addr).await {
            Ok(()) => StrikeEvent::Delivered(id.to_string()),
            Err(e) => {
                warn!(peer = id, %addr, "send failed: {}", e);
                StrikeEvent::Failed(id.to_string())
            }
        };
        // Never block on the detector: it may be waiting on us.
        if let Err(mpsc::error::TrySendError::Full(ev)) = self.strikes.try_send(event) {
            debug!(?ev, "strike queue full, event dropped");
        }
    }

    async fn remove(&mut self, id: PeerId) {
        if is_prey(&id) {
            debug!("refusing to remove the prey");
            return;
        }
        let Some(entry) = self.peers.remove(&id) else {
            return;
        };
        self.link.release(entry.addr).await;
        self.state.remove_peer(&id).await;
        let _ = self.forget.try_send(id.clone());
        info!(peer = %id, "peer removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_protocol::{Coordinate, MessageBody, NodeKeys};
    use std::sync::Mutex;

    /// Link that records what it sent.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<SocketAddr>>,
    }

    #[async_trait::async_trait]
    impl Link for Recorder {
        async fn send_to(&self, _data: &[u8], addr: SocketAddr) -> std::io::Result<()> {
            self.sent.lock().unwrap().push(addr);
            Ok(())
        }
    }

    fn entry(port: u16) -> PeerEntry {
        PeerEntry {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            key: Some(NodeKeys::from_seed([port as u8; 32]).verifying_key()),
        }
    }

    fn spawn(
        link: Arc<dyn Link>,
        state: Arc<GameState>,
    ) -> (DirectoryHandle, mpsc::Receiver<StrikeEvent>, mpsc::Receiver<PeerId>) {
        let (tx, rx) = mpsc::channel(DIRECTORY_QUEUE);
        let (strike_tx, strike_rx) = mpsc::channel(DIRECTORY_QUEUE);
        let (forget_tx, forget_rx) = mpsc::channel(DIRECTORY_QUEUE);
        let dir = Directory::new(
            "me".into(),
            link,
            WireCodec::default(),
            state,
            rx,
            strike_tx,
            forget_tx,
        );
        tokio::spawn(dir.run());
        (DirectoryHandle::new(tx), strike_rx, forget_rx)
    }

    #[tokio::test]
    async fn add_lookup_remove() {
        let state = Arc::new(GameState::new());
        state.set_location("p2", Coordinate::new(1, 1)).await;
        let (dir, _strikes, mut forget) = spawn(Arc::new(Recorder::default()), state.clone());

        dir.add("p2", entry(7002)).await.unwrap();
        dir.add("me", entry(7000)).await.unwrap();
        assert_eq!(dir.count().await.unwrap(), 1);
        assert_eq!(dir.lookup("p2").await.unwrap(), Some(entry(7002)));

        dir.remove("p2").await.unwrap();
        assert_eq!(dir.count().await.unwrap(), 0);
        assert_eq!(state.location("p2").await, None);
        assert_eq!(forget.recv().await.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn prey_is_never_removed() {
        let state = Arc::new(GameState::new());
        let (dir, _strikes, _forget) = spawn(Arc::new(Recorder::default()), state);
        dir.add("prey", entry(7009)).await.unwrap();
        dir.remove("prey").await.unwrap();
        assert!(dir.lookup("prey").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_peer() {
        let recorder = Arc::new(Recorder::default());
        let (dir, mut strikes, _forget) =
            spawn(recorder.clone(), Arc::new(GameState::new()));
        dir.add("p2", entry(7002)).await.unwrap();
        dir.add("p3", entry(7003)).await.unwrap();

        let msg = Message::new("me", None, MessageBody::Ack { sequence: 1 });
        dir.broadcast(msg).await.unwrap();
        // Count round-trips through the queue, so the broadcast has finished.
        dir.count().await.unwrap();

        let mut sent = recorder.sent.lock().unwrap().clone();
        sent.sort();
        assert_eq!(sent, vec![entry(7002).addr, entry(7003).addr]);
        assert!(matches!(strikes.recv().await, Some(StrikeEvent::Delivered(_))));
    }

    /// Link that keeps decoded messages.
    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<Message>>,
    }

    #[async_trait::async_trait]
    impl Link for Capture {
        async fn send_to(&self, data: &[u8], _addr: SocketAddr) -> std::io::Result<()> {
            let msg = WireCodec::default().decode(data).unwrap();
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }
    }

    #[tokio::test]
    async fn outgoing_messages_carry_the_listening_address() {
        let capture = Arc::new(Capture::default());
        let listening = SocketAddr::from(([127, 0, 0, 1], 7000));
        let elsewhere = SocketAddr::from(([127, 0, 0, 1], 7999));
        let (tx, rx) = mpsc::channel(DIRECTORY_QUEUE);
        let (strike_tx, _strike_rx) = mpsc::channel(DIRECTORY_QUEUE);
        let (forget_tx, _forget_rx) = mpsc::channel(DIRECTORY_QUEUE);
        let dir = Directory::new(
            "me".into(),
            capture.clone(),
            WireCodec::default(),
            Arc::new(GameState::new()),
            rx,
            strike_tx,
            forget_tx,
        )
        .with_reply_addr(listening);
        tokio::spawn(dir.run());
        let dir = DirectoryHandle::new(tx);
        dir.add("p2", entry(7002)).await.unwrap();

        dir.broadcast(Message::new("me", None, MessageBody::Ack { sequence: 1 }))
            .await
            .unwrap();
        dir.send("p2", Message::new("me", Some(elsewhere), MessageBody::Connected))
            .await
            .unwrap();
        dir.count().await.unwrap();

        let sent = capture.sent.lock().unwrap().clone();
        let addrs: Vec<_> = sent.iter().map(|m| m.addr).collect();
        assert_eq!(addrs, vec![Some(listening), Some(elsewhere)]);
    }

    #[tokio::test]
    async fn send_to_unknown_peer_is_dropped() {
        let recorder = Arc::new(Recorder::default());
        let (dir, _strikes, _forget) = spawn(recorder.clone(), Arc::new(GameState::new()));
        let msg = Message::new("me", None, MessageBody::Connected);
        dir.send("nobody", msg).await.unwrap();
        dir.count().await.unwrap();
        assert!(recorder.sent.lock().unwrap().is_empty());
    }
}
