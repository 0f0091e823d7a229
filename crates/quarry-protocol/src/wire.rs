//! Wire codec for the node-to-node envelope.
//!
//! On the wire every datagram is one JSON object:
//!
//! ```text
//! { "identifier": "player2", "messageType": "move", "sequence": 7,
//!   "move": { "data": "<hex x‖y>", "signature": { "r": "..", "s": ".." } },
//!   "addr": "10.0.0.4:7000" }
//! ```
//!
//! Decoding turns the loosely typed [`Envelope`] into a closed [`Message`]
//! enum, so handlers match exhaustively and never see a half-filled
//! envelope. The causal logging layer gets the raw buffer on both sides.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use crate::commit::MoveCommit;
use crate::error::{Error, Result};
use crate::keys::{self, NodeKeys, SignaturePair};
use crate::types::{Coordinate, GameSnapshot, PeerId};

/// Message type tags as they appear in `messageType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Move,
    MoveCommit,
    GameState,
    Connect,
    Connected,
    GameStateRequest,
    Captured,
    Ack,
}

impl MessageType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Move => "move",
            Self::MoveCommit => "moveCommit",
            Self::GameState => "gameState",
            Self::Connect => "connect",
            Self::Connected => "connected",
            Self::GameStateRequest => "gamestateReq",
            Self::Captured => "captured",
            Self::Ack => "ack",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "move" => Self::Move,
            "moveCommit" => Self::MoveCommit,
            "gameState" => Self::GameState,
            "connect" => Self::Connect,
            "connected" => Self::Connected,
            "gamestateReq" => Self::GameStateRequest,
            "captured" => Self::Captured,
            "ack" => Self::Ack,
            other => return Err(Error::UnknownMessageType(other.to_string())),
        })
    }
}

/// Raw coordinate bytes plus the sender's signature over them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMove {
    /// Hex of [`Coordinate::to_bytes`].
    pub data: String,
    pub signature: SignaturePair,
}

impl SignedMove {
    pub fn sign(keys: &NodeKeys, coord: Coordinate) -> Self {
        let raw = coord.to_bytes();
        Self {
            data: hex::encode(raw),
            signature: keys.sign(&raw),
        }
    }

    fn raw(&self) -> Result<Vec<u8>> {
        hex::decode(&self.data).map_err(|_| Error::Malformed("move data"))
    }

    /// Decode the coordinate without checking the signature.
    pub fn coordinate(&self) -> Result<Coordinate> {
        Coordinate::from_bytes(&self.raw()?).ok_or(Error::Malformed("move data"))
    }

    /// Check the signature against `sender`'s key and return the coordinate.
    pub fn verify(&self, key: &VerifyingKey, sender: &str) -> Result<Coordinate> {
        let raw = self.raw()?;
        keys::verify(key, &raw, &self.signature, sender)?;
        Coordinate::from_bytes(&raw).ok_or(Error::Malformed("move data"))
    }
}

/// The JSON object exchanged between nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub identifier: PeerId,
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_state: Option<GameSnapshot>,
    #[serde(default, rename = "move", skip_serializing_if = "Option::is_none")]
    pub signed_move: Option<SignedMove>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_commit: Option<MoveCommit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<SocketAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

/// Typed payload of a decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Move { sequence: u64, signed: SignedMove },
    MoveCommit(MoveCommit),
    GameState(GameSnapshot),
    Connect { public_key: String },
    Connected,
    GameStateRequest,
    Captured { signed: SignedMove, score: i64 },
    Ack { sequence: u64 },
}

impl MessageBody {
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Move { .. } => MessageType::Move,
            Self::MoveCommit(_) => MessageType::MoveCommit,
            Self::GameState(_) => MessageType::GameState,
            Self::Connect { .. } => MessageType::Connect,
            Self::Connected => MessageType::Connected,
            Self::GameStateRequest => MessageType::GameStateRequest,
            Self::Captured { .. } => MessageType::Captured,
            Self::Ack { .. } => MessageType::Ack,
        }
    }
}

/// A decoded message: who sent it, where to reach them, and what it says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from: PeerId,
    pub addr: Option<SocketAddr>,
    pub body: MessageBody,
}

impl Message {
    pub fn new(from: impl Into<PeerId>, addr: Option<SocketAddr>, body: MessageBody) -> Self {
        Self {
            from: from.into(),
            addr,
            body,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    fn into_envelope(self) -> Envelope {
        let mut env = Envelope {
            identifier: self.from,
            message_type: self.body.message_type().as_str().to_string(),
            addr: self.addr,
            ..Default::default()
        };
        match self.body {
            MessageBody::Move { sequence, signed } => {
                env.sequence = Some(sequence);
                env.signed_move = Some(signed);
            }
            MessageBody::MoveCommit(commit) => env.move_commit = Some(commit),
            MessageBody::GameState(snapshot) => env.game_state = Some(snapshot),
            MessageBody::Connect { public_key } => env.public_key = Some(public_key),
            MessageBody::Connected | MessageBody::GameStateRequest => {}
            MessageBody::Captured { signed, score } => {
                env.signed_move = Some(signed);
                env.score = Some(score);
            }
            MessageBody::Ack { sequence } => env.sequence = Some(sequence),
        }
        env
    }

    fn from_envelope(env: Envelope) -> Result<Self> {
        let kind: MessageType = env.message_type.parse()?;
        let missing = |field| Error::MissingField {
            message_type: kind.as_str(),
            field,
        };
        let body = match kind {
            MessageType::Move => MessageBody::Move {
                sequence: env.sequence.ok_or_else(|| missing("sequence"))?,
                signed: env.signed_move.ok_or_else(|| missing("move"))?,
            },
            MessageType::MoveCommit => {
                MessageBody::MoveCommit(env.move_commit.ok_or_else(|| missing("moveCommit"))?)
            }
            MessageType::GameState => {
                MessageBody::GameState(env.game_state.ok_or_else(|| missing("gameState"))?)
            }
            MessageType::Connect => MessageBody::Connect {
                public_key: env.public_key.ok_or_else(|| missing("publicKey"))?,
            },
            MessageType::Connected => MessageBody::Connected,
            MessageType::GameStateRequest => MessageBody::GameStateRequest,
            MessageType::Captured => MessageBody::Captured {
                signed: env.signed_move.ok_or_else(|| missing("move"))?,
                score: env.score.ok_or_else(|| missing("score"))?,
            },
            MessageType::Ack => MessageBody::Ack {
                sequence: env.sequence.ok_or_else(|| missing("sequence"))?,
            },
        };
        Ok(Self {
            from: env.identifier,
            addr: env.addr,
            body,
        })
    }
}

/// Process-level causal logging hook.
///
/// `prepare_send` wraps an outgoing payload with whatever metadata the
/// logger tracks; `unpack_receive` strips it again.
pub trait CausalLog: Send + Sync {
    fn prepare_send(&self, event: &str, payload: Vec<u8>) -> Vec<u8>;
    fn unpack_receive(&self, event: &str, buf: &[u8]) -> Result<Vec<u8>>;
}

/// Causal log that stamps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl CausalLog for Passthrough {
    fn prepare_send(&self, _event: &str, payload: Vec<u8>) -> Vec<u8> {
        payload
    }

    fn unpack_receive(&self, _event: &str, buf: &[u8]) -> Result<Vec<u8>> {
        Ok(buf.to_vec())
    }
}

/// Encodes and decodes [`Message`]s through the causal log.
#[derive(Clone)]
pub struct WireCodec {
    log: Arc<dyn CausalLog>,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(Arc::new(Passthrough))
    }
}

impl fmt::Debug for WireCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireCodec").finish_non_exhaustive()
    }
}

impl WireCodec {
    pub fn new(log: Arc<dyn CausalLog>) -> Self {
        Self { log }
    }

    pub fn encode(&self, msg: Message) -> Result<Vec<u8>> {
        let event = format!("send {}", msg.message_type());
        let payload = serde_json::to_vec(&msg.into_envelope())?;
        Ok(self.log.prepare_send(&event, payload))
    }

    pub fn decode(&self, buf: &[u8]) -> Result<Message> {
        let payload = self.log.unpack_receive("recv", buf)?;
        let env: Envelope = serde_json::from_slice(&payload)?;
        Message::from_envelope(env)
    }
}
