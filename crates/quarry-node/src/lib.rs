//! Quarry Node - peer-to-peer predator/prey game runtime
//!
//! One logic node per player, plus one prey node, each keeping its own copy
//! of the board and agreeing on moves over plain UDP. No server decides
//! gameplay; the registrar only hands out ids, peer lists and game rules.
//!
//! # Architecture
//!
//! - **State**: locations and scores behind two locks, merged once at join
//! - **Directory**: the peer table and every outbound datagram
//! - **Failure**: strike counting and eviction of unreachable peers
//! - **Quorum**: commit, announce and ack-count the node's own moves
//! - **Dispatch**: verify and apply what peers send
//! - **Heartbeat**: registrar liveness and re-registration
//! - **Node**: startup sequence and the [`NodeHandle`] front-end
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use quarry_node::{Direction, LocalRegistrar, Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registrar = Arc::new(LocalRegistrar::default());
//!     let node = Node::start(NodeConfig::default(), registrar).await?;
//!     let outcome = node.submit(Direction::Right).await?;
//!     println!("{outcome:?}");
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod directory;
pub mod dispatch;
pub mod error;
pub mod failure;
pub mod grid;
pub mod heartbeat;
pub mod node;
pub mod quorum;
pub mod registrar;
pub mod render;
pub mod state;

pub use error::{Error, GameError, Result};
pub use grid::{GridValidator, WalledGrid};
pub use node::{Collaborators, Node, NodeConfig, NodeHandle, NodeIdentity};
pub use quorum::{EngineEvent, MoveOutcome, QuorumConfig, SequenceCounter};
pub use registrar::{
    GameConfig, GridConfig, LocalRegistrar, PeerRecord, Registrar, RegistrarError, Registration,
    RegistrationReply,
};
pub use render::GameRenderState;
pub use state::GameState;

pub use quarry_protocol::{Coordinate, Direction, PeerId, PREY_ID};
