//! Quarry Transfer - UDP datagram transport
//!
//! Logic nodes talk over plain, unreliable UDP. Loss and duplication are
//! handled above this layer (commit-reveal, quorum retries, replay windows);
//! this crate only binds sockets and moves bytes. Each destination gets its
//! own connected socket for writes so that an unreachable peer shows up as a
//! failed send rather than silence.
//!
//! # Example
//!
//! ```rust,ignore
//! use quarry_transfer::{Link, TransportConfig, TransportHandle};
//!
//! let transport = TransportHandle::new(TransportConfig::bound_to("127.0.0.1:0".parse()?)).await?;
//! transport.send_to(b"hello", peer_addr).await?;
//! ```

pub mod transport;

pub use transport::{Link, TransportConfig, TransportHandle, MAX_DATAGRAM};
