//! Peer transport abstraction
//!
//! The session layer never dials sockets itself. It consumes a
//! [`PeerTransport`], which hands out reliable, ordered byte streams to peers
//! addressed by opaque string identifiers. Authentication, encryption and NAT
//! traversal are the transport's business.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Client / Tunnel / Mesh / dispatcher               │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │          cloudbridge-transport (this crate)              │
//! │  - PeerTransport        - PeerStream                     │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────────┬──────────────────┬───────────────────┐
//! │ MemoryTransport  │ TcpPeerTransport │ relay / QUIC      │
//! │ (in-process)     │ (direct TCP)     │ (external)        │
//! └──────────────────┴──────────────────┴───────────────────┘
//! ```

pub mod memory;
pub mod prefixed;
pub mod tcp;

pub use memory::{MemoryNetwork, MemoryStream, MemoryTransport};
pub use prefixed::PrefixedStream;
pub use tcp::{TcpPeerStream, TcpPeerTransport};

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Transport closed")]
    Closed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A reliable, ordered byte stream to one peer
///
/// Deadline support is advertised rather than assumed: when
/// `supports_deadlines` is false, callers must not pretend reads or writes are
/// time-bounded.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + Debug {
    /// Identifier of the peer at the other end
    fn peer_id(&self) -> &str;

    /// Whether reads and writes on this stream may be bounded by deadlines
    fn supports_deadlines(&self) -> bool {
        false
    }

    /// Round-trip time estimate, if the transport measures one
    fn rtt(&self) -> Option<Duration> {
        None
    }
}

/// Type-erased peer stream
pub type BoxedPeerStream = Box<dyn PeerStream>;

impl PeerStream for BoxedPeerStream {
    fn peer_id(&self) -> &str {
        (**self).peer_id()
    }

    fn supports_deadlines(&self) -> bool {
        (**self).supports_deadlines()
    }

    fn rtt(&self) -> Option<Duration> {
        (**self).rtt()
    }
}

/// Parameters handed to a transport when the client initializes it
#[derive(Debug, Clone)]
pub struct TransportContext {
    /// Tenant derived from the credential
    pub tenant_id: String,

    /// Preferred region
    pub region: String,

    /// Operation timeout
    pub timeout: Duration,

    /// Whether TLS certificate verification is disabled
    pub insecure_skip_verify: bool,
}

/// Capability to reach peers
///
/// Implementations must be safe to share between tasks: `dial` may be called
/// concurrently from many forwarding tasks while one task sits in `accept`.
#[async_trait]
pub trait PeerTransport: Send + Sync + Debug {
    /// Identifier other peers use to reach this node
    fn local_peer_id(&self) -> String;

    /// Prepare the transport (register with relays, warm up sessions)
    async fn initialize(&self, _ctx: &TransportContext) -> TransportResult<()> {
        Ok(())
    }

    /// Open a new stream to `peer_id`
    async fn dial(&self, peer_id: &str) -> TransportResult<BoxedPeerStream>;

    /// Accept the next unsolicited inbound stream
    ///
    /// Returns `None` once the transport is closed and no more streams will arrive.
    async fn accept(&self) -> TransportResult<Option<(BoxedPeerStream, String)>>;

    /// Announce membership of `network` and return the other known members
    async fn join_mesh(&self, _network: &str) -> TransportResult<Vec<String>> {
        Ok(Vec::new())
    }

    /// Withdraw membership of `network`
    async fn leave_mesh(&self, _network: &str) -> TransportResult<()> {
        Ok(())
    }

    /// Tear the transport down; must be idempotent
    async fn close(&self) -> TransportResult<()>;
}
