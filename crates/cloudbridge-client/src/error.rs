//! Client errors

use crate::config::ConfigError;
use cloudbridge_proto::HandshakeError;
use cloudbridge_transport::TransportError;
use thiserror::Error;

/// Broad error classes callers drive retry decisions from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or missing input; never worth retrying
    Config,
    /// The component is closed or not yet usable
    State,
    /// The peer or the network failed
    Transport,
    /// A peer spoke something other than the expected wire format
    Protocol,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("{0} is not established")]
    NotEstablished(&'static str),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Deadlines are not supported by the stream to {0}")]
    DeadlinesUnsupported(String),

    #[error("Failed to {op} {target}: {source}")]
    Transport {
        op: &'static str,
        target: String,
        #[source]
        source: TransportError,
    },

    #[error("I/O error on connection to {peer}: {source}")]
    Io {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Deadline exceeded on connection to {0}")]
    DeadlineExceeded(String),

    #[error("Broadcast failed for {} of {total} peers", .failed.len())]
    PartialBroadcast {
        /// `(peer_id, reason)` for every peer that could not be reached
        failed: Vec<(String, String)>,
        total: usize,
    },

    #[error("Gave up reconnecting to {peer} after {attempts} attempts: {last}")]
    RetriesExhausted {
        peer: String,
        attempts: u32,
        #[source]
        last: Box<ClientError>,
    },

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Config(_) | ClientError::InvalidArgument(_) => ErrorKind::Config,
            ClientError::Closed(_)
            | ClientError::NotEstablished(_)
            | ClientError::ServiceNotFound(_)
            | ClientError::DeadlinesUnsupported(_) => ErrorKind::State,
            ClientError::Transport { .. }
            | ClientError::Io { .. }
            | ClientError::Bind { .. }
            | ClientError::Timeout(_)
            | ClientError::DeadlineExceeded(_)
            | ClientError::PartialBroadcast { .. }
            | ClientError::RetriesExhausted { .. } => ErrorKind::Transport,
            ClientError::Handshake(_) => ErrorKind::Protocol,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ClientError::Closed(_))
    }

    pub fn is_not_established(&self) -> bool {
        matches!(self, ClientError::NotEstablished(_))
    }

    /// Whether the failure happened on the far side of the transport
    pub fn is_remote(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    pub(crate) fn transport(op: &'static str, target: &str, source: TransportError) -> Self {
        ClientError::Transport {
            op,
            target: target.to_string(),
            source,
        }
    }

    pub(crate) fn io(peer: &str, source: std::io::Error) -> Self {
        ClientError::Io {
            peer: peer.to_string(),
            source,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
