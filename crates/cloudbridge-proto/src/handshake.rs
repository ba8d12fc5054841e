//! Stream intent handshake
//!
//! The handshake is a single JSON object terminated by `\n`. The newline makes
//! the record self-delimiting, so the receiver can consume exactly one line and
//! treat every following byte as payload.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum handshake record length, newline included
pub const MAX_HANDSHAKE_LEN: usize = 1024;

/// First record on a newly dialed peer stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Handshake {
    /// Forward the rest of the stream to `port` on the receiving host
    Tunnel { port: u16 },
    /// Open a mesh link for the named network
    Mesh { network: String },
}

/// Handshake parse failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// The bytes are not a structured record at all; the stream is a generic
    /// application connection.
    #[error("Not a handshake record")]
    NotStructured,

    /// A structured record that declares an intent but is unusable.
    #[error("Handshake rejected: {0}")]
    Rejected(String),

    /// The record cannot be put on the wire.
    #[error("Failed to encode handshake: {0}")]
    Encode(String),
}

impl Handshake {
    pub fn tunnel(port: u16) -> Self {
        Handshake::Tunnel { port }
    }

    pub fn mesh(network: impl Into<String>) -> Self {
        Handshake::Mesh {
            network: network.into(),
        }
    }

    /// Serialize as one newline-terminated JSON line
    ///
    /// Records the receiver would refuse (port 0, empty network, longer than
    /// [`MAX_HANDSHAKE_LEN`]) are not encoded.
    pub fn encode(&self) -> Result<Bytes, HandshakeError> {
        self.validate()?;

        let mut line = serde_json::to_vec(self).map_err(|e| HandshakeError::Encode(e.to_string()))?;
        line.push(b'\n');
        if line.len() > MAX_HANDSHAKE_LEN {
            return Err(HandshakeError::Encode(format!(
                "record of {} bytes exceeds the {} byte limit",
                line.len(),
                MAX_HANDSHAKE_LEN
            )));
        }
        Ok(Bytes::from(line))
    }

    /// Parse one handshake line (trailing `\n` / `\r\n` is optional)
    pub fn parse(line: &[u8]) -> Result<Self, HandshakeError> {
        if line.len() > MAX_HANDSHAKE_LEN {
            return Err(HandshakeError::NotStructured);
        }

        let trimmed = trim_line_ending(line);
        let value: serde_json::Value =
            serde_json::from_slice(trimmed).map_err(|_| HandshakeError::NotStructured)?;

        let kind = match value.get("type").and_then(|t| t.as_str()) {
            Some(kind) => kind.to_string(),
            None => return Err(HandshakeError::NotStructured),
        };

        let handshake: Handshake = serde_json::from_value(value).map_err(|e| {
            HandshakeError::Rejected(format!("invalid '{}' handshake: {}", kind, e))
        })?;

        handshake.validate()?;
        Ok(handshake)
    }

    fn validate(&self) -> Result<(), HandshakeError> {
        match self {
            Handshake::Tunnel { port } if *port == 0 => {
                Err(HandshakeError::Rejected("tunnel port must be in 1..=65535".to_string()))
            }
            Handshake::Mesh { network } if network.is_empty() => {
                Err(HandshakeError::Rejected("mesh network name is empty".to_string()))
            }
            _ => Ok(()),
        }
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
