//! CloudBridge peer session client
//!
//! Sits on top of a [`PeerTransport`](cloudbridge_transport::PeerTransport) and
//! provides:
//!
//! - [`Connection`]: a byte stream to one peer with metrics and deadlines
//! - [`Tunnel`]: local TCP port forwarding to a port on a remote peer
//! - [`Mesh`]: broadcast and unicast messaging inside a named peer group
//! - the incoming dispatcher, which serves tunnels and mesh links for other peers
//!
//! # Example
//!
//! ```no_run
//! use cloudbridge_client::{Client, Config, TunnelConfig};
//! use cloudbridge_transport::TcpPeerTransport;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::builder().token("eyJ...").build()?;
//! let transport = Arc::new(TcpPeerTransport::bind("0.0.0.0:7400").await?);
//!
//! let client = Client::new(config, transport)?;
//! client.initialize().await?;
//!
//! let tunnel = client
//!     .create_tunnel(TunnelConfig::new(8080, "10.0.0.7:7400", 80))
//!     .await?;
//! println!("forwarding {}", tunnel.local_addr());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
mod dispatcher;
pub mod error;
mod forward;
pub mod mesh;
pub mod retry;
pub mod service;
pub mod tunnel;

pub use client::{Client, ClientState, Health};
pub use config::{Config, ConfigBuilder, ConfigError, Protocol, RetryPolicy};
pub use connection::{Connection, ConnectionMetrics};
pub use dispatcher::DispatchConfig;
pub use error::{ClientError, ClientResult, ErrorKind};
pub use mesh::{Mesh, Message, MESSAGE_QUEUE_CAPACITY};
pub use retry::{Backoff, RetriesExhausted};
pub use service::{Service, ServiceConfig};
pub use tunnel::{Tunnel, TunnelConfig};
