//! Local port forwarding to a port on a remote peer
//!
//! A tunnel owns one local listener. Each accepted socket gets its own peer
//! connection, which opens with a tunnel handshake naming the remote port and
//! then carries raw bytes in both directions.

use crate::client::Client;
use crate::config::{validate_port, ConfigError};
use crate::error::{ClientError, ClientResult};
use crate::forward::forward;
use cloudbridge_proto::Handshake;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Protocols a tunnel may be created with
pub const VALID_TUNNEL_PROTOCOLS: &[&str] = &["tcp", "quic"];

pub const DEFAULT_TUNNEL_PROTOCOL: &str = "tcp";

pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub local_port: i32,
    pub remote_peer: String,
    pub remote_port: i32,
    /// Defaults to `tcp`
    #[serde(default)]
    pub protocol: Option<String>,
    /// Defaults to `0.0.0.0`
    #[serde(default)]
    pub bind_host: Option<String>,
}

impl TunnelConfig {
    pub fn new(local_port: i32, remote_peer: impl Into<String>, remote_port: i32) -> Self {
        Self {
            local_port,
            remote_peer: remote_peer.into(),
            remote_port,
            protocol: None,
            bind_host: None,
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = Some(host.into());
        self
    }

    pub fn protocol(&self) -> &str {
        self.protocol.as_deref().unwrap_or(DEFAULT_TUNNEL_PROTOCOL)
    }

    pub fn bind_host(&self) -> &str {
        self.bind_host.as_deref().unwrap_or(DEFAULT_BIND_HOST)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_port("local_port", self.local_port)?;
        if self.remote_peer.is_empty() {
            return Err(ConfigError::Missing {
                field: "remote_peer",
            });
        }
        validate_port("remote_port", self.remote_port)?;
        if !VALID_TUNNEL_PROTOCOLS.contains(&self.protocol()) {
            return Err(ConfigError::UnsupportedProtocol(self.protocol().to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PairingCounters {
    active: AtomicUsize,
    total: AtomicU64,
}

#[derive(Debug)]
struct TunnelInner {
    id: Uuid,
    config: TunnelConfig,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<PairingCounters>,
}

impl Drop for TunnelInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A running forwarding rule
///
/// Closing stops the listener; pairings already in flight keep running until
/// one of their sides closes.
#[derive(Debug, Clone)]
pub struct Tunnel {
    inner: Arc<TunnelInner>,
}

impl Tunnel {
    pub(crate) async fn start(client: Client, config: TunnelConfig) -> ClientResult<Self> {
        config.validate()?;
        let local_port = config.local_port as u16;
        let remote_port = config.remote_port as u16;

        let listener = TcpListener::bind((config.bind_host(), local_port))
            .await
            .map_err(|e| ClientError::Bind {
                address: format!("{}:{}", config.bind_host(), local_port),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| ClientError::Bind {
            address: format!("{}:{}", config.bind_host(), local_port),
            reason: e.to_string(),
        })?;

        let id = Uuid::new_v4();
        let cancel = client.shutdown_token().child_token();
        let counters = Arc::new(PairingCounters::default());

        let accept_task = tokio::spawn(accept_loop(
            client,
            listener,
            config.remote_peer.clone(),
            remote_port,
            cancel.clone(),
            counters.clone(),
        ));

        info!(
            tunnel_id = %id,
            local_addr = %local_addr,
            remote_peer = %config.remote_peer,
            remote_port,
            protocol = %config.protocol(),
            "Tunnel started"
        );

        Ok(Self {
            inner: Arc::new(TunnelInner {
                id,
                config,
                local_addr,
                cancel,
                accept_task: Mutex::new(Some(accept_task)),
                counters,
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.inner.config
    }

    /// Address the local listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Pairings currently forwarding
    pub fn active_pairings(&self) -> usize {
        self.inner.counters.active.load(Ordering::SeqCst)
    }

    /// Local connections accepted since start
    pub fn total_pairings(&self) -> u64 {
        self.inner.counters.total.load(Ordering::SeqCst)
    }

    /// Stop accepting local connections and release the listener
    pub async fn close(&self) -> ClientResult<()> {
        self.inner.cancel.cancel();

        let accept_task = self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                warn!(tunnel_id = %self.inner.id, "Tunnel accept task failed: {}", e);
            }
            info!(tunnel_id = %self.inner.id, "Tunnel closed");
        }
        Ok(())
    }
}

async fn accept_loop(
    client: Client,
    listener: TcpListener,
    remote_peer: String,
    remote_port: u16,
    cancel: CancellationToken,
    counters: Arc<PairingCounters>,
) {
    loop {
        let (socket, addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Failed to accept local connection: {}", e);
                    continue;
                }
            },
        };

        debug!(%addr, remote_peer = %remote_peer, "Accepted local connection");
        counters.total.fetch_add(1, Ordering::SeqCst);

        let client = client.clone();
        let remote_peer = remote_peer.clone();
        let counters = counters.clone();
        tokio::spawn(async move {
            counters.active.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = pair(&client, socket, &remote_peer, remote_port).await {
                warn!(remote_peer = %remote_peer, %addr, "Tunnel pairing failed: {}", e);
            }
            counters.active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    debug!(remote_peer = %remote_peer, "Tunnel accept loop exiting");
}

async fn pair(
    client: &Client,
    socket: TcpStream,
    remote_peer: &str,
    remote_port: u16,
) -> ClientResult<()> {
    let handshake = Handshake::tunnel(remote_port).encode()?;
    let conn = client.connect(remote_peer).await?;

    if let Err(e) = conn.write_all(&handshake).await {
        let _ = conn.close().await;
        return Err(e);
    }

    let stats = forward(socket, conn).await;
    debug!(
        remote_peer = %remote_peer,
        remote_port,
        bytes_to_peer = stats.to_peer,
        bytes_to_local = stats.to_local,
        "Tunnel pairing finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_config_validation() {
        assert!(TunnelConfig::new(8080, "peer", 80).validate().is_ok());
        assert!(TunnelConfig::new(1, "peer", 65535).validate().is_ok());

        assert_eq!(
            TunnelConfig::new(0, "peer", 80).validate(),
            Err(ConfigError::InvalidPort {
                field: "local_port",
                value: 0
            })
        );
        assert!(TunnelConfig::new(8080, "peer", 65536).validate().is_err());
        assert!(TunnelConfig::new(8080, "peer", -1).validate().is_err());
        assert_eq!(
            TunnelConfig::new(8080, "", 80).validate(),
            Err(ConfigError::Missing {
                field: "remote_peer"
            })
        );
    }

    #[test]
    fn test_tunnel_protocols() {
        let config = TunnelConfig::new(8080, "peer", 80);
        assert_eq!(config.protocol(), "tcp");
        assert_eq!(config.bind_host(), "0.0.0.0");

        assert!(config.clone().with_protocol("quic").validate().is_ok());
        assert_eq!(
            config.with_protocol("udp").validate(),
            Err(ConfigError::UnsupportedProtocol("udp".to_string()))
        );
    }
}
