//! In-process transport
//!
//! A [`MemoryNetwork`] is a hub of named endpoints. Dialing creates a
//! `tokio::io::duplex` pipe and delivers the far end to the target's accept
//! queue. Mesh membership is tracked per network name on the hub.

use crate::{BoxedPeerStream, PeerStream, PeerTransport, TransportError, TransportResult};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const PIPE_CAPACITY: usize = 64 * 1024;

type Inbound = (BoxedPeerStream, String);

#[derive(Debug, Default)]
struct NetworkState {
    endpoints: HashMap<String, mpsc::UnboundedSender<Inbound>>,
    meshes: HashMap<String, BTreeSet<String>>,
}

/// Shared hub connecting [`MemoryTransport`] endpoints
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new endpoint; re-registering a name replaces the old one
    pub fn endpoint(&self, peer_id: impl Into<String>) -> MemoryTransport {
        let peer_id = peer_id.into();
        let (tx, rx) = mpsc::unbounded_channel();

        if let Ok(mut state) = self.state.lock() {
            state.endpoints.insert(peer_id.clone(), tx);
        }

        MemoryTransport {
            peer_id,
            network: self.clone(),
            incoming: tokio::sync::Mutex::new(rx),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            deadlines: true,
            rtt: None,
        }
    }

    /// Names of the endpoints currently registered
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .state
            .lock()
            .map(|s| s.endpoints.keys().cloned().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }
}

/// One endpoint on a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryTransport {
    peer_id: String,
    network: MemoryNetwork,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    deadlines: bool,
    rtt: Option<Duration>,
}

impl MemoryTransport {
    /// Whether streams dialed from this endpoint advertise deadline support
    pub fn with_deadlines(mut self, enabled: bool) -> Self {
        self.deadlines = enabled;
        self
    }

    /// Fixed RTT reported by streams dialed from this endpoint
    pub fn with_rtt(mut self, rtt: Duration) -> Self {
        self.rtt = Some(rtt);
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn local_peer_id(&self) -> String {
        self.peer_id.clone()
    }

    async fn dial(&self, peer_id: &str) -> TransportResult<BoxedPeerStream> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let target = {
            let state = self
                .network
                .state
                .lock()
                .map_err(|_| TransportError::ConnectionError("network poisoned".to_string()))?;
            state.endpoints.get(peer_id).cloned()
        };
        let target = target.ok_or_else(|| TransportError::PeerNotFound(peer_id.to_string()))?;

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let remote_end = MemoryStream {
            peer_id: self.peer_id.clone(),
            io: far,
            deadlines: true,
            rtt: self.rtt,
        };

        target
            .send((Box::new(remote_end), self.peer_id.clone()))
            .map_err(|_| TransportError::ConnectionError(format!("peer {} is gone", peer_id)))?;

        debug!(from = %self.peer_id, to = %peer_id, "memory pipe opened");

        Ok(Box::new(MemoryStream {
            peer_id: peer_id.to_string(),
            io: near,
            deadlines: self.deadlines,
            rtt: self.rtt,
        }))
    }

    async fn accept(&self) -> TransportResult<Option<(BoxedPeerStream, String)>> {
        if self.is_closed() {
            return Ok(None);
        }

        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(None),
            next = incoming.recv() => Ok(next),
        }
    }

    async fn join_mesh(&self, network: &str) -> TransportResult<Vec<String>> {
        let mut state = self
            .network
            .state
            .lock()
            .map_err(|_| TransportError::ConnectionError("network poisoned".to_string()))?;
        let members = state.meshes.entry(network.to_string()).or_default();
        let others = members
            .iter()
            .filter(|m| **m != self.peer_id)
            .cloned()
            .collect();
        members.insert(self.peer_id.clone());
        Ok(others)
    }

    async fn leave_mesh(&self, network: &str) -> TransportResult<()> {
        if let Ok(mut state) = self.network.state.lock() {
            if let Some(members) = state.meshes.get_mut(network) {
                members.remove(&self.peer_id);
            }
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.cancel();
        if let Ok(mut state) = self.network.state.lock() {
            state.endpoints.remove(&self.peer_id);
            for members in state.meshes.values_mut() {
                members.remove(&self.peer_id);
            }
        }
        debug!(peer_id = %self.peer_id, "memory transport closed");
        Ok(())
    }
}

/// One end of an in-process pipe
#[derive(Debug)]
pub struct MemoryStream {
    peer_id: String,
    io: DuplexStream,
    deadlines: bool,
    rtt: Option<Duration>,
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl PeerStream for MemoryStream {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn supports_deadlines(&self) -> bool {
        self.deadlines
    }

    fn rtt(&self) -> Option<Duration> {
        self.rtt
    }
}
