//! Direct TCP transport
//!
//! Peers are addressed by `host:port`. Because the remote port of an accepted
//! socket says nothing about who connected, the dialer opens every stream with
//! a short identity preamble: a big-endian `u16` length followed by its own
//! peer identifier.
//!
//! A listener bound to a wildcard address such as `0.0.0.0` has no identity
//! other peers can dial back, so it must be given one with
//! [`TcpPeerTransport::with_advertise_addr`] before it dials or joins a mesh.

use crate::{BoxedPeerStream, PeerStream, PeerTransport, TransportError, TransportResult};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_PEER_ID_LEN: usize = 255;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_BACKLOG: usize = 64;

type Inbound = (BoxedPeerStream, String);

/// TCP transport with an optional listener
#[derive(Debug)]
pub struct TcpPeerTransport {
    local_peer_id: String,
    bound_addr: Option<SocketAddr>,
    incoming: Option<tokio::sync::Mutex<mpsc::Receiver<Inbound>>>,
    mesh_seeds: Vec<String>,
    connect_timeout: Duration,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl TcpPeerTransport {
    /// Bind a listener; the bound address becomes the local peer identifier
    /// unless an advertise address is set
    pub async fn bind(addr: &str) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            TransportError::ConfigurationError(format!("failed to bind {}: {}", addr, e))
        })?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);

        info!("TCP peer transport listening on {}", local_addr);
        tokio::spawn(accept_loop(listener, tx, shutdown.clone()));

        Ok(Self {
            local_peer_id: local_addr.to_string(),
            bound_addr: Some(local_addr),
            incoming: Some(tokio::sync::Mutex::new(rx)),
            mesh_seeds: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown,
            closed: AtomicBool::new(false),
        })
    }

    /// Outbound-only transport; `accept` reports closure immediately
    pub fn dial_only(local_peer_id: impl Into<String>) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            bound_addr: None,
            incoming: None,
            mesh_seeds: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Static mesh membership returned by `join_mesh`
    pub fn with_mesh_seeds(mut self, seeds: Vec<String>) -> Self {
        self.mesh_seeds = seeds;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Address other peers should dial to reach this listener
    pub fn with_advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.local_peer_id = addr.into();
        self
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    /// Local identity, refused when it names a wildcard address
    fn dialable_identity(&self) -> TransportResult<&str> {
        match self.local_peer_id.parse::<SocketAddr>() {
            Ok(addr) if addr.ip().is_unspecified() => Err(TransportError::ConfigurationError(
                format!(
                    "{} is not reachable by other peers; set an advertise address",
                    addr
                ),
            )),
            _ => Ok(&self.local_peer_id),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<Inbound>,
    shutdown: CancellationToken,
) {
    loop {
        let (socket, addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Failed to accept TCP connection: {}", e);
                    continue;
                }
            },
        };

        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(PREAMBLE_TIMEOUT, read_preamble(socket)).await {
                Ok(Ok((stream, peer_id))) => {
                    debug!(peer_id = %peer_id, %addr, "accepted TCP peer stream");
                    let _ = tx.send((Box::new(stream) as BoxedPeerStream, peer_id)).await;
                }
                Ok(Err(e)) => warn!("Rejected TCP stream from {}: {}", addr, e),
                Err(_) => warn!("TCP stream from {} sent no identity preamble", addr),
            }
        });
    }
    debug!("TCP accept loop exiting");
}

async fn read_preamble(mut socket: TcpStream) -> TransportResult<(TcpPeerStream, String)> {
    let len = socket.read_u16().await? as usize;
    if len == 0 || len > MAX_PEER_ID_LEN {
        return Err(TransportError::ProtocolError(format!(
            "invalid peer id length {}",
            len
        )));
    }

    let mut raw = vec![0u8; len];
    socket.read_exact(&mut raw).await?;
    let peer_id = String::from_utf8(raw)
        .map_err(|_| TransportError::ProtocolError("peer id is not UTF-8".to_string()))?;

    Ok((
        TcpPeerStream {
            peer_id: peer_id.clone(),
            stream: socket,
        },
        peer_id,
    ))
}

#[async_trait]
impl PeerTransport for TcpPeerTransport {
    fn local_peer_id(&self) -> String {
        self.local_peer_id.clone()
    }

    async fn dial(&self, peer_id: &str) -> TransportResult<BoxedPeerStream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let local_peer_id = self.dialable_identity()?;
        if local_peer_id.len() > MAX_PEER_ID_LEN {
            return Err(TransportError::ConfigurationError(
                "local peer id is too long".to_string(),
            ));
        }

        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(peer_id))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionError(format!("{}: {}", peer_id, e)))?;
        stream.set_nodelay(true)?;

        let mut preamble = Vec::with_capacity(2 + local_peer_id.len());
        preamble.extend_from_slice(&(local_peer_id.len() as u16).to_be_bytes());
        preamble.extend_from_slice(local_peer_id.as_bytes());
        stream.write_all(&preamble).await?;

        debug!(peer_id = %peer_id, "dialed TCP peer");

        Ok(Box::new(TcpPeerStream {
            peer_id: peer_id.to_string(),
            stream,
        }))
    }

    async fn accept(&self) -> TransportResult<Option<(BoxedPeerStream, String)>> {
        let incoming = match &self.incoming {
            Some(incoming) => incoming,
            None => return Ok(None),
        };
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let mut incoming = incoming.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(None),
            next = incoming.recv() => Ok(next),
        }
    }

    async fn join_mesh(&self, _network: &str) -> TransportResult<Vec<String>> {
        self.dialable_identity()?;
        Ok(self
            .mesh_seeds
            .iter()
            .filter(|seed| **seed != self.local_peer_id)
            .cloned()
            .collect())
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.cancel();
            info!("TCP peer transport {} closed", self.local_peer_id);
        }
        Ok(())
    }
}

/// TCP socket tagged with the peer identity it belongs to
#[derive(Debug)]
pub struct TcpPeerStream {
    peer_id: String,
    stream: TcpStream,
}

impl AsyncRead for TcpPeerStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpPeerStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl PeerStream for TcpPeerStream {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn supports_deadlines(&self) -> bool {
        true
    }
}
