//! Byte-stream session with one peer

use crate::client::ClientShared;
use crate::error::{ClientError, ClientResult};
use chrono::{DateTime, Utc};
use cloudbridge_transport::{BoxedPeerStream, PeerStream};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Point-in-time view of a connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionMetrics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Round-trip estimate reported by the transport, if any
    pub rtt: Option<Duration>,
    pub connected: bool,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ConnectionState {
    connected: bool,
    closed: bool,
    connected_at: DateTime<Utc>,
    bytes_sent: u64,
    bytes_received: u64,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

pub(crate) struct ConnectionInner {
    id: Uuid,
    peer_id: String,
    supports_deadlines: bool,
    rtt: Option<Duration>,
    state: RwLock<ConnectionState>,
    reader: Mutex<Option<ReadHalf<BoxedPeerStream>>>,
    writer: Mutex<Option<WriteHalf<BoxedPeerStream>>>,
    shutdown: CancellationToken,
    client: Weak<ClientShared>,
}

/// A stream to one peer, owned by whoever received it
///
/// Reads and writes take `&self`, so one task may read while another writes.
/// The client keeps only a weak reference for bookkeeping.
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(stream: BoxedPeerStream, client: Weak<ClientShared>) -> Self {
        let peer_id = stream.peer_id().to_string();
        let supports_deadlines = stream.supports_deadlines();
        let rtt = stream.rtt();
        let (reader, writer) = tokio::io::split(stream);

        Self {
            inner: Arc::new(ConnectionInner {
                id: Uuid::new_v4(),
                peer_id,
                supports_deadlines,
                rtt,
                state: RwLock::new(ConnectionState {
                    connected: true,
                    closed: false,
                    connected_at: Utc::now(),
                    bytes_sent: 0,
                    bytes_received: 0,
                    read_deadline: None,
                    write_deadline: None,
                }),
                reader: Mutex::new(Some(reader)),
                writer: Mutex::new(Some(writer)),
                shutdown: CancellationToken::new(),
                client,
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    pub fn supports_deadlines(&self) -> bool {
        self.inner.supports_deadlines
    }

    /// Read into `buf`, returning 0 at end of stream
    pub async fn read(&self, buf: &mut [u8]) -> ClientResult<usize> {
        let deadline = self.inner.open_state()?.read_deadline;

        let mut reader = self.inner.reader.lock().await;
        let half = reader.as_mut().ok_or(ClientError::Closed("connection"))?;

        let n = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Err(ClientError::Closed("connection")),
            res = self.inner.bounded(deadline, half.read(buf)) => res?,
        };

        let mut state = self.inner.state_mut();
        if state.closed {
            return Err(ClientError::Closed("connection"));
        }
        state.bytes_received += n as u64;
        Ok(n)
    }

    /// Read exactly `buf.len()` bytes
    pub async fn read_exact(&self, buf: &mut [u8]) -> ClientResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(ClientError::io(
                    &self.inner.peer_id,
                    std::io::ErrorKind::UnexpectedEof.into(),
                ));
            }
            filled += n;
        }
        Ok(())
    }

    /// Write some of `buf`, returning how much was accepted
    pub async fn write(&self, buf: &[u8]) -> ClientResult<usize> {
        let deadline = self.inner.open_state()?.write_deadline;

        let mut writer = self.inner.writer.lock().await;
        let half = writer.as_mut().ok_or(ClientError::Closed("connection"))?;

        let n = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Err(ClientError::Closed("connection")),
            res = self.inner.bounded(deadline, half.write(buf)) => res?,
        };

        self.inner.record_sent(n)?;
        Ok(n)
    }

    /// Write all of `buf` without interleaving other writers
    pub async fn write_all(&self, buf: &[u8]) -> ClientResult<()> {
        let deadline = self.inner.open_state()?.write_deadline;

        let mut writer = self.inner.writer.lock().await;
        let half = writer.as_mut().ok_or(ClientError::Closed("connection"))?;

        let write = async {
            half.write_all(buf).await?;
            half.flush().await
        };
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Err(ClientError::Closed("connection")),
            res = self.inner.bounded(deadline, write) => res?,
        };

        self.inner.record_sent(buf.len())
    }

    /// Snapshot of counters; fails once the connection is closed
    pub fn metrics(&self) -> ClientResult<ConnectionMetrics> {
        let state = self.inner.open_state()?;
        Ok(ConnectionMetrics {
            bytes_sent: state.bytes_sent,
            bytes_received: state.bytes_received,
            rtt: self.inner.rtt,
            connected: state.connected,
            connected_at: state.connected_at,
        })
    }

    /// Bound both reads and writes; `None` clears the deadline
    pub fn set_deadline(&self, deadline: Option<Instant>) -> ClientResult<()> {
        self.inner.set_deadlines(Some(deadline), Some(deadline))
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> ClientResult<()> {
        self.inner.set_deadlines(Some(deadline), None)
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> ClientResult<()> {
        self.inner.set_deadlines(None, Some(deadline))
    }

    /// Close the stream; later calls are no-ops
    pub async fn close(&self) -> ClientResult<()> {
        self.inner.close().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_id", &self.inner.peer_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionInner {
    fn state(&self) -> RwLockReadGuard<'_, ConnectionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, ConnectionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_state(&self) -> ClientResult<RwLockReadGuard<'_, ConnectionState>> {
        let state = self.state();
        if state.closed {
            return Err(ClientError::Closed("connection"));
        }
        Ok(state)
    }

    pub(crate) fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub(crate) fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn record_sent(&self, n: usize) -> ClientResult<()> {
        let mut state = self.state_mut();
        if state.closed {
            return Err(ClientError::Closed("connection"));
        }
        state.bytes_sent += n as u64;
        Ok(())
    }

    async fn bounded<T, F>(&self, deadline: Option<Instant>, io: F) -> ClientResult<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        let res = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, io)
                .await
                .map_err(|_| ClientError::DeadlineExceeded(self.peer_id.clone()))?,
            None => io.await,
        };
        res.map_err(|e| ClientError::io(&self.peer_id, e))
    }

    fn set_deadlines(
        &self,
        read: Option<Option<Instant>>,
        write: Option<Option<Instant>>,
    ) -> ClientResult<()> {
        let mut state = self.state_mut();
        if state.closed {
            return Err(ClientError::Closed("connection"));
        }
        if !self.supports_deadlines {
            return Err(ClientError::DeadlinesUnsupported(self.peer_id.clone()));
        }
        if let Some(read) = read {
            state.read_deadline = read;
        }
        if let Some(write) = write {
            state.write_deadline = write;
        }
        Ok(())
    }

    pub(crate) async fn close(&self) -> ClientResult<()> {
        {
            let mut state = self.state_mut();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.connected = false;
        }

        // Wake any pending read or write so the halves can be taken.
        self.shutdown.cancel();

        let shutdown_result = match self.writer.lock().await.take() {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        };
        drop(self.reader.lock().await.take());

        debug!(peer_id = %self.peer_id, connection_id = %self.id, "connection closed");

        let err = shutdown_result.err().map(|e| ClientError::io(&self.peer_id, e));
        if let Some(client) = self.client.upgrade() {
            client.connection_closed(self.id, &self.peer_id, err.as_ref());
        }

        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
