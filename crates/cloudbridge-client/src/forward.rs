//! Bidirectional copy between a local TCP socket and a peer connection
//!
//! Each direction runs on its own task and reports on a shared completion
//! channel. The first report ends the pairing: both sides are closed, and
//! whatever the second task reports afterwards is a consequence of that
//! teardown, so it is logged at debug level and dropped.

use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToPeer,
    ToLocal,
}

/// Bytes moved by one pairing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PairingStats {
    pub to_peer: u64,
    pub to_local: u64,
}

/// Copy until either side finishes, then close both
pub(crate) async fn forward(local: TcpStream, conn: Connection) -> PairingStats {
    let conn = Arc::new(conn);
    let peer_id = conn.peer_id().to_string();
    let (local_read, local_write) = local.into_split();

    let cancel = CancellationToken::new();
    let to_peer = Arc::new(AtomicU64::new(0));
    let to_local = Arc::new(AtomicU64::new(0));
    let (done_tx, mut done_rx) = mpsc::channel::<(Direction, ClientResult<()>)>(2);

    {
        let conn = conn.clone();
        let cancel = cancel.clone();
        let counter = to_peer.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let res = tokio::select! {
                _ = cancel.cancelled() => Ok(()),
                res = copy_to_peer(local_read, &conn, &counter) => res,
            };
            let _ = done_tx.send((Direction::ToPeer, res)).await;
        });
    }

    {
        let conn = conn.clone();
        let cancel = cancel.clone();
        let counter = to_local.clone();
        tokio::spawn(async move {
            let res = tokio::select! {
                _ = cancel.cancelled() => Ok(()),
                res = copy_to_local(&conn, local_write, &counter) => res,
            };
            let _ = done_tx.send((Direction::ToLocal, res)).await;
        });
    }

    if let Some((direction, res)) = done_rx.recv().await {
        match res {
            Ok(()) => debug!(peer_id = %peer_id, ?direction, "Pairing direction reached end of stream"),
            Err(e) => debug!(peer_id = %peer_id, ?direction, "Pairing direction failed: {}", e),
        }
    }

    cancel.cancel();
    if let Err(e) = conn.close().await {
        debug!(peer_id = %peer_id, "Error closing peer side of pairing: {}", e);
    }

    if let Some((direction, Err(e))) = done_rx.recv().await {
        debug!(peer_id = %peer_id, ?direction, "Ignoring error after pairing teardown: {}", e);
    }

    PairingStats {
        to_peer: to_peer.load(Ordering::Relaxed),
        to_local: to_local.load(Ordering::Relaxed),
    }
}

async fn copy_to_peer(
    mut local: OwnedReadHalf,
    conn: &Connection,
    counter: &AtomicU64,
) -> ClientResult<()> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = local
            .read(&mut buffer)
            .await
            .map_err(|e| ClientError::io(conn.peer_id(), e))?;
        if n == 0 {
            return Ok(());
        }
        conn.write_all(&buffer[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

async fn copy_to_local(
    conn: &Connection,
    mut local: OwnedWriteHalf,
    counter: &AtomicU64,
) -> ClientResult<()> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = conn.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        local
            .write_all(&buffer[..n])
            .await
            .map_err(|e| ClientError::io(conn.peer_id(), e))?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}
