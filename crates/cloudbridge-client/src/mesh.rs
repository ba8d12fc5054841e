//! Named peer groups with broadcast and unicast messaging
//!
//! Outbound, each member keeps at most one link per peer: a connection that
//! opened with a mesh handshake and then carries length-delimited frames.
//! A link only counts once the remote member echoes the handshake back; a
//! peer that closes the stream instead is not in the mesh and is dropped from
//! the peer set. Inbound links are served by the dispatcher, which feeds every
//! frame into the mesh's bounded queue as a [`Message`]. A peer is forgotten
//! once no link to or from it remains.

use crate::client::Client;
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use bytes::Bytes;
use cloudbridge_proto::{encode_mesh_frame, mesh_codec, Handshake, HandshakeError, MAX_MESH_FRAME};
use futures::future::join_all;
use futures::{Stream, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, Weak};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the inbound message queue
pub const MESSAGE_QUEUE_CAPACITY: usize = 100;

/// One payload received from a mesh member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from: String,
    pub payload: Bytes,
}

#[derive(Debug, Default)]
struct MeshState {
    peers: BTreeSet<String>,
    /// Open inbound links per peer
    inbound: HashMap<String, usize>,
    closed: bool,
}

pub(crate) struct MeshShared {
    network: String,
    /// Encoded handshake line, echoed back by members that accept a link
    handshake: Bytes,
    client: Client,
    state: RwLock<MeshState>,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    links: Mutex<HashMap<String, Arc<Connection>>>,
    left: CancellationToken,
}

impl Drop for MeshShared {
    fn drop(&mut self) {
        self.left.cancel();
    }
}

/// Membership of one mesh network
///
/// Clones share the same membership. All methods are safe to call
/// concurrently.
#[derive(Clone)]
pub struct Mesh {
    shared: Arc<MeshShared>,
}

impl Mesh {
    pub(crate) async fn join(client: Client, network: &str) -> ClientResult<Self> {
        let handshake = Handshake::mesh(network).encode()?;
        let (tx, rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        let shared = Arc::new(MeshShared {
            network: network.to_string(),
            handshake,
            left: client.shutdown_token().child_token(),
            client: client.clone(),
            state: RwLock::new(MeshState::default()),
            sender: Mutex::new(Some(tx)),
            receiver: tokio::sync::Mutex::new(rx),
            links: Mutex::new(HashMap::new()),
        });

        client.register_mesh(network, Arc::downgrade(&shared))?;
        let mut pending = PendingJoin {
            shared: shared.clone(),
            joined: false,
            done: false,
        };

        let timeout = client.config().timeout;
        let members = match tokio::time::timeout(timeout, client.transport().join_mesh(network)).await
        {
            Ok(Ok(members)) => members,
            Ok(Err(e)) => return Err(ClientError::transport("join mesh", network, e)),
            Err(_) => return Err(ClientError::Timeout(timeout)),
        };
        pending.joined = true;

        let local = client.local_peer_id();
        shared
            .state_mut()
            .peers
            .extend(members.into_iter().filter(|p| *p != local));

        let mesh = Self { shared };

        // Announce ourselves by opening a link to every known member.
        let peers = mesh.peers();
        let results = join_all(peers.iter().map(|peer| mesh.shared.link(peer))).await;
        for (peer, result) in peers.iter().zip(results) {
            if let Err(e) = result {
                warn!(network = %network, peer_id = %peer, "Failed to open mesh link: {}", e);
            }
        }

        pending.complete();
        info!(network = %network, peers = mesh.peers().len(), "Joined mesh");
        Ok(mesh)
    }

    pub(crate) fn from_shared(shared: Arc<MeshShared>) -> Self {
        Self { shared }
    }

    pub fn network(&self) -> &str {
        &self.shared.network
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state().closed
    }

    /// Snapshot of known members, sorted
    pub fn peers(&self) -> Vec<String> {
        self.shared.state().peers.iter().cloned().collect()
    }

    /// Send `data` to every known member
    ///
    /// Every member is attempted; failures are collected into
    /// [`ClientError::PartialBroadcast`].
    pub async fn broadcast(&self, data: &[u8]) -> ClientResult<()> {
        self.ensure_open()?;
        let frame = frame(data)?;

        let peers = self.peers();
        let total = peers.len();
        let results = join_all(
            peers
                .iter()
                .map(|peer| self.shared.send_frame(peer, frame.clone())),
        )
        .await;

        let failed: Vec<(String, String)> = peers
            .into_iter()
            .zip(results)
            .filter_map(|(peer, result)| result.err().map(|e| (peer, e.to_string())))
            .collect();

        if failed.is_empty() {
            debug!(network = %self.shared.network, peers = total, bytes = data.len(), "Broadcast sent");
            Ok(())
        } else {
            warn!(
                network = %self.shared.network,
                failed = failed.len(),
                total,
                "Broadcast did not reach every peer"
            );
            Err(ClientError::PartialBroadcast { failed, total })
        }
    }

    /// Send `data` to one peer
    pub async fn send(&self, peer_id: &str, data: &[u8]) -> ClientResult<()> {
        self.ensure_open()?;
        if peer_id.is_empty() {
            return Err(ClientError::InvalidArgument(
                "peer id cannot be empty".to_string(),
            ));
        }
        let frame = frame(data)?;
        self.shared.send_frame(peer_id, frame).await
    }

    /// Next inbound message; `None` once the mesh is left and the queue drained
    pub async fn recv(&self) -> Option<Message> {
        let mut receiver = self.shared.receiver.lock().await;
        tokio::select! {
            biased;
            message = receiver.recv() => message,
            _ = self.shared.left.cancelled() => receiver.try_recv().ok(),
        }
    }

    /// Next inbound message if one is queued
    pub fn try_recv(&self) -> Option<Message> {
        self.shared.receiver.try_lock().ok()?.try_recv().ok()
    }

    /// Inbound messages as a stream that ends when the mesh is left
    pub fn messages(&self) -> impl Stream<Item = Message> + Send + 'static {
        futures::stream::unfold(self.clone(), |mesh| async move {
            mesh.recv().await.map(|message| (message, mesh))
        })
    }

    /// Close the queue and every outbound link; later calls are no-ops
    pub async fn leave(&self) -> ClientResult<()> {
        {
            let mut state = self.shared.state_mut();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }

        self.shared.sender().take();
        self.shared.left.cancel();

        let links: Vec<Arc<Connection>> = self.shared.links().drain().map(|(_, l)| l).collect();
        for link in links {
            if let Err(e) = link.close().await {
                debug!(peer_id = %link.peer_id(), "Error closing mesh link: {}", e);
            }
        }

        let network = &self.shared.network;
        self.shared.client.unregister_mesh(network, &self.shared);
        if let Err(e) = self.shared.client.transport().leave_mesh(network).await {
            warn!(network = %network, "Transport failed to leave mesh: {}", e);
        }

        info!(network = %network, "Left mesh");
        Ok(())
    }

    fn ensure_open(&self) -> ClientResult<()> {
        if self.is_closed() {
            return Err(ClientError::Closed("mesh"));
        }
        Ok(())
    }
}

impl fmt::Debug for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mesh")
            .field("network", &self.shared.network)
            .field("peers", &self.peers())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn frame(data: &[u8]) -> ClientResult<Bytes> {
    encode_mesh_frame(data).ok_or_else(|| {
        ClientError::InvalidArgument(format!(
            "message of {} bytes exceeds the {} byte frame limit",
            data.len(),
            MAX_MESH_FRAME
        ))
    })
}

impl MeshShared {
    fn state(&self) -> RwLockReadGuard<'_, MeshState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> std::sync::RwLockWriteGuard<'_, MeshState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::Sender<Message>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn links(&self) -> MutexGuard<'_, HashMap<String, Arc<Connection>>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.state().closed
    }

    /// Cached outbound link to `peer_id`, opened on first use
    async fn link(self: &Arc<Self>, peer_id: &str) -> ClientResult<Arc<Connection>> {
        let cached = self.links().get(peer_id).cloned();
        if let Some(link) = cached {
            if !link.is_closed() {
                return Ok(link);
            }
        }

        let conn = match self.client.connect(peer_id).await {
            Ok(conn) => conn,
            Err(e) => {
                self.release_if_unlinked(peer_id);
                return Err(e);
            }
        };
        if let Err(e) = self.open_link(&conn, peer_id).await {
            let _ = conn.close().await;
            if matches!(e, ClientError::Handshake(_)) {
                self.remove_peer(peer_id);
            } else {
                self.release_if_unlinked(peer_id);
            }
            return Err(e);
        }
        let conn = Arc::new(conn);

        // Another task may have linked the same peer while we were dialing.
        let (winner, loser) = {
            let mut links = self.links();
            let mut state = self.state_mut();
            if state.closed {
                (None, Some(conn))
            } else {
                state.peers.insert(peer_id.to_string());
                match links.get(peer_id) {
                    Some(existing) if !existing.is_closed() => (Some(existing.clone()), Some(conn)),
                    _ => {
                        links.insert(peer_id.to_string(), conn.clone());
                        self.watch_link(peer_id.to_string(), conn.clone());
                        (Some(conn), None)
                    }
                }
            }
        };

        if let Some(loser) = loser {
            let _ = loser.close().await;
        }
        winner.ok_or(ClientError::Closed("mesh"))
    }

    /// Send our handshake and wait for the member to echo it back
    async fn open_link(&self, conn: &Connection, peer_id: &str) -> ClientResult<()> {
        let exchange = async {
            conn.write_all(&self.handshake).await?;

            let mut reply = vec![0u8; self.handshake.len()];
            let mut filled = 0;
            while filled < reply.len() {
                let n = conn.read(&mut reply[filled..]).await?;
                if n == 0 {
                    return Err(ClientError::Handshake(HandshakeError::Rejected(format!(
                        "{} is not a member of mesh {}",
                        peer_id, self.network
                    ))));
                }
                filled += n;
            }

            if reply[..] != self.handshake[..] {
                return Err(ClientError::Handshake(HandshakeError::Rejected(format!(
                    "unexpected mesh reply from {}",
                    peer_id
                ))));
            }
            Ok(())
        };

        let timeout = self.client.config().timeout;
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ClientError::Timeout(timeout))?
    }

    /// Drop the cached link to `peer_id` once the member closes it
    fn watch_link(self: &Arc<Self>, peer_id: String, link: Arc<Connection>) {
        let mesh = Arc::downgrade(self);
        let left = self.left.clone();
        tokio::spawn(async move {
            // Accepted links carry nothing back, so a read only completes once the link is gone.
            let mut byte = [0u8; 1];
            tokio::select! {
                _ = left.cancelled() => {}
                _ = link.read(&mut byte) => {}
            }

            if let Some(mesh) = mesh.upgrade() {
                if mesh.evict(&peer_id, &link) {
                    debug!(network = %mesh.network, peer_id = %peer_id, "Mesh link lost");
                    mesh.release_if_unlinked(&peer_id);
                }
            }
            let _ = link.close().await;
        });
    }

    /// Remove `link` from the cache if it is still the current link to `peer_id`
    fn evict(&self, peer_id: &str, link: &Arc<Connection>) -> bool {
        let mut links = self.links();
        let current = links
            .get(peer_id)
            .map(|l| Arc::ptr_eq(l, link))
            .unwrap_or(false);
        if current {
            links.remove(peer_id);
        }
        current
    }

    fn remove_peer(&self, peer_id: &str) {
        if self.state_mut().peers.remove(peer_id) {
            debug!(network = %self.network, peer_id = %peer_id, "Peer is not a mesh member");
        }
    }

    /// Forget `peer_id` once no link in either direction is left
    fn release_if_unlinked(&self, peer_id: &str) {
        let links = self.links();
        let mut state = self.state_mut();
        let linked = links.get(peer_id).map(|l| !l.is_closed()).unwrap_or(false)
            || state.inbound.get(peer_id).copied().unwrap_or(0) > 0;
        if !state.closed && !linked && state.peers.remove(peer_id) {
            debug!(network = %self.network, peer_id = %peer_id, "Mesh member gone");
        }
    }

    async fn send_frame(self: &Arc<Self>, peer_id: &str, frame: Bytes) -> ClientResult<()> {
        let link = self.link(peer_id).await?;
        if let Err(e) = link.write_all(&frame).await {
            self.evict(peer_id, &link);
            let _ = link.close().await;
            self.release_if_unlinked(peer_id);
            return Err(e);
        }
        Ok(())
    }

    /// Serve one inbound link until it ends or the mesh is left
    pub(crate) async fn receive_link<S>(mesh: Arc<MeshShared>, peer_id: String, stream: S)
    where
        S: AsyncRead + Unpin,
    {
        {
            let mut state = mesh.state_mut();
            if state.closed {
                return;
            }
            *state.inbound.entry(peer_id.clone()).or_default() += 1;
            if state.peers.insert(peer_id.clone()) {
                debug!(network = %mesh.network, peer_id = %peer_id, "New mesh member");
            }
        }

        let left = mesh.left.clone();
        let network = mesh.network.clone();
        let weak = Arc::downgrade(&mesh);
        drop(mesh);
        let mut frames = FramedRead::new(stream, mesh_codec());

        loop {
            let frame = tokio::select! {
                _ = left.cancelled() => break,
                frame = frames.next() => frame,
            };

            let payload = match frame {
                Some(Ok(payload)) => payload.freeze(),
                Some(Err(e)) => {
                    warn!(network = %network, peer_id = %peer_id, "Bad mesh frame: {}", e);
                    break;
                }
                None => break,
            };

            let sender = match Weak::upgrade(&weak) {
                Some(mesh) => mesh.sender().clone(),
                None => break,
            };
            let Some(sender) = sender else { break };

            let message = Message {
                from: peer_id.clone(),
                payload,
            };
            let delivered = tokio::select! {
                _ = left.cancelled() => false,
                res = sender.send(message) => res.is_ok(),
            };
            if !delivered {
                break;
            }
        }

        if let Some(mesh) = weak.upgrade() {
            {
                let mut state = mesh.state_mut();
                if let Some(count) = state.inbound.get_mut(&peer_id) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        state.inbound.remove(&peer_id);
                    }
                }
            }
            mesh.release_if_unlinked(&peer_id);
        }

        debug!(network = %network, peer_id = %peer_id, "Mesh link closed");
    }
}

/// Undoes a join that did not run to completion
struct PendingJoin {
    shared: Arc<MeshShared>,
    joined: bool,
    done: bool,
}

impl PendingJoin {
    fn complete(mut self) {
        self.done = true;
    }
}

impl Drop for PendingJoin {
    fn drop(&mut self) {
        if self.done {
            return;
        }

        let shared = &self.shared;
        shared.state_mut().closed = true;
        shared.sender().take();
        shared.left.cancel();
        shared.client.unregister_mesh(&shared.network, shared);

        let links: Vec<Arc<Connection>> = shared.links().drain().map(|(_, l)| l).collect();
        if !self.joined && links.is_empty() {
            return;
        }

        let joined = self.joined;
        let transport = shared.client.transport().clone();
        let network = shared.network.clone();
        let withdraw = async move {
            for link in links {
                let _ = link.close().await;
            }
            if joined {
                match transport.leave_mesh(&network).await {
                    Ok(()) => debug!(network = %network, "Withdrew from abandoned mesh join"),
                    Err(e) => warn!(network = %network, "Transport failed to leave mesh: {}", e),
                }
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(withdraw);
            }
            Err(_) => warn!(network = %shared.network, "No runtime to withdraw abandoned mesh join"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ErrorKind;
    use async_trait::async_trait;
    use cloudbridge_proto::MAX_HANDSHAKE_LEN;
    use cloudbridge_transport::{
        BoxedPeerStream, MemoryNetwork, MemoryTransport, PeerTransport, TransportResult,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Memory endpoint that counts mesh membership calls
    #[derive(Debug)]
    struct CountingTransport {
        inner: MemoryTransport,
        stall_dials: bool,
        joins: AtomicUsize,
        leaves: AtomicUsize,
    }

    impl CountingTransport {
        fn new(inner: MemoryTransport) -> Self {
            Self {
                inner,
                stall_dials: false,
                joins: AtomicUsize::new(0),
                leaves: AtomicUsize::new(0),
            }
        }

        fn stalling_dials(mut self) -> Self {
            self.stall_dials = true;
            self
        }
    }

    #[async_trait]
    impl PeerTransport for CountingTransport {
        fn local_peer_id(&self) -> String {
            self.inner.local_peer_id()
        }

        async fn dial(&self, peer_id: &str) -> TransportResult<BoxedPeerStream> {
            if self.stall_dials {
                std::future::pending::<()>().await;
            }
            self.inner.dial(peer_id).await
        }

        async fn accept(&self) -> TransportResult<Option<(BoxedPeerStream, String)>> {
            self.inner.accept().await
        }

        async fn join_mesh(&self, network: &str) -> TransportResult<Vec<String>> {
            self.joins.fetch_add(1, Ordering::SeqCst);
            self.inner.join_mesh(network).await
        }

        async fn leave_mesh(&self, network: &str) -> TransportResult<()> {
            self.leaves.fetch_add(1, Ordering::SeqCst);
            self.inner.leave_mesh(network).await
        }

        async fn close(&self) -> TransportResult<()> {
            self.inner.close().await
        }
    }

    async fn client_over(transport: Arc<dyn PeerTransport>) -> Client {
        let config = Config::builder()
            .token("t")
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let client = Client::new(config, transport).unwrap();
        client.initialize().await.unwrap();
        let server = client.clone();
        tokio::spawn(async move { server.serve().await });
        client
    }

    async fn member(network: &MemoryNetwork, id: &str) -> Client {
        client_over(Arc::new(network.endpoint(id))).await
    }

    #[tokio::test]
    async fn test_join_rejects_empty_and_duplicate_names() {
        let network = MemoryNetwork::new();
        let a = member(&network, "a").await;

        assert!(a.join_mesh("").await.is_err());
        let _mesh = a.join_mesh("lan").await.unwrap();
        assert!(a.join_mesh("lan").await.is_err());
    }

    #[tokio::test]
    async fn test_join_announces_to_existing_members() {
        let network = MemoryNetwork::new();
        let a = member(&network, "a").await;
        let b = member(&network, "b").await;

        let mesh_a = a.join_mesh("lan").await.unwrap();
        assert!(mesh_a.peers().is_empty());

        let mesh_b = b.join_mesh("lan").await.unwrap();
        assert_eq!(mesh_b.peers(), vec!["a".to_string()]);

        mesh_b.send("a", b"hi").await.unwrap();
        let message = tokio::time::timeout(Duration::from_secs(2), mesh_a.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.from, "b");
        assert_eq!(message.payload, Bytes::from_static(b"hi"));

        // The announcement taught `a` about `b`.
        assert_eq!(mesh_a.peers(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent_and_ends_queue() {
        let network = MemoryNetwork::new();
        let a = member(&network, "a").await;
        let mesh = a.join_mesh("lan").await.unwrap();

        mesh.leave().await.unwrap();
        mesh.leave().await.unwrap();
        assert!(mesh.is_closed());

        assert!(mesh.broadcast(b"x").await.unwrap_err().is_closed());
        assert!(mesh.send("b", b"x").await.unwrap_err().is_closed());
        assert_eq!(mesh.recv().await, None);
        assert_eq!(mesh.try_recv(), None);

        // Leaving frees the name for a fresh membership.
        let again = a.join_mesh("lan").await.unwrap();
        assert!(!again.is_closed());
    }

    #[tokio::test]
    async fn test_send_requires_peer_and_bounded_frames() {
        let network = MemoryNetwork::new();
        let a = member(&network, "a").await;
        let mesh = a.join_mesh("lan").await.unwrap();

        assert!(matches!(
            mesh.send("", b"x").await,
            Err(ClientError::InvalidArgument(_))
        ));
        let huge = vec![0u8; MAX_MESH_FRAME + 1];
        assert!(matches!(
            mesh.broadcast(&huge).await,
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_join_rejects_unencodable_network_name() {
        let network = MemoryNetwork::new();
        let a = member(&network, "a").await;

        let name = "n".repeat(MAX_HANDSHAKE_LEN);
        let err = a.join_mesh(&name).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(a.mesh(&name).is_none());
    }

    #[tokio::test]
    async fn test_cancelled_join_withdraws_membership() {
        let network = MemoryNetwork::new();
        let other = network.endpoint("other");
        other.join_mesh("lan").await.unwrap();

        let transport = Arc::new(CountingTransport::new(network.endpoint("a")).stalling_dials());
        let a = client_over(transport.clone()).await;

        // The announcement dial never completes, so the join is abandoned mid-way.
        let joined = tokio::time::timeout(Duration::from_millis(100), a.join_mesh("lan")).await;
        assert!(joined.is_err());
        assert_eq!(transport.joins.load(Ordering::SeqCst), 1);

        tokio::time::timeout(Duration::from_secs(2), async {
            while transport.leaves.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("abandoned join never left the transport mesh");
        assert_eq!(transport.leaves.load(Ordering::SeqCst), 1);
        assert!(a.mesh("lan").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_leave_withdraws_once() {
        let network = MemoryNetwork::new();
        let transport = Arc::new(CountingTransport::new(network.endpoint("a")));
        let a = client_over(transport.clone()).await;
        let mesh = a.join_mesh("lan").await.unwrap();

        let leavers: Vec<_> = (0..8)
            .map(|_| {
                let mesh = mesh.clone();
                tokio::spawn(async move { mesh.leave().await })
            })
            .collect();
        for leaver in leavers {
            leaver.await.unwrap().unwrap();
        }

        assert!(mesh.is_closed());
        let end = tokio::time::timeout(Duration::from_secs(2), mesh.recv())
            .await
            .unwrap();
        assert_eq!(end, None);
        assert_eq!(transport.leaves.load(Ordering::SeqCst), 1);
        assert!(a.mesh("lan").is_none());
    }
}
