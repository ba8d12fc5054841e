//! Client: owns the transport, live connections, tunnels, meshes and services

use crate::config::Config;
use crate::connection::{Connection, ConnectionInner};
use crate::dispatcher::{self, DispatchConfig};
use crate::error::{ClientError, ClientResult};
use crate::mesh::{Mesh, MeshShared};
use crate::service::{Service, ServiceConfig};
use crate::tunnel::{Tunnel, TunnelConfig};
use cloudbridge_auth::{resolve_tenant, AuthContext, JwtAuthContext};
use cloudbridge_transport::{BoxedPeerStream, PeerTransport, TransportContext};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Called with the peer id after `connect` succeeds
pub type ConnectHandler = Arc<dyn Fn(&str) + Send + Sync>;
/// Called once per closed connection with the peer id and the close error, if any
pub type DisconnectHandler = Arc<dyn Fn(&str, Option<&ClientError>) + Send + Sync>;
/// Called with the peer id and the number of attempts it took
pub type ReconnectHandler = Arc<dyn Fn(&str, u32) + Send + Sync>;
/// Receives inbound streams that did not open with a handshake
pub type GenericConnectionHandler = Arc<dyn Fn(Connection) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    Uninitialized,
    Ready,
    Closed,
}

/// Point-in-time health snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Health {
    pub status: String,
    /// Mean round-trip time over live connections that report one
    pub latency: Duration,
    pub connected_peers: usize,
}

#[derive(Default)]
struct Callbacks {
    on_connect: Option<ConnectHandler>,
    on_disconnect: Option<DisconnectHandler>,
    on_reconnect: Option<ReconnectHandler>,
    on_generic: Option<GenericConnectionHandler>,
}

struct Lifecycle {
    state: ClientState,
    tenant_id: Option<String>,
}

pub(crate) struct ClientShared {
    config: Config,
    transport: Arc<dyn PeerTransport>,
    auth: Arc<dyn AuthContext>,
    lifecycle: RwLock<Lifecycle>,
    connections: RwLock<HashMap<Uuid, Weak<ConnectionInner>>>,
    services: RwLock<HashMap<String, Service>>,
    meshes: RwLock<HashMap<String, Weak<MeshShared>>>,
    callbacks: RwLock<Callbacks>,
    dispatch: RwLock<DispatchConfig>,
    shutdown: CancellationToken,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl ClientShared {
    /// Bookkeeping for a connection that just closed
    pub(crate) fn connection_closed(&self, id: Uuid, peer_id: &str, err: Option<&ClientError>) {
        write(&self.connections).remove(&id);

        let handler = read(&self.callbacks).on_disconnect.clone();
        if let Some(handler) = handler {
            handler(peer_id, err);
        }
    }
}

/// Entry point of the session layer
///
/// Cheap to clone; every clone drives the same client. Lifecycle is
/// `Uninitialized -> Ready -> Closed`: operations other than `close` require
/// `Ready`, and nothing works after `close`.
///
/// Callbacks run synchronously on the task performing the operation that
/// triggers them, so they must not block.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    /// Create a client that reads tenant identity from JWT claims
    pub fn new(config: Config, transport: Arc<dyn PeerTransport>) -> ClientResult<Self> {
        Self::with_auth(config, transport, Arc::new(JwtAuthContext::new()))
    }

    pub fn with_auth(
        config: Config,
        transport: Arc<dyn PeerTransport>,
        auth: Arc<dyn AuthContext>,
    ) -> ClientResult<Self> {
        config.validate()?;

        let dispatch = DispatchConfig {
            handshake_timeout: config.timeout,
            ..Default::default()
        };

        Ok(Self {
            shared: Arc::new(ClientShared {
                config,
                transport,
                auth,
                lifecycle: RwLock::new(Lifecycle {
                    state: ClientState::Uninitialized,
                    tenant_id: None,
                }),
                connections: RwLock::new(HashMap::new()),
                services: RwLock::new(HashMap::new()),
                meshes: RwLock::new(HashMap::new()),
                callbacks: RwLock::new(Callbacks::default()),
                dispatch: RwLock::new(dispatch),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Resolve the tenant and initialize the transport
    pub async fn initialize(&self) -> ClientResult<()> {
        match self.state() {
            ClientState::Ready => return Ok(()),
            ClientState::Closed => return Err(ClientError::Closed("client")),
            ClientState::Uninitialized => {}
        }

        let config = &self.shared.config;
        let tenant_id = resolve_tenant(self.shared.auth.as_ref(), &config.token);
        let ctx = TransportContext {
            tenant_id: tenant_id.clone(),
            region: config.region.clone(),
            timeout: config.timeout,
            insecure_skip_verify: config.insecure_skip_verify,
        };

        tokio::time::timeout(config.timeout, self.shared.transport.initialize(&ctx))
            .await
            .map_err(|_| ClientError::Timeout(config.timeout))?
            .map_err(|e| ClientError::transport("initialize transport", &config.region, e))?;

        let mut lifecycle = write(&self.shared.lifecycle);
        if lifecycle.state == ClientState::Closed {
            return Err(ClientError::Closed("client"));
        }
        lifecycle.state = ClientState::Ready;
        lifecycle.tenant_id = Some(tenant_id.clone());
        drop(lifecycle);

        info!(
            tenant_id = %tenant_id,
            region = %config.region,
            peer_id = %self.shared.transport.local_peer_id(),
            "Client initialized"
        );
        Ok(())
    }

    pub fn state(&self) -> ClientState {
        read(&self.shared.lifecycle).state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ClientState::Closed
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Tenant resolved during `initialize`
    pub fn tenant_id(&self) -> Option<String> {
        read(&self.shared.lifecycle).tenant_id.clone()
    }

    pub fn local_peer_id(&self) -> String {
        self.shared.transport.local_peer_id()
    }

    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        write(&self.shared.callbacks).on_connect = Some(Arc::new(handler));
    }

    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(&str, Option<&ClientError>) + Send + Sync + 'static,
    {
        write(&self.shared.callbacks).on_disconnect = Some(Arc::new(handler));
    }

    pub fn on_reconnect<F>(&self, handler: F)
    where
        F: Fn(&str, u32) + Send + Sync + 'static,
    {
        write(&self.shared.callbacks).on_reconnect = Some(Arc::new(handler));
    }

    /// Handler for inbound streams that are neither tunnels nor mesh links
    ///
    /// Without one, such streams are closed.
    pub fn on_generic_connection<F>(&self, handler: F)
    where
        F: Fn(Connection) + Send + Sync + 'static,
    {
        write(&self.shared.callbacks).on_generic = Some(Arc::new(handler));
    }

    pub fn set_dispatch_config(&self, config: DispatchConfig) {
        *write(&self.shared.dispatch) = config;
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        read(&self.shared.dispatch).clone()
    }

    /// Open a connection to `peer_id`
    pub async fn connect(&self, peer_id: &str) -> ClientResult<Connection> {
        let conn = self.dial(peer_id).await?;
        info!(peer_id = %peer_id, connection_id = %conn.id(), "Connected to peer");

        let handler = read(&self.shared.callbacks).on_connect.clone();
        if let Some(handler) = handler {
            handler(peer_id);
        }
        Ok(conn)
    }

    /// Connect with exponential backoff from the configured retry policy
    ///
    /// Only transport failures are retried. Fires the reconnect callback on
    /// success instead of the connect callback.
    pub async fn reconnect(&self, peer_id: &str) -> ClientResult<Connection> {
        let mut backoff = self.shared.config.retry_policy.backoff();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let err = match self.dial(peer_id).await {
                Ok(conn) => {
                    info!(peer_id = %peer_id, attempts, "Reconnected to peer");
                    let handler = read(&self.shared.callbacks).on_reconnect.clone();
                    if let Some(handler) = handler {
                        handler(peer_id, attempts);
                    }
                    return Ok(conn);
                }
                Err(e) if !e.is_remote() => return Err(e),
                Err(e) => e,
            };

            warn!(peer_id = %peer_id, attempt = attempts, "Reconnect attempt failed: {}", err);

            let waited = tokio::select! {
                _ = self.shared.shutdown.cancelled() => return Err(ClientError::Closed("client")),
                waited = backoff.wait() => waited,
            };
            if waited.is_err() {
                return Err(ClientError::RetriesExhausted {
                    peer: peer_id.to_string(),
                    attempts,
                    last: Box::new(err),
                });
            }
        }
    }

    /// Start forwarding a local port to a port on a remote peer
    pub async fn create_tunnel(&self, config: TunnelConfig) -> ClientResult<Tunnel> {
        self.ensure_ready()?;
        Tunnel::start(self.clone(), config).await
    }

    pub async fn join_mesh(&self, network: &str) -> ClientResult<Mesh> {
        self.ensure_ready()?;
        if network.is_empty() {
            return Err(ClientError::InvalidArgument(
                "network name cannot be empty".to_string(),
            ));
        }
        Mesh::join(self.clone(), network).await
    }

    /// Add or replace a local service advertisement
    pub fn register_service(&self, config: ServiceConfig) -> ClientResult<Service> {
        self.ensure_ready()?;
        let service = Service::register(
            config,
            &self.shared.config.region,
            self.shared.transport.local_peer_id(),
        )?;

        info!(service_id = %service.id, port = service.port, "Registered service");
        write(&self.shared.services).insert(service.id.clone(), service.clone());
        Ok(service)
    }

    pub fn deregister_service(&self, service_id: &str) -> ClientResult<()> {
        self.ensure_ready()?;
        match write(&self.shared.services).remove(service_id) {
            Some(_) => {
                info!(service_id = %service_id, "Deregistered service");
                Ok(())
            }
            None => Err(ClientError::ServiceNotFound(service_id.to_string())),
        }
    }

    /// Services registered on this client with exactly this name
    pub fn discover_services(&self, name: &str) -> ClientResult<Vec<Service>> {
        self.ensure_ready()?;
        if name.is_empty() {
            return Err(ClientError::InvalidArgument(
                "service name cannot be empty".to_string(),
            ));
        }

        let mut found: Vec<Service> = read(&self.shared.services)
            .values()
            .filter(|s| s.name == name)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    pub fn health(&self) -> ClientResult<Health> {
        self.ensure_ready()?;

        let live = self.live_connections();
        let rtts: Vec<Duration> = live.iter().filter_map(|c| c.rtt()).collect();
        let latency = if rtts.is_empty() {
            Duration::ZERO
        } else {
            rtts.iter().sum::<Duration>() / rtts.len() as u32
        };

        Ok(Health {
            status: "healthy".to_string(),
            latency,
            connected_peers: self.connected_peers().len(),
        })
    }

    /// Distinct peers with at least one open connection
    pub fn connected_peers(&self) -> Vec<String> {
        self.live_connections()
            .iter()
            .map(|c| c.peer_id().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Accept inbound peer streams until the client or the transport closes
    pub async fn serve(&self) -> ClientResult<()> {
        self.ensure_ready()?;
        let transport = self.shared.transport.clone();
        info!(peer_id = %transport.local_peer_id(), "Accepting peer streams");

        loop {
            let accepted = tokio::select! {
                _ = self.shared.shutdown.cancelled() => break,
                accepted = transport.accept() => accepted,
            };

            match accepted {
                Ok(Some((stream, peer_id))) => {
                    self.handle_incoming(stream, peer_id);
                }
                Ok(None) => {
                    debug!("Transport stopped accepting");
                    break;
                }
                Err(e) => {
                    if self.is_closed() {
                        break;
                    }
                    return Err(ClientError::transport(
                        "accept on",
                        &transport.local_peer_id(),
                        e,
                    ));
                }
            }
        }

        Ok(())
    }

    /// Dispatch one inbound stream on its own task
    pub fn handle_incoming(&self, stream: BoxedPeerStream, peer_id: String) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move { dispatcher::dispatch(client, stream, peer_id).await })
    }

    /// Close live connections, leave meshes and shut the transport down
    ///
    /// Only the first call tears down; every call returns once the client is
    /// marked closed. Failures closing connections or meshes are logged and
    /// do not stop the transport from closing.
    pub async fn close(&self) -> ClientResult<()> {
        {
            let mut lifecycle = write(&self.shared.lifecycle);
            if lifecycle.state == ClientState::Closed {
                return Ok(());
            }
            lifecycle.state = ClientState::Closed;
        }

        info!("Closing client");
        self.shared.shutdown.cancel();

        let meshes: Vec<Mesh> = write(&self.shared.meshes)
            .drain()
            .filter_map(|(_, mesh)| mesh.upgrade())
            .map(Mesh::from_shared)
            .collect();
        for mesh in meshes {
            if let Err(e) = mesh.leave().await {
                warn!(network = %mesh.network(), "Failed to leave mesh: {}", e);
            }
        }

        for conn in self.live_connections() {
            if let Err(e) = conn.close().await {
                warn!(peer_id = %conn.peer_id(), "Failed to close connection: {}", e);
            }
        }

        let local = self.shared.transport.local_peer_id();
        self.shared
            .transport
            .close()
            .await
            .map_err(|e| ClientError::transport("close transport", &local, e))?;

        info!("Client closed");
        Ok(())
    }

    pub(crate) fn ensure_ready(&self) -> ClientResult<()> {
        match self.state() {
            ClientState::Ready => Ok(()),
            ClientState::Uninitialized => Err(ClientError::NotEstablished("client")),
            ClientState::Closed => Err(ClientError::Closed("client")),
        }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.shared.transport
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shared.shutdown
    }

    pub(crate) fn generic_handler(&self) -> Option<GenericConnectionHandler> {
        read(&self.shared.callbacks).on_generic.clone()
    }

    /// Dial without firing callbacks
    pub(crate) async fn dial(&self, peer_id: &str) -> ClientResult<Connection> {
        self.ensure_ready()?;
        if peer_id.is_empty() {
            return Err(ClientError::InvalidArgument(
                "peer id cannot be empty".to_string(),
            ));
        }

        let timeout = self.shared.config.timeout;
        let stream = tokio::time::timeout(timeout, self.shared.transport.dial(peer_id))
            .await
            .map_err(|_| ClientError::Timeout(timeout))?
            .map_err(|e| ClientError::transport("dial peer", peer_id, e))?;

        self.adopt(stream)
    }

    /// Wrap a stream in a tracked [`Connection`]
    pub(crate) fn adopt(&self, stream: BoxedPeerStream) -> ClientResult<Connection> {
        let conn = Connection::new(stream, Arc::downgrade(&self.shared));

        // Holding the lifecycle lock keeps `close` from missing this connection.
        let lifecycle = read(&self.shared.lifecycle);
        if lifecycle.state == ClientState::Closed {
            return Err(ClientError::Closed("client"));
        }
        write(&self.shared.connections).insert(conn.id(), conn.downgrade());
        Ok(conn)
    }

    fn live_connections(&self) -> Vec<Arc<ConnectionInner>> {
        read(&self.shared.connections)
            .values()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.is_closed())
            .collect()
    }

    pub(crate) fn register_mesh(&self, network: &str, mesh: Weak<MeshShared>) -> ClientResult<()> {
        let mut meshes = write(&self.shared.meshes);
        if meshes.get(network).and_then(Weak::upgrade).is_some() {
            return Err(ClientError::InvalidArgument(format!(
                "already a member of mesh {}",
                network
            )));
        }
        meshes.insert(network.to_string(), mesh);
        Ok(())
    }

    pub(crate) fn unregister_mesh(&self, network: &str, mesh: &Arc<MeshShared>) {
        let mut meshes = write(&self.shared.meshes);
        let is_same = meshes
            .get(network)
            .map(|m| std::ptr::eq(m.as_ptr(), Arc::as_ptr(mesh)))
            .unwrap_or(false);
        if is_same {
            meshes.remove(network);
        }
    }

    pub(crate) fn mesh(&self, network: &str) -> Option<Arc<MeshShared>> {
        read(&self.shared.meshes).get(network).and_then(Weak::upgrade)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("region", &self.shared.config.region)
            .field("transport", &self.shared.transport)
            .finish()
    }
}
