//! Inbound stream dispatch
//!
//! Every unsolicited peer stream starts here. The first line decides its fate:
//!
//! - `{"type":"tunnel","port":N}`: forward to `local_host:N` if allowed
//! - `{"type":"mesh","network":...}`: echo the line back and attach to the
//!   joined mesh of that name; streams for other networks close unanswered
//! - anything that is not a structured record: generic handler, or close
//! - a structured record that cannot be honoured: close

use crate::client::Client;
use crate::forward::forward;
use crate::mesh::MeshShared;
use bytes::{Bytes, BytesMut};
use cloudbridge_proto::{Handshake, HandshakeError, MAX_HANDSHAKE_LEN};
use cloudbridge_transport::{BoxedPeerStream, PrefixedStream};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// How inbound streams are served
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Host tunnel handshakes are forwarded to
    pub local_host: String,
    /// Ports peers may reach; `None` allows any
    pub allowed_ports: Option<Vec<u16>>,
    /// How long a peer gets to send its first line
    pub handshake_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            local_host: "127.0.0.1".to_string(),
            allowed_ports: None,
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatchConfig {
    pub fn with_allowed_ports(mut self, ports: Vec<u16>) -> Self {
        self.allowed_ports = Some(ports);
        self
    }

    pub fn is_port_allowed(&self, port: u16) -> bool {
        match &self.allowed_ports {
            Some(ports) => ports.contains(&port),
            None => true,
        }
    }
}

pub(crate) async fn dispatch(client: Client, mut stream: BoxedPeerStream, peer_id: String) {
    let config = client.dispatch_config();
    let mut buf = BytesMut::with_capacity(256);

    let timed_out = match tokio::time::timeout(
        config.handshake_timeout,
        read_first_line(&mut stream, &mut buf),
    )
    .await
    {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            debug!(peer_id = %peer_id, "Failed to read from inbound stream: {}", e);
            return;
        }
        Err(_) => true,
    };

    if buf.is_empty() && !timed_out {
        debug!(peer_id = %peer_id, "Inbound stream closed before sending anything");
        return;
    }

    let newline = buf.iter().position(|b| *b == b'\n');
    let line_end = newline.map(|i| i + 1).unwrap_or(buf.len());
    let parsed = if timed_out && newline.is_none() {
        Err(HandshakeError::NotStructured)
    } else {
        Handshake::parse(&buf[..line_end])
    };

    match parsed {
        Ok(Handshake::Tunnel { port }) => {
            let rest = buf.split_off(line_end).freeze();
            serve_tunnel(&client, &config, stream, rest, port, &peer_id).await;
        }
        Ok(Handshake::Mesh { network }) => {
            let rest = buf.split_off(line_end).freeze();
            serve_mesh(&client, stream, rest, network, peer_id).await;
        }
        Err(HandshakeError::NotStructured) => {
            hand_off(&client, stream, buf.freeze(), &peer_id);
        }
        Err(e) => {
            warn!(peer_id = %peer_id, "Closing stream: {}", e);
        }
    }
}

/// Read until a newline, the size limit, or end of stream
async fn read_first_line(stream: &mut BoxedPeerStream, buf: &mut BytesMut) -> io::Result<()> {
    while !buf.contains(&b'\n') && buf.len() < MAX_HANDSHAKE_LEN {
        if stream.read_buf(buf).await? == 0 {
            break;
        }
    }
    Ok(())
}

async fn serve_tunnel(
    client: &Client,
    config: &DispatchConfig,
    stream: BoxedPeerStream,
    rest: Bytes,
    port: u16,
    peer_id: &str,
) {
    if !config.is_port_allowed(port) {
        warn!(peer_id = %peer_id, port, "Refused tunnel to port outside the allowlist");
        return;
    }

    let target = (config.local_host.as_str(), port);
    let local = match tokio::time::timeout(config.handshake_timeout, TcpStream::connect(target)).await
    {
        Ok(Ok(local)) => local,
        Ok(Err(e)) => {
            warn!(
                peer_id = %peer_id,
                "Failed to connect to local service {}:{}: {}",
                config.local_host, port, e
            );
            return;
        }
        Err(_) => {
            warn!(
                peer_id = %peer_id,
                "Timed out connecting to local service {}:{}",
                config.local_host, port
            );
            return;
        }
    };

    let conn = match client.adopt(Box::new(PrefixedStream::new(rest, stream))) {
        Ok(conn) => conn,
        Err(e) => {
            debug!(peer_id = %peer_id, "Dropping tunnel stream: {}", e);
            return;
        }
    };

    info!(peer_id = %peer_id, port, "Forwarding tunnel to local service");
    let stats = forward(local, conn).await;
    debug!(
        peer_id = %peer_id,
        port,
        bytes_to_peer = stats.to_peer,
        bytes_to_local = stats.to_local,
        "Tunnel stream finished"
    );
}

async fn serve_mesh(
    client: &Client,
    mut stream: BoxedPeerStream,
    rest: Bytes,
    network: String,
    peer_id: String,
) {
    let mesh = match client.mesh(&network) {
        Some(mesh) if mesh.is_open() => mesh,
        _ => {
            debug!(peer_id = %peer_id, network = %network, "Mesh link for a network we are not in");
            return;
        }
    };

    let accepted = match Handshake::mesh(&network).encode() {
        Ok(line) => line,
        Err(e) => {
            warn!(peer_id = %peer_id, "Closing stream: {}", e);
            return;
        }
    };
    let written = async {
        stream.write_all(&accepted).await?;
        stream.flush().await
    };
    if let Err(e) = written.await {
        debug!(peer_id = %peer_id, network = %network, "Failed to accept mesh link: {}", e);
        return;
    }

    MeshShared::receive_link(mesh, peer_id, PrefixedStream::new(rest, stream)).await;
}

fn hand_off(client: &Client, stream: BoxedPeerStream, consumed: Bytes, peer_id: &str) {
    let handler = match client.generic_handler() {
        Some(handler) => handler,
        None => {
            debug!(peer_id = %peer_id, "No generic connection handler, closing stream");
            return;
        }
    };

    match client.adopt(Box::new(PrefixedStream::new(consumed, stream))) {
        Ok(conn) => {
            debug!(peer_id = %peer_id, "Handing stream to generic connection handler");
            handler(conn);
        }
        Err(e) => debug!(peer_id = %peer_id, "Dropping generic stream: {}", e),
    }
}
