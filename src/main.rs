//! CloudBridge CLI - peer connections, tunnels and mesh messaging
//!
//! Thin command-line front end over `cloudbridge-client` using the direct TCP
//! transport, where every peer is addressed by `host:port`.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use cloudbridge_client::{Client, Config, DispatchConfig, ServiceConfig, TunnelConfig};
use cloudbridge_transport::TcpPeerTransport;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// CloudBridge - reach peers directly, forward ports and talk over meshes
#[derive(Parser, Debug)]
#[command(name = "cloudbridge")]
#[command(about = "CloudBridge - reach peers directly, forward ports and talk over meshes")]
#[command(version)]
#[command(long_about = r#"
CloudBridge opens authenticated streams to other peers, forwards local ports
to ports exposed by a remote peer, and exchanges messages inside named meshes.

EXAMPLES:
  # Expose local services to other peers
  cloudbridge --listen 0.0.0.0:7400 serve --allow-port 5432

  # Forward local port 15432 to port 5432 on that peer
  cloudbridge tunnel 10.0.0.7:7400 --local-port 15432 --remote-port 5432

  # Join a mesh and greet everyone
  cloudbridge --listen 0.0.0.0:7401 --advertise 10.0.0.8:7401 \
    mesh lan --mesh-peer 10.0.0.7:7400 --broadcast hi

ENVIRONMENT VARIABLES:
  CLOUDBRIDGE_TOKEN      Authentication token (JWT)
  CLOUDBRIDGE_REGION     Region this peer registers services in
  CLOUDBRIDGE_ADVERTISE  Address other peers dial to reach this one
  CLOUDBRIDGE_LOG_LEVEL  Log filter (trace, debug, info, warn, error or
                         directives such as cloudbridge=debug)
"#)]
struct Cli {
    #[command(flatten)]
    client: ClientArgs,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log filter (trace, debug, info, warn, error or tracing directives)
    #[arg(long, env = "CLOUDBRIDGE_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Authentication token (JWT)
    #[arg(long, env = "CLOUDBRIDGE_TOKEN", global = true)]
    token: Option<String>,

    /// Region (e.g., eu-central)
    #[arg(long, env = "CLOUDBRIDGE_REGION", default_value = "eu-central", global = true)]
    region: String,

    /// Operation timeout in seconds
    #[arg(long, default_value = "30", global = true)]
    timeout: u64,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long, global = true)]
    insecure_skip_verify: bool,

    /// Address to accept peer streams on (e.g., 0.0.0.0:7400)
    #[arg(long, global = true)]
    listen: Option<String>,

    /// Address peers should dial back, required when listening on 0.0.0.0
    #[arg(long, env = "CLOUDBRIDGE_ADVERTISE", global = true)]
    advertise: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a stream to a peer, optionally send a line, and print the reply
    Connect {
        /// Peer address (host:port)
        peer: String,

        /// Line to send once connected
        #[arg(long)]
        message: Option<String>,
    },

    /// Forward a local port to a port on a remote peer
    Tunnel {
        /// Peer address (host:port)
        peer: String,

        /// Local port to listen on
        #[arg(long)]
        local_port: i32,

        /// Port on the remote peer to reach
        #[arg(long)]
        remote_port: i32,

        /// Tunnel protocol (tcp, quic)
        #[arg(long, default_value = "tcp")]
        protocol: String,
    },

    /// Accept peer streams and forward tunnels to local services
    Serve {
        /// Only allow tunnels to these local ports (repeatable)
        #[arg(long = "allow-port")]
        allow_ports: Vec<u16>,
    },

    /// List services registered under a name
    Discover {
        /// Service name
        service: String,

        /// Register `name:port` before the lookup (repeatable)
        #[arg(long)]
        register: Vec<String>,
    },

    /// Join a mesh network and print messages from its members
    Mesh {
        /// Mesh network name
        network: String,

        /// Known member address (repeatable)
        #[arg(long = "mesh-peer")]
        mesh_peers: Vec<String>,

        /// Message to broadcast after joining
        #[arg(long)]
        broadcast: Option<String>,
    },

    /// Print client health as JSON
    Health,

    /// Print build information
    Version,
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool, log_level: &str) {
    let log_level = if verbose { "debug" } else { log_level };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Client log level for a tracing filter
///
/// The client only knows `debug`, `info`, `warn` and `error`; `trace` maps to
/// `debug`, and for directive lists the most verbose level named wins.
fn client_log_level(filter: &str) -> &'static str {
    let rank = |level: &str| match level.trim().to_ascii_lowercase().as_str() {
        "trace" | "debug" => Some(0),
        "info" => Some(1),
        "warn" => Some(2),
        "error" => Some(3),
        _ => None,
    };

    let most_verbose = filter
        .split(',')
        .filter_map(|directive| rank(directive.rsplit('=').next().unwrap_or(directive)))
        .min();

    match most_verbose {
        Some(0) => "debug",
        Some(2) => "warn",
        Some(3) => "error",
        _ => "info",
    }
}

/// Build and initialize a client over the TCP transport
async fn start_client(args: &ClientArgs, log_level: &str, mesh_seeds: Vec<String>) -> Result<Client> {
    let config = Config::builder()
        .token(args.token.clone().unwrap_or_default())
        .region(args.region.clone())
        .timeout(Duration::from_secs(args.timeout))
        .log_level(client_log_level(log_level))
        .insecure_skip_verify(args.insecure_skip_verify)
        .build()
        .context("Invalid client configuration")?;

    if args.insecure_skip_verify {
        warn!("Certificate verification disabled (insecure mode)");
    }

    let transport = match &args.listen {
        Some(addr) => TcpPeerTransport::bind(addr)
            .await
            .with_context(|| format!("Failed to listen on {}", addr))?,
        None if args.advertise.is_some() => bail!("--advertise requires --listen"),
        None => TcpPeerTransport::dial_only(format!("cloudbridge-{}", std::process::id())),
    };
    let transport = match &args.advertise {
        Some(addr) => transport.with_advertise_addr(addr.clone()),
        None => transport,
    };
    let transport = transport.with_mesh_seeds(mesh_seeds);

    let client = Client::new(config, Arc::new(transport)).context("Failed to create client")?;
    client
        .initialize()
        .await
        .context("Failed to initialize client")?;

    info!(peer_id = %client.local_peer_id(), region = %args.region, "Client ready");
    Ok(client)
}

fn spawn_server(client: &Client) {
    let server = client.clone();
    tokio::spawn(async move {
        if let Err(e) = server.serve().await {
            error!("Peer accept loop failed: {}", e);
        }
    });
}

async fn wait_for_ctrl_c() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

async fn run_connect(client: &Client, peer: &str, message: Option<String>) -> Result<()> {
    let conn = client
        .connect(peer)
        .await
        .with_context(|| format!("Failed to connect to {}", peer))?;
    info!(peer_id = %conn.peer_id(), connection_id = %conn.id(), "Connected");

    if let Some(message) = message {
        conn.write_all(format!("{}\n", message).as_bytes())
            .await
            .context("Failed to send message")?;

        let mut buf = [0u8; 4096];
        let timeout = client.config().timeout;
        loop {
            match tokio::time::timeout(timeout, conn.read(&mut buf)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => print!("{}", String::from_utf8_lossy(&buf[..n])),
                Ok(Err(e)) => {
                    warn!("Read failed: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }
    }

    let metrics = conn.metrics().context("Connection closed unexpectedly")?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    conn.close().await.context("Failed to close connection")?;
    Ok(())
}

async fn run_mesh(client: &Client, network: &str, broadcast: Option<String>) -> Result<()> {
    let mesh = client
        .join_mesh(network)
        .await
        .with_context(|| format!("Failed to join mesh {}", network))?;
    info!(network = %network, peers = ?mesh.peers(), "Joined mesh");

    if let Some(message) = broadcast {
        if let Err(e) = mesh.broadcast(message.as_bytes()).await {
            warn!("Broadcast incomplete: {}", e);
        }
    }

    let printer = {
        let mesh = mesh.clone();
        async move {
            while let Some(message) = mesh.recv().await {
                println!("[{}] {}", message.from, String::from_utf8_lossy(&message.payload));
            }
        }
    };

    tokio::select! {
        _ = printer => {}
        res = wait_for_ctrl_c() => res?,
    }

    mesh.leave().await.context("Failed to leave mesh")?;
    Ok(())
}

fn parse_registration(entry: &str) -> Result<ServiceConfig> {
    let (name, port) = entry
        .rsplit_once(':')
        .with_context(|| format!("Expected name:port, got {}", entry))?;
    let port: i32 = port
        .parse()
        .with_context(|| format!("Invalid port in {}", entry))?;
    Ok(ServiceConfig::new(name, port))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, &cli.log_level);
    let log_filter = if cli.verbose {
        "debug".to_string()
    } else {
        cli.log_level.clone()
    };

    match cli.command {
        Commands::Version => {
            println!(
                "cloudbridge {} ({} built {})",
                env!("GIT_TAG"),
                env!("GIT_HASH"),
                env!("BUILD_TIME")
            );
            Ok(())
        }

        Commands::Connect { peer, message } => {
            let client = start_client(&cli.client, &log_filter, Vec::new()).await?;
            let result = run_connect(&client, &peer, message).await;
            client.close().await.context("Failed to close client")?;
            result
        }

        Commands::Tunnel {
            peer,
            local_port,
            remote_port,
            protocol,
        } => {
            let client = start_client(&cli.client, &log_filter, Vec::new()).await?;
            if cli.client.listen.is_some() {
                spawn_server(&client);
            }

            let tunnel = client
                .create_tunnel(TunnelConfig::new(local_port, peer.clone(), remote_port).with_protocol(protocol))
                .await
                .context("Failed to create tunnel")?;
            info!(
                "Forwarding {} to port {} on {}",
                tunnel.local_addr(),
                remote_port,
                peer
            );

            wait_for_ctrl_c().await?;
            tunnel.close().await.context("Failed to close tunnel")?;
            client.close().await.context("Failed to close client")?;
            info!(pairings = tunnel.total_pairings(), "CloudBridge stopped");
            Ok(())
        }

        Commands::Serve { allow_ports } => {
            if cli.client.listen.is_none() {
                bail!("serve requires --listen <address>");
            }
            let client = start_client(&cli.client, &log_filter, Vec::new()).await?;

            let mut dispatch = client.dispatch_config();
            if !allow_ports.is_empty() {
                info!(ports = ?allow_ports, "Restricting tunnels to allowed ports");
                dispatch = DispatchConfig {
                    allowed_ports: Some(allow_ports),
                    ..dispatch
                };
            }
            client.set_dispatch_config(dispatch);

            info!(peer_id = %client.local_peer_id(), "Accepting peer streams");
            tokio::select! {
                res = client.serve() => res.context("Peer accept loop failed")?,
                res = wait_for_ctrl_c() => res?,
            }

            client.close().await.context("Failed to close client")?;
            info!("CloudBridge stopped");
            Ok(())
        }

        Commands::Discover { service, register } => {
            let client = start_client(&cli.client, &log_filter, Vec::new()).await?;
            for entry in &register {
                let registered = client
                    .register_service(parse_registration(entry)?)
                    .with_context(|| format!("Failed to register {}", entry))?;
                info!(service_id = %registered.id, "Registered service");
            }

            let services = client
                .discover_services(&service)
                .context("Service discovery failed")?;
            println!("{}", serde_json::to_string_pretty(&services)?);

            client.close().await.context("Failed to close client")?;
            Ok(())
        }

        Commands::Mesh {
            network,
            mesh_peers,
            broadcast,
        } => {
            let client = start_client(&cli.client, &log_filter, mesh_peers).await?;
            if cli.client.listen.is_some() {
                spawn_server(&client);
            } else {
                warn!("Not listening; mesh members cannot reach this peer");
            }

            let result = run_mesh(&client, &network, broadcast).await;
            client.close().await.context("Failed to close client")?;
            result
        }

        Commands::Health => {
            let client = start_client(&cli.client, &log_filter, Vec::new()).await?;
            let health = client.health().context("Health check failed")?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            client.close().await.context("Failed to close client")?;
            Ok(())
        }
    }
}
