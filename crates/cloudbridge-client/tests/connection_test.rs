/// Peer connections over real TCP sockets
use cloudbridge_client::{Client, ClientError, Config};
use cloudbridge_transport::TcpPeerTransport;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> Config {
    Config::builder()
        .token("test-token")
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

/// Listening client whose generic handler greets, then echoes
async fn echo_server() -> Client {
    let transport = TcpPeerTransport::bind("127.0.0.1:0").await.unwrap();
    let server = Client::new(config(), Arc::new(transport)).unwrap();
    server.initialize().await.unwrap();

    server.on_generic_connection(|conn| {
        tokio::spawn(async move {
            if conn.write_all(b"hello\n").await.is_err() {
                return;
            }
            let mut buf = [0u8; 1024];
            while let Ok(n) = conn.read(&mut buf).await {
                if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            let _ = conn.close().await;
        });
    });

    let serving = server.clone();
    tokio::spawn(async move { serving.serve().await });
    server
}

async fn dialer() -> Client {
    let client = Client::new(config(), Arc::new(TcpPeerTransport::dial_only("laptop"))).unwrap();
    client.initialize().await.unwrap();
    client
}

#[tokio::test]
async fn test_metrics_count_bytes_both_ways() {
    let server = echo_server().await;
    let client = dialer().await;

    let conn = client.connect(&server.local_peer_id()).await.unwrap();
    assert_eq!(conn.peer_id(), server.local_peer_id());
    assert!(conn.supports_deadlines());

    // "ping\n" is not a handshake, so the server hands it to the generic handler.
    conn.write_all(b"ping\n").await.unwrap();

    let mut greeting = [0u8; 6];
    tokio::time::timeout(WAIT, conn.read_exact(&mut greeting))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&greeting, b"hello\n");

    let mut echoed = [0u8; 5];
    tokio::time::timeout(WAIT, conn.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed, b"ping\n");

    let metrics = conn.metrics().unwrap();
    assert_eq!(metrics.bytes_sent, 5);
    assert_eq!(metrics.bytes_received, 11);
    assert!(metrics.connected);

    conn.close().await.unwrap();
    assert!(conn.metrics().unwrap_err().is_closed());
    assert!(conn.write_all(b"more").await.unwrap_err().is_closed());

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_close_is_idempotent() {
    let server = echo_server().await;
    let client = dialer().await;

    let disconnects = Arc::new(AtomicUsize::new(0));
    let seen = disconnects.clone();
    client.on_disconnect(move |_, err| {
        assert!(err.is_none());
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let conn = Arc::new(client.connect(&server.local_peer_id()).await.unwrap());
    assert_eq!(client.connected_peers(), vec![server.local_peer_id()]);

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.close().await })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap().unwrap();
    }

    assert!(conn.is_closed());
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert!(client.connected_peers().is_empty());

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_read_deadline_expires() {
    let transport = TcpPeerTransport::bind("127.0.0.1:0").await.unwrap();
    let server = Client::new(config(), Arc::new(transport)).unwrap();
    server.initialize().await.unwrap();

    // Hold inbound streams open without ever writing.
    let held = Arc::new(Mutex::new(Vec::new()));
    let keep = held.clone();
    server.on_generic_connection(move |conn| keep.lock().unwrap().push(conn));
    let serving = server.clone();
    tokio::spawn(async move { serving.serve().await });

    let client = dialer().await;
    let conn = client.connect(&server.local_peer_id()).await.unwrap();
    conn.write_all(b"anyone?\n").await.unwrap();

    conn.set_read_deadline(Some(tokio::time::Instant::now() + Duration::from_millis(100)))
        .unwrap();
    let mut buf = [0u8; 8];
    let err = tokio::time::timeout(WAIT, conn.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ClientError::DeadlineExceeded(_)));

    // Clearing the deadline leaves the connection usable.
    conn.set_read_deadline(None).unwrap();
    conn.write_all(b"still open").await.unwrap();

    conn.close().await.unwrap();
    assert!(conn.set_deadline(None).unwrap_err().is_closed());

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_connect_to_unreachable_address_is_remote_error() {
    let client = dialer().await;

    // Bind then drop to find a port nothing listens on.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let err = client
        .connect(&format!("127.0.0.1:{}", port))
        .await
        .unwrap_err();
    assert!(err.is_remote());
    assert!(client.connected_peers().is_empty());
}
