/// Mesh messaging between several clients on one in-memory network
use cloudbridge_client::{Client, ClientError, Config, ErrorKind, Mesh};
use cloudbridge_transport::MemoryNetwork;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

async fn start_client(network: &MemoryNetwork, id: &str) -> Client {
    let config = Config::builder()
        .token("test-token")
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let client = Client::new(config, Arc::new(network.endpoint(id))).unwrap();
    client.initialize().await.unwrap();

    let server = client.clone();
    tokio::spawn(async move { server.serve().await });
    client
}

/// Join `names` to "lan" in order; each later member announces to the earlier ones
async fn mesh_of(network: &MemoryNetwork, names: &[&str]) -> Vec<(Client, Mesh)> {
    let mut members = Vec::new();
    for name in names {
        let client = start_client(network, name).await;
        let mesh = client.join_mesh("lan").await.unwrap();
        members.push((client, mesh));
    }

    // Wait until every announcement has been processed.
    let expected = names.len() - 1;
    tokio::time::timeout(WAIT, async {
        while members.iter().any(|(_, m)| m.peers().len() < expected) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("mesh membership did not converge");

    members
}

async fn recv(mesh: &Mesh) -> cloudbridge_client::Message {
    tokio::time::timeout(WAIT, mesh.recv())
        .await
        .expect("no message within timeout")
        .expect("queue closed")
}

#[tokio::test]
async fn test_broadcast_reaches_every_member() {
    let network = MemoryNetwork::new();
    let members = mesh_of(&network, &["a", "b", "c"]).await;
    let (_, a) = &members[0];
    let (_, b) = &members[1];
    let (_, c) = &members[2];

    a.broadcast(b"hello all").await.unwrap();

    for mesh in [b, c] {
        let message = recv(mesh).await;
        assert_eq!(message.from, "a");
        assert_eq!(&message.payload[..], b"hello all");
    }
    assert!(a.try_recv().is_none());
}

#[tokio::test]
async fn test_messages_from_one_peer_keep_their_order() {
    let network = MemoryNetwork::new();
    let members = mesh_of(&network, &["a", "b"]).await;
    let (_, a) = &members[0];
    let (_, b) = &members[1];

    for i in 0..50u32 {
        a.send("b", &i.to_be_bytes()).await.unwrap();
    }

    let received: Vec<u32> = b
        .messages()
        .take(50)
        .map(|m| u32::from_be_bytes([m.payload[0], m.payload[1], m.payload[2], m.payload[3]]))
        .collect()
        .await;
    assert_eq!(received, (0..50).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_concurrent_broadcast_send_and_peers_complete() {
    let network = MemoryNetwork::new();
    let members = mesh_of(&network, &["a", "b", "c"]).await;
    let a = members[0].1.clone();

    let broadcaster = {
        let mesh = a.clone();
        tokio::spawn(async move {
            for i in 0..20u8 {
                mesh.broadcast(&[i]).await.unwrap();
            }
        })
    };
    let sender = {
        let mesh = a.clone();
        tokio::spawn(async move {
            for i in 0..20u8 {
                mesh.send("b", &[100 + i]).await.unwrap();
            }
        })
    };
    let reader = {
        let mesh = a.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                assert_eq!(mesh.peers(), vec!["b".to_string(), "c".to_string()]);
                tokio::task::yield_now().await;
            }
        })
    };

    tokio::time::timeout(WAIT, async {
        broadcaster.await.unwrap();
        sender.await.unwrap();
        reader.await.unwrap();
    })
    .await
    .expect("concurrent mesh operations deadlocked");

    // b got 20 broadcasts and 20 unicasts, c only the broadcasts.
    let (_, b) = &members[1];
    let (_, c) = &members[2];
    for _ in 0..40 {
        recv(b).await;
    }
    for _ in 0..20 {
        recv(c).await;
    }
    assert_eq!(a.peers().len(), 2);
}

#[tokio::test]
async fn test_broadcast_continues_past_unreachable_peer() {
    let network = MemoryNetwork::new();
    let members = mesh_of(&network, &["a", "b"]).await;
    let (_, a) = &members[0];
    let (_, b) = &members[1];

    // c joins and announces itself but never serves, so links to it are never accepted.
    let config = Config::builder()
        .token("test-token")
        .timeout(Duration::from_secs(1))
        .build()
        .unwrap();
    let c_client = Client::new(config, Arc::new(network.endpoint("c"))).unwrap();
    c_client.initialize().await.unwrap();
    let _c = c_client.join_mesh("lan").await.unwrap();
    tokio::time::timeout(WAIT, async {
        while a.peers().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("a never learned about c");

    let err = tokio::time::timeout(WAIT, a.broadcast(b"still here"))
        .await
        .expect("broadcast hung on the unreachable peer")
        .unwrap_err();
    match err {
        ClientError::PartialBroadcast { failed, total } => {
            assert_eq!(total, 2);
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].0, "c");
        }
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(&recv(b).await.payload[..], b"still here");
}

#[tokio::test]
async fn test_member_that_left_is_forgotten() {
    let network = MemoryNetwork::new();
    let members = mesh_of(&network, &["a", "b"]).await;
    let (_, a) = &members[0];
    let (b_client, b) = &members[1];

    a.broadcast(b"before").await.unwrap();
    assert_eq!(&recv(b).await.payload[..], b"before");

    b.leave().await.unwrap();
    tokio::time::timeout(WAIT, async {
        while !a.peers().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("a still lists b after it left");

    // Nobody is left, so broadcasting reaches everyone there is.
    for _ in 0..10 {
        a.broadcast(b"anyone?").await.unwrap();
    }

    let b_again = b_client.join_mesh("lan").await.unwrap();
    tokio::time::timeout(WAIT, async {
        while a.peers() != vec!["b".to_string()] {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("a never saw b rejoin");

    a.broadcast(b"welcome back").await.unwrap();
    assert_eq!(&recv(&b_again).await.payload[..], b"welcome back");
}

#[tokio::test]
async fn test_send_to_non_member_is_rejected() {
    let network = MemoryNetwork::new();
    let members = mesh_of(&network, &["a"]).await;
    let (_, a) = &members[0];
    let _outsider = start_client(&network, "x").await;

    let err = tokio::time::timeout(WAIT, a.send("x", b"hello?"))
        .await
        .expect("send to a non-member hung")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(a.peers().is_empty());
}

#[tokio::test]
async fn test_leave_ends_message_stream() {
    let network = MemoryNetwork::new();
    let members = mesh_of(&network, &["a", "b"]).await;
    let (_, a) = &members[0];
    let (_, b) = &members[1];

    a.send("b", b"last words").await.unwrap();
    let mut stream = Box::pin(b.messages());
    assert_eq!(&stream.next().await.unwrap().payload[..], b"last words");

    b.leave().await.unwrap();

    let rest: Vec<_> = tokio::time::timeout(WAIT, stream.collect::<Vec<_>>())
        .await
        .expect("message stream did not end after leave");
    assert!(rest.is_empty());

    // Leaving twice, or from another clone, is fine.
    b.clone().leave().await.unwrap();
}

#[tokio::test]
async fn test_closing_client_leaves_its_meshes() {
    let network = MemoryNetwork::new();
    let members = mesh_of(&network, &["a", "b"]).await;
    let (a_client, a) = &members[0];

    a_client.close().await.unwrap();
    assert!(a.is_closed());
    assert!(a.broadcast(b"x").await.unwrap_err().is_closed());
    assert!(tokio::time::timeout(WAIT, a.recv()).await.unwrap().is_none());
}
