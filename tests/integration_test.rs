//! Integration tests for the KV store over the eager/rendezvous transport

use bytes::Bytes;
use kv_rendezvous::client::{ClientConfig, KvClient};
use kv_rendezvous::server::{KvServer, ServerConfig, ServerHandle};
use kv_rendezvous::transport::TransportConfig;
use kv_rendezvous::{KvError, Status};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("kv_rendezvous=debug")
        .with_test_writer()
        .try_init();
}

async fn start_server(transport: TransportConfig) -> ServerHandle {
    let config = ServerConfig {
        node_id: 0,
        listen_addr: "127.0.0.1:0".to_string(),
        transport,
    };
    KvServer::new(config).spawn().await.unwrap()
}

async fn open_client(handle: &ServerHandle, client_id: u32, transport: TransportConfig) -> KvClient {
    KvClient::open(ClientConfig {
        client_id,
        server_addr: handle.local_addr().to_string(),
        transport,
    })
    .await
    .unwrap()
}

fn pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_server_client_integration() {
    init_tracing();
    let server = start_server(TransportConfig::default()).await;
    let client = open_client(&server, 1, TransportConfig::default()).await;
    assert!(client.is_connected());

    client.set("key1", "value1").await.unwrap();
    let value1 = client.get("key1").await.unwrap();
    assert!(value1.is_found());
    assert_eq!(&*value1, b"value1");
    value1.release();

    client.set("key2", "value2").await.unwrap();
    assert_eq!(&*client.get("key1").await.unwrap(), b"value1");
    assert_eq!(&*client.get("key2").await.unwrap(), b"value2");

    // A missing key is a successful, empty result
    let missing = client.get("nonexistent_key").await.unwrap();
    assert!(!missing.is_found());
    assert!(missing.is_empty());

    assert!(client.delete("key1").await.unwrap());
    assert!(!client.delete("key1").await.unwrap());
    assert!(!client.get("key1").await.unwrap().is_found());

    let closed = client.close().await;
    assert_eq!(Status::from(&closed), Status::Ok);
    server.shutdown().await;
}

#[tokio::test]
async fn test_large_values() {
    init_tracing();
    let server = start_server(TransportConfig::default()).await;
    let client = open_client(&server, 1, TransportConfig::default()).await;

    // Cross the eager/rendezvous boundary on both sides
    for size in [0, 1, 1024, 4095, 4096, 4097, 16384, 64000, 4 * 1024 * 1024] {
        let key = format!("key_size_{}", size);
        let value = pattern(size);

        client.set(&key, value.clone()).await.unwrap();
        let retrieved = client.get(&key).await.unwrap();
        assert!(retrieved.is_found());
        assert_eq!(retrieved.len(), size);
        assert_eq!(&*retrieved, &value[..]);
    }

    assert_eq!(server.store().len(), 9);
    client.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_repeated_large_set_of_a_bytes() {
    init_tracing();
    let server = start_server(TransportConfig::default()).await;
    let client = open_client(&server, 1, TransportConfig::default()).await;

    let large = Bytes::from(vec![b'a'; 64000]);
    for _ in 0..3 {
        client.set("large_key", large.clone()).await.unwrap();
        let retrieved = client.get("large_key").await.unwrap();
        assert_eq!(retrieved.as_bytes(), &large[..]);
    }
    assert_eq!(server.store().get(b"large_key").unwrap(), large);

    client.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_eager_only_sessions() {
    init_tracing();
    let server = start_server(TransportConfig::default()).await;
    let eager_only = TransportConfig {
        rendezvous: false,
        ..Default::default()
    };
    let client = open_client(&server, 1, eager_only).await;
    assert!(!client.session_info().rendezvous);

    let value = pattern(100_000);
    client.set("big", value.clone()).await.unwrap();
    assert_eq!(&*client.get("big").await.unwrap(), &value[..]);

    client.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_custom_threshold() {
    init_tracing();
    let transport = TransportConfig {
        eager_threshold: 16,
        ..Default::default()
    };
    let server = start_server(transport.clone()).await;
    let client = open_client(&server, 1, transport).await;

    for size in [15, 16, 17] {
        let key = format!("k{}", size);
        client.set(&key, vec![b'z'; size]).await.unwrap();
        assert_eq!(client.get(&key).await.unwrap().len(), size);
    }

    client.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_multiple_clients() {
    init_tracing();
    let server = start_server(TransportConfig::default()).await;

    let mut clients = Vec::new();
    for i in 1..=3 {
        clients.push(open_client(&server, i, TransportConfig::default()).await);
    }
    let ids: std::collections::HashSet<u64> = clients.iter().map(|c| c.session_id()).collect();
    assert_eq!(ids.len(), 3);

    // Client 1 writes, all clients read
    clients[0].set("shared_key", "shared_value").await.unwrap();
    for client in &clients {
        assert_eq!(&*client.get("shared_key").await.unwrap(), b"shared_value");
    }

    // Each client writes its own keys concurrently
    let clients: Vec<Arc<KvClient>> = clients.into_iter().map(Arc::new).collect();
    let mut tasks = Vec::new();
    for (i, client) in clients.iter().enumerate() {
        let client = Arc::clone(client);
        tasks.push(tokio::spawn(async move {
            client
                .set(format!("client_{}_key", i), format!("client_{}_value", i))
                .await
                .unwrap();
            client
                .set(format!("client_{}_large", i), vec![i as u8; 50_000])
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // All clients can read all keys
    for i in 0..clients.len() {
        for client in &clients {
            let value = client.get(format!("client_{}_key", i)).await.unwrap();
            assert_eq!(&*value, format!("client_{}_value", i).as_bytes());
            let large = client.get(format!("client_{}_large", i)).await.unwrap();
            assert!(large.iter().all(|&b| b == i as u8));
            assert_eq!(large.len(), 50_000);
        }
    }

    for client in clients {
        let client = Arc::try_unwrap(client).ok().unwrap();
        client.close().await.unwrap();
    }
    server.shutdown().await;
}

#[tokio::test]
async fn test_racing_writers_leave_one_full_value() {
    init_tracing();
    let server = start_server(TransportConfig::default()).await;
    let a = open_client(&server, 1, TransportConfig::default()).await;
    let b = open_client(&server, 2, TransportConfig::default()).await;

    let value_a = Bytes::from(vec![b'a'; 64000]);
    let value_b = Bytes::from(vec![b'b'; 64000]);

    for _ in 0..10 {
        let (ra, rb) = tokio::join!(
            a.set("contended", value_a.clone()),
            b.set("contended", value_b.clone())
        );
        ra.unwrap();
        rb.unwrap();

        let seen = a.get("contended").await.unwrap().into_bytes();
        assert!(seen == value_a || seen == value_b);
    }

    a.close().await.unwrap();
    b.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_buffers_outlive_close() {
    init_tracing();
    let server = start_server(TransportConfig::default()).await;
    let client = open_client(&server, 1, TransportConfig::default()).await;

    client.set("small", "value1").await.unwrap();
    client.set("large", vec![b'a'; 64000]).await.unwrap();

    let small = client.get("small").await.unwrap();
    let large = client.get("large").await.unwrap();
    assert_eq!(client.outstanding_buffers(), 2);

    client.close().await.unwrap();

    assert_eq!(&*small, b"value1");
    assert_eq!(large.len(), 64000);
    small.release();
    large.release();
    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_arguments() {
    init_tracing();
    let server = start_server(TransportConfig::default()).await;
    let client = open_client(&server, 1, TransportConfig::default()).await;

    let err = client.set("", "value").await.unwrap_err();
    assert_eq!(Status::from(&err), Status::InvalidArgument);
    let err = client.get("").await.unwrap_err();
    assert!(err.is_request_error());

    // The session survives a rejected request
    client.set("key", "value").await.unwrap();

    client.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_open_times_out_without_handshake() {
    init_tracing();
    // Accepts TCP connections through the backlog but never speaks
    let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let config = ClientConfig {
        server_addr: silent.local_addr().unwrap().to_string(),
        transport: TransportConfig {
            handshake_timeout_ms: 200,
            ..Default::default()
        },
        ..Default::default()
    };

    let err = KvClient::open(config).await.unwrap_err();
    assert!(matches!(err, KvError::ConnectTimeout("handshake")));
    assert!(err.is_connection_error());
    assert_eq!(Status::from(&err), Status::Timeout);
}

#[tokio::test]
async fn test_server_shutdown_fails_requests() {
    init_tracing();
    let server = start_server(TransportConfig::default()).await;
    let client = open_client(&server, 1, TransportConfig::default()).await;
    client.set("key1", "value1").await.unwrap();

    server.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!client.is_connected());
    let err = client.get("key1").await.unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(Status::from(&err), Status::ConnectionFailed);
}

#[test]
fn test_blocking_client() {
    init_tracing();
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let server = runtime.block_on(start_server(TransportConfig::default()));

    let client = kv_rendezvous::blocking::KvClient::connect(server.local_addr().to_string()).unwrap();
    client.set("key1", "value1").unwrap();
    let value = client.get("key1").unwrap();
    assert_eq!(&*value, b"value1");
    client.release(value);

    client.set("large_key", vec![b'a'; 64000]).unwrap();
    let large = client.get("large_key").unwrap();
    assert_eq!(large.len(), 64000);
    client.release(large);
    assert_eq!(client.outstanding_buffers(), 0);

    client.close().unwrap();
    runtime.block_on(server.shutdown());
}
