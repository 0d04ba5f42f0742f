//! KV server
//!
//! The server accepts TCP connections and runs one session worker per
//! connection. Each worker applies its session's requests in arrival order
//! against the shared [`KvStore`]; large values move by rendezvous in both
//! directions.

use crate::error::{KvError, Result};
use crate::protocol::{Frame, FrameKind, Payload, TransferMode};
use crate::rendezvous::{self, CompletionSignal, ExposedRegion};
use crate::session::{accept_hello, Endpoint, SessionInfo};
use crate::store::KvStore;
use crate::transport::TransportConfig;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

/// Server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server node ID
    pub node_id: u32,
    /// TCP listen address
    pub listen_addr: String,
    /// Transport configuration
    pub transport: TransportConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            listen_addr: "127.0.0.1:50051".to_string(),
            transport: TransportConfig::default(),
        }
    }
}

/// KV server
pub struct KvServer {
    config: ServerConfig,
    store: Arc<KvStore>,
    next_session: AtomicU64,
}

impl KvServer {
    /// Create a server with a fresh, empty store
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(KvStore::new()))
    }

    pub fn with_store(mut config: ServerConfig, store: Arc<KvStore>) -> Self {
        config.transport.node_id = config.node_id;
        Self {
            config,
            store,
            next_session: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    /// Get the listen address
    pub fn listen_addr(&self) -> &str {
        &self.config.listen_addr
    }

    /// Bind the listen address and serve in the background
    pub async fn spawn(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|source| KvError::Connection {
                addr: self.config.listen_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let store = Arc::clone(&self.store);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!("Starting KV server on {}", local_addr);
        let task = tokio::spawn(async move { self.serve(listener, shutdown_rx).await });

        Ok(ServerHandle {
            local_addr,
            store,
            shutdown: shutdown_tx,
            task,
        })
    }

    /// Accept connections until `shutdown` flips to true
    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let server = Arc::new(self);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&server);
                        sessions.spawn(async move { server.serve_connection(stream, peer).await });
                    }
                    Err(e) => tracing::warn!("Accept failed: {}", e),
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!("Session task panicked: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("Shutting down, dropping {} sessions", sessions.len());
        sessions.shutdown().await;

        let stats = server.store.stats();
        tracing::info!(
            "Store at shutdown: {} entries, {} key bytes, {} value bytes",
            stats.entries,
            stats.key_bytes,
            stats.value_bytes
        );
    }

    async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(self.config.transport.tcp_nodelay) {
            tracing::warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Session {} opened from {}", session_id, peer);

        let (tx, mut rx) = mpsc::channel(self.config.transport.max_pending_requests.max(1));
        let endpoint = Endpoint::start(
            stream,
            self.config.transport.clone(),
            Some(tx),
            format!("session-{session_id}"),
        );
        let mut worker = SessionWorker {
            endpoint,
            store: Arc::clone(&self.store),
            session_id,
            info: None,
        };

        while let Some(frame) = rx.recv().await {
            if let Err(e) = worker.handle(frame).await {
                worker.endpoint.abort(&e);
                break;
            }
        }

        let leftover = worker.endpoint.registry().stats();
        worker.endpoint.close().await;
        tracing::info!(
            "Session {} closed, {} regions ({} bytes) still exposed at close",
            session_id,
            leftover.regions,
            leftover.bytes
        );
    }
}

/// Handle to a server running in the background
pub struct ServerHandle {
    local_addr: SocketAddr,
    store: Arc<KvStore>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    /// Stop accepting, drop all sessions, and wait for the accept loop
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Per-connection request processing
struct SessionWorker {
    endpoint: Endpoint,
    store: Arc<KvStore>,
    session_id: u64,
    info: Option<SessionInfo>,
}

impl SessionWorker {
    /// Apply one request. Errors returned from here are fatal to the session;
    /// request-level failures are answered with an ERROR frame.
    async fn handle(&mut self, frame: Frame) -> Result<()> {
        let request_id = frame.request_id;

        if frame.kind == FrameKind::Hello {
            return self.handle_hello(frame).await;
        }
        let Some(info) = self.info.clone() else {
            return self
                .endpoint
                .send(Frame::error(request_id, "handshake required"))
                .await;
        };

        let kind = frame.kind;
        let result = match kind {
            FrameKind::Set => self.handle_set(frame, &info).await,
            FrameKind::Get => self.handle_get(frame, &info),
            FrameKind::Delete => self.handle_delete(frame),
            other => Err(KvError::violation(format!("unexpected request {other:?}"))),
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(e @ KvError::ProtocolViolation(_)) => return Err(e),
            Err(e) => {
                tracing::warn!(
                    "{:?} failed: session={}, request_id={}, error={}",
                    kind,
                    self.session_id,
                    request_id,
                    e
                );
                Frame::error(request_id, e.remote_message())
            }
        };
        self.endpoint.send(reply).await
    }

    async fn handle_hello(&mut self, frame: Frame) -> Result<()> {
        if self.info.is_some() {
            return self
                .endpoint
                .send(Frame::error(frame.request_id, "duplicate HELLO"))
                .await;
        }

        match accept_hello(&frame, self.endpoint.config(), self.session_id) {
            Ok((info, reply)) => {
                tracing::info!(
                    "Client registration: session={}, node={}, rendezvous={}, client threshold={}",
                    self.session_id,
                    info.peer_node_id,
                    info.rendezvous,
                    info.peer_eager_threshold
                );
                self.info = Some(info);
                self.endpoint.send(reply).await
            }
            Err(e) => {
                tracing::warn!("Rejecting handshake on session {}: {}", self.session_id, e);
                self.endpoint
                    .send(Frame::error(frame.request_id, e.remote_message()))
                    .await
            }
        }
    }

    async fn handle_set(&self, frame: Frame, info: &SessionInfo) -> Result<Frame> {
        if frame.key.is_empty() {
            return Err(KvError::InvalidArgument("empty key".into()));
        }

        let value = match frame.payload {
            Payload::None => Bytes::new(),
            Payload::Inline(value) => value,
            Payload::Rendezvous(desc) => {
                if !info.rendezvous {
                    return Err(KvError::violation(
                        "rendezvous payload on a session without registration",
                    ));
                }
                rendezvous::pull(
                    &self.endpoint,
                    desc,
                    self.endpoint.config().rendezvous_timeout(),
                    CompletionSignal::Reply,
                )
                .await?
            }
        };

        tracing::debug!(
            "SET: key={:?}, length={}, request_id={}",
            frame.key,
            value.len(),
            frame.request_id
        );
        self.store.set(frame.key, value);
        Ok(Frame::control(FrameKind::Ack, frame.request_id, Payload::None))
    }

    fn handle_get(&self, frame: Frame, info: &SessionInfo) -> Result<Frame> {
        let Some(value) = self.store.get(&frame.key) else {
            tracing::debug!("GET miss: key={:?}, request_id={}", frame.key, frame.request_id);
            return Ok(Frame::control(FrameKind::NotFound, frame.request_id, Payload::None));
        };

        tracing::debug!(
            "GET hit: key={:?}, length={}, request_id={}",
            frame.key,
            value.len(),
            frame.request_id
        );

        let config = self.endpoint.config();
        let payload = match config.policy().classify(value.len(), info.rendezvous) {
            TransferMode::Eager => Payload::Inline(value),
            TransferMode::Rendezvous => {
                let region = ExposedRegion::expose(self.endpoint.registry(), value);
                let desc = region.descriptor();
                let timeout = config.rendezvous_timeout();
                let session_id = self.session_id;
                tokio::spawn(async move {
                    if let Err(e) = region.wait_complete(timeout).await {
                        tracing::debug!(
                            "Region {} of session {} not completed: {}",
                            desc.rkey.0,
                            session_id,
                            e
                        );
                    }
                });
                Payload::Rendezvous(desc)
            }
        };

        Ok(Frame::control(FrameKind::Value, frame.request_id, payload))
    }

    fn handle_delete(&self, frame: Frame) -> Result<Frame> {
        if frame.key.is_empty() {
            return Err(KvError::InvalidArgument("empty key".into()));
        }
        let existed = self.store.delete(&frame.key);
        tracing::debug!("DELETE: key={:?}, existed={}", frame.key, existed);

        let kind = if existed {
            FrameKind::Ack
        } else {
            FrameKind::NotFound
        };
        Ok(Frame::control(kind, frame.request_id, Payload::None))
    }
}

/// Run the server until Ctrl-C
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let handle = KvServer::new(config).spawn().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C");

    handle.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::client_handshake;
    use crate::transport::RegionTransport;
    use std::time::Duration;

    fn test_config() -> ServerConfig {
        ServerConfig {
            node_id: 1,
            listen_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_server_creation() {
        let server = KvServer::new(test_config());
        assert!(server.store().is_empty());
        assert_eq!(server.config.transport.node_id, 1);
    }

    #[test]
    fn test_config_from_json() {
        let config: ServerConfig = serde_json::from_str(
            r#"{ "listen_addr": "0.0.0.0:7000", "transport": { "eager_threshold": 8192 } }"#,
        )
        .unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:7000");
        assert_eq!(config.transport.eager_threshold, 8192);
        assert!(config.transport.rendezvous);
    }

    #[tokio::test]
    async fn test_requests_before_handshake_are_refused() {
        let handle = KvServer::new(test_config()).spawn().await.unwrap();
        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let endpoint = Endpoint::start(stream, TransportConfig::default(), None, "raw");

        let reply = endpoint
            .call(
                Frame::new(FrameKind::Get, 1, Bytes::from_static(b"k"), Payload::None),
                Duration::from_secs(5),
                "reply",
            )
            .await
            .unwrap();
        assert_eq!(reply.kind, FrameKind::Error);

        let info = client_handshake(&endpoint).await.unwrap();
        assert!(info.rendezvous);

        endpoint.close().await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unfinished_value_region_is_aborted() {
        let mut config = test_config();
        config.transport.rendezvous_timeout_ms = 100;
        let handle = KvServer::new(config).spawn().await.unwrap();
        handle
            .store()
            .set(Bytes::from_static(b"large_key"), Bytes::from(vec![b'a'; 64000]));

        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let endpoint = Endpoint::start(stream, TransportConfig::default(), None, "raw");
        client_handshake(&endpoint).await.unwrap();

        let get = |id| {
            Frame::new(
                FrameKind::Get,
                id,
                Bytes::from_static(b"large_key"),
                Payload::None,
            )
        };
        let reply = endpoint
            .call(get(endpoint.next_request_id()), Duration::from_secs(5), "value")
            .await
            .unwrap();
        let Payload::Rendezvous(desc) = reply.payload else {
            panic!("expected a region descriptor, got {:?}", reply.payload);
        };

        // Never pull, never send DONE: the watchdog withdraws the region
        tokio::time::sleep(Duration::from_millis(400)).await;
        let err = endpoint.read_remote(desc).await.unwrap_err();
        assert!(matches!(err, KvError::Remote(_)));

        // The session itself survives and a fresh GET completes normally
        let reply = endpoint
            .call(get(endpoint.next_request_id()), Duration::from_secs(5), "value")
            .await
            .unwrap();
        let Payload::Rendezvous(desc) = reply.payload else {
            panic!("expected a region descriptor, got {:?}", reply.payload);
        };
        let value = rendezvous::pull(
            &endpoint,
            desc,
            Duration::from_secs(5),
            CompletionSignal::Done,
        )
        .await
        .unwrap();
        assert_eq!(value.len(), 64000);
        assert!(!endpoint.is_closed());

        endpoint.close().await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_rendezvous_set_leaves_store_unchanged() {
        let handle = KvServer::new(test_config()).spawn().await.unwrap();
        handle
            .store()
            .set(Bytes::from_static(b"large_key"), Bytes::from_static(b"old"));

        let stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        let endpoint = Endpoint::start(stream, TransportConfig::default(), None, "raw");
        client_handshake(&endpoint).await.unwrap();

        // Advertise a region and withdraw it before the server can pull it
        let region = ExposedRegion::expose(endpoint.registry(), Bytes::from(vec![b'a'; 64000]));
        let desc = region.descriptor();
        drop(region);

        let reply = endpoint
            .call(
                Frame::new(
                    FrameKind::Set,
                    endpoint.next_request_id(),
                    Bytes::from_static(b"large_key"),
                    Payload::Rendezvous(desc),
                ),
                Duration::from_secs(5),
                "ack",
            )
            .await
            .unwrap();
        assert_eq!(reply.kind, FrameKind::Error);
        assert_eq!(handle.store().get(b"large_key").unwrap(), "old");

        endpoint.close().await;
        handle.shutdown().await;
    }
}
