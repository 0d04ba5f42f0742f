//! KV client
//!
//! A [`KvClient`] is one open session. Small values travel inline; values at
//! or above the eager threshold are exposed as registered regions that the
//! server pulls (SET), or pulled from regions the server exposes (GET).
//! Values returned by `get` are [`ValueBuffer`]s owned by the caller; they
//! stay valid after the client is closed.

use crate::error::{KvError, Result};
use crate::memory::{BufferLedger, Lease};
use crate::protocol::{Frame, FrameKind, Payload, TransferMode};
use crate::rendezvous::{self, CompletionSignal, ExposedRegion};
use crate::session::{client_handshake, Endpoint, SessionInfo};
use crate::transport::{self, TransportConfig};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client node ID
    pub client_id: u32,
    /// Server address (host:port)
    pub server_addr: String,
    /// Transport configuration
    pub transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: 1,
            server_addr: "127.0.0.1:50051".to_string(),
            transport: TransportConfig::default(),
        }
    }
}

/// A value returned by [`KvClient::get`]
///
/// The buffer is a private copy owned by the caller. Releasing it consumes
/// the buffer, so it cannot be released twice or used afterwards.
pub struct ValueBuffer {
    data: Bytes,
    found: bool,
    _lease: Lease,
}

impl ValueBuffer {
    /// False when the key was absent; the buffer is then empty
    pub fn is_found(&self) -> bool {
        self.found
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Take the bytes out, ending the buffer's tracked lifetime
    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// Give the buffer back
    pub fn release(self) {}
}

impl Deref for ValueBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for ValueBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for ValueBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueBuffer")
            .field("len", &self.data.len())
            .field("found", &self.found)
            .finish()
    }
}

/// An open session to a KV server
pub struct KvClient {
    config: ClientConfig,
    endpoint: Endpoint,
    info: SessionInfo,
    ledger: Arc<BufferLedger>,
}

impl fmt::Debug for KvClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvClient")
            .field("config", &self.config)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl KvClient {
    /// Connect to `server_addr` with default settings
    pub async fn connect(server_addr: impl Into<String>) -> Result<Self> {
        Self::open(ClientConfig {
            server_addr: server_addr.into(),
            ..Default::default()
        })
        .await
    }

    /// Connect and perform the handshake
    pub async fn open(mut config: ClientConfig) -> Result<Self> {
        config.transport.node_id = config.client_id;
        tracing::info!("Connecting to server at {}", config.server_addr);

        let stream = transport::connect(&config.server_addr, &config.transport).await?;
        let endpoint = Endpoint::start(
            stream,
            config.transport.clone(),
            None,
            format!("client-{}", config.client_id),
        );

        let info = match client_handshake(&endpoint).await {
            Ok(info) => info,
            Err(e) => {
                endpoint.close().await;
                return Err(match e {
                    KvError::ProtocolViolation(msg) => KvError::Handshake(msg),
                    KvError::Timeout(what) => KvError::ConnectTimeout(what),
                    other => other,
                });
            }
        };

        tracing::info!(
            "Registered with server {}, session {}, rendezvous={}, server threshold={}",
            info.peer_node_id,
            info.session_id,
            info.rendezvous,
            info.peer_eager_threshold
        );

        Ok(Self {
            config,
            endpoint,
            info,
            ledger: BufferLedger::new(),
        })
    }

    pub fn session_id(&self) -> u64 {
        self.info.session_id
    }

    pub fn session_info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Value buffers handed out and not yet released
    pub fn outstanding_buffers(&self) -> usize {
        self.ledger.outstanding()
    }

    pub fn outstanding_buffer_bytes(&self) -> usize {
        self.ledger.outstanding_bytes()
    }

    /// Store `value` under `key`, waiting for the server's acknowledgement
    pub async fn set(&self, key: impl AsRef<[u8]>, value: impl Into<Bytes>) -> Result<()> {
        let key = checked_key(key.as_ref())?;
        let value: Bytes = value.into();
        let request_id = self.endpoint.next_request_id();
        let transport = &self.config.transport;

        match transport.policy().classify(value.len(), self.info.rendezvous) {
            TransferMode::Eager => {
                let request = Frame::new(FrameKind::Set, request_id, key, Payload::Inline(value));
                let reply = self
                    .endpoint
                    .call(request, transport.request_timeout(), "SET acknowledgement")
                    .await?;
                self.expect_ack(reply)
            }
            TransferMode::Rendezvous => {
                let region = ExposedRegion::expose(self.endpoint.registry(), value);
                let request = Frame::new(
                    FrameKind::Set,
                    request_id,
                    key,
                    Payload::Rendezvous(region.descriptor()),
                );
                // Region stays exposed until the ACK; on any failure the
                // guard drops and deregisters it.
                let reply = self
                    .endpoint
                    .call(request, transport.rendezvous_timeout(), "SET acknowledgement")
                    .await?;
                self.expect_ack(reply)?;
                region.complete()
            }
        }
    }

    /// Fetch the value stored under `key`. A missing key is not an error:
    /// the returned buffer is empty and `is_found()` is false.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<ValueBuffer> {
        let key = checked_key(key.as_ref())?;
        let request = Frame::new(
            FrameKind::Get,
            self.endpoint.next_request_id(),
            key,
            Payload::None,
        );
        let transport = &self.config.transport;
        let reply = self
            .endpoint
            .call(request, transport.request_timeout(), "GET reply")
            .await?;

        if reply.kind == FrameKind::Error {
            return Err(KvError::Remote(reply.error_message()));
        }
        let (data, found) = match (reply.kind, reply.payload) {
            (FrameKind::NotFound, _) => (Bytes::new(), false),
            (FrameKind::Value, Payload::None) => (Bytes::new(), true),
            (FrameKind::Value, Payload::Inline(data)) => (data, true),
            (FrameKind::Value, Payload::Rendezvous(desc)) => {
                if !self.info.rendezvous {
                    return Err(self.fatal(KvError::violation(
                        "server exposed a region on a session without registration",
                    )));
                }
                let data = rendezvous::pull(
                    &self.endpoint,
                    desc,
                    transport.rendezvous_timeout(),
                    CompletionSignal::Done,
                )
                .await?;
                (data, true)
            }
            (kind, _) => {
                return Err(self.fatal(KvError::violation(format!("{kind:?} in reply to GET"))))
            }
        };

        Ok(ValueBuffer {
            _lease: self.ledger.lease(data.len()),
            data,
            found,
        })
    }

    /// Remove `key`, returning whether it existed
    pub async fn delete(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        let key = checked_key(key.as_ref())?;
        let request = Frame::new(
            FrameKind::Delete,
            self.endpoint.next_request_id(),
            key,
            Payload::None,
        );
        let reply = self
            .endpoint
            .call(request, self.config.transport.request_timeout(), "DELETE reply")
            .await?;
        match reply.kind {
            FrameKind::Ack => Ok(true),
            FrameKind::NotFound => Ok(false),
            FrameKind::Error => Err(KvError::Remote(reply.error_message())),
            kind => Err(self.fatal(KvError::violation(format!("{kind:?} in reply to DELETE")))),
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.endpoint.is_closed()
    }

    /// Close the session. Outstanding value buffers remain valid.
    pub async fn close(self) -> Result<()> {
        let registry = self.endpoint.registry();
        if !registry
            .wait_drained(self.config.transport.rendezvous_timeout())
            .await
        {
            let stats = registry.stats();
            tracing::warn!(
                "Closing with {} unfinished rendezvous transfers ({} bytes exposed)",
                stats.regions,
                stats.bytes
            );
            registry.abort_all();
        }

        let bye = Frame::control(FrameKind::Bye, 0, Payload::None);
        if let Err(e) = self.endpoint.send(bye).await {
            tracing::debug!("Session already gone at close: {}", e);
        }
        self.endpoint.close().await;
        tracing::info!(
            "Closed session {}: {} buffers released, {} outstanding ({} bytes)",
            self.info.session_id,
            self.ledger.released(),
            self.ledger.outstanding(),
            self.ledger.outstanding_bytes()
        );
        Ok(())
    }

    fn expect_ack(&self, reply: Frame) -> Result<()> {
        match reply.kind {
            FrameKind::Ack => Ok(()),
            FrameKind::Error => Err(KvError::Remote(reply.error_message())),
            kind => Err(self.fatal(KvError::violation(format!("{kind:?} in reply to SET")))),
        }
    }

    /// Tear the session down and hand the error back
    fn fatal(&self, err: KvError) -> KvError {
        self.endpoint.abort(&err);
        err
    }
}

fn checked_key(key: &[u8]) -> Result<Bytes> {
    if key.is_empty() {
        return Err(KvError::InvalidArgument("empty key".into()));
    }
    Ok(Bytes::copy_from_slice(key))
}
