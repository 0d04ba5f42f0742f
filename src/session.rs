//! Transport session
//!
//! An [`Endpoint`] owns one side of a connection. A writer task drains a
//! queue of encoded frames onto the channel; a reader task dispatches every
//! incoming frame:
//!
//! - responses complete the pending request with the same id,
//! - `READ` is served from the local [`RegionRegistry`],
//! - `DONE` completes a local region,
//! - application requests go to the request sink (server side only).
//!
//! Both sides issue requests: the client sends SET/GET, the server sends
//! READ while pulling a value the client exposed.

use crate::error::{KvError, Result};
use crate::memory::RegionRegistry;
use crate::protocol::{
    EncodedFrame, Frame, FrameKind, HelloBody, Payload, RegionDescriptor, PROTOCOL_VERSION,
};
use crate::transport::{read_frame, write_frame, RegionTransport, TransportConfig};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const OUTGOING_QUEUE_DEPTH: usize = 256;

/// Negotiated facts about the peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: u64,
    pub peer_node_id: u32,
    /// Both sides can register regions, so large payloads may use rendezvous
    pub rendezvous: bool,
    pub peer_eager_threshold: u64,
}

type PendingTx = oneshot::Sender<Result<Frame>>;

struct Shared {
    label: String,
    outgoing: Mutex<Option<mpsc::Sender<EncodedFrame>>>,
    pending: Mutex<HashMap<u64, PendingTx>>,
    closed: AtomicBool,
    next_id: AtomicU64,
    registry: Arc<RegionRegistry>,
}

impl Shared {
    async fn send(&self, frame: Frame) -> Result<()> {
        let encoded = frame.encode()?;
        tracing::trace!(
            "[{}] -> {:?} id={} bytes={}",
            self.label,
            frame.kind,
            frame.request_id,
            encoded.wire_len()
        );
        let tx = self
            .outgoing
            .lock()
            .clone()
            .ok_or(KvError::SessionClosed)?;
        tx.send(encoded).await.map_err(|_| KvError::SessionClosed)
    }

    /// Fail all pending requests and drop every exposed region
    fn teardown(&self) {
        let pending: Vec<PendingTx> = {
            let mut pending = self.pending.lock();
            self.closed.store(true, Ordering::Release);
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in pending {
            let _ = tx.send(Err(KvError::SessionClosed));
        }
        self.registry.abort_all();
    }

    async fn dispatch(
        &self,
        frame: Frame,
        requests: Option<&mpsc::Sender<Frame>>,
    ) -> Result<bool> {
        tracing::trace!(
            "[{}] <- {:?} id={}",
            self.label,
            frame.kind,
            frame.request_id
        );

        if frame.kind.is_response() {
            let waiter = self.pending.lock().remove(&frame.request_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(Ok(frame));
                }
                None => tracing::debug!(
                    "[{}] Dropping late {:?} for request {}",
                    self.label,
                    frame.kind,
                    frame.request_id
                ),
            }
            return Ok(true);
        }

        match frame.kind {
            FrameKind::Read => {
                let Payload::Rendezvous(desc) = frame.payload else {
                    return Err(KvError::violation("READ without region descriptor"));
                };
                let reply = match self.registry.read(&desc) {
                    Ok(data) => {
                        Frame::control(FrameKind::ReadData, frame.request_id, Payload::Inline(data))
                    }
                    Err(e) => {
                        tracing::debug!(
                            "[{}] Refusing read of region {}: {}",
                            self.label,
                            desc.rkey.0,
                            e
                        );
                        Frame::error(frame.request_id, e.remote_message())
                    }
                };
                self.send(reply).await?;
                Ok(true)
            }
            FrameKind::Done => {
                let Payload::Rendezvous(desc) = frame.payload else {
                    return Err(KvError::violation("DONE without region descriptor"));
                };
                if !self.registry.complete(desc.rkey)? {
                    tracing::debug!("[{}] DONE for unknown region {}", self.label, desc.rkey.0);
                }
                Ok(true)
            }
            FrameKind::Bye => Ok(false),
            FrameKind::Hello | FrameKind::Set | FrameKind::Get | FrameKind::Delete => {
                let Some(requests) = requests else {
                    return Err(KvError::violation(format!(
                        "unexpected {:?} request from server",
                        frame.kind
                    )));
                };
                // Never wait on the worker here: it may itself be waiting for
                // a READ_DATA this task has yet to dispatch.
                match requests.try_send(frame) {
                    Ok(()) => Ok(true),
                    Err(TrySendError::Full(frame)) => {
                        tracing::warn!(
                            "[{}] Request queue full, refusing {:?} id={}",
                            self.label,
                            frame.kind,
                            frame.request_id
                        );
                        self.send(Frame::error(frame.request_id, "server busy"))
                            .await?;
                        Ok(true)
                    }
                    // Worker gone: nothing left to serve
                    Err(TrySendError::Closed(_)) => Ok(false),
                }
            }
            other => Err(KvError::violation(format!("unexpected frame {other:?}"))),
        }
    }
}

/// One side of a session
pub struct Endpoint {
    shared: Arc<Shared>,
    config: TransportConfig,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    /// Start the reader and writer tasks over `stream`.
    ///
    /// With `requests` set, incoming application requests are forwarded to
    /// it; without, they are protocol violations.
    pub fn start<S>(
        stream: S,
        config: TransportConfig,
        requests: Option<mpsc::Sender<Frame>>,
        label: impl Into<String>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(OUTGOING_QUEUE_DEPTH);

        let shared = Arc::new(Shared {
            label: label.into(),
            outgoing: Mutex::new(Some(tx)),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            registry: Arc::new(RegionRegistry::new()),
        });

        let writer = tokio::spawn(writer_loop(write_half, rx, Arc::clone(&shared)));
        let reader = tokio::spawn(reader_loop(
            read_half,
            Arc::clone(&shared),
            requests,
            config.max_frame_size,
        ));

        Self {
            shared,
            config,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RegionRegistry> {
        &self.shared.registry
    }

    pub fn next_request_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Send a frame that expects no reply
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.shared.send(frame).await
    }

    /// Send a request and wait for the response carrying its id
    pub async fn call(&self, frame: Frame, timeout: Duration, what: &'static str) -> Result<Frame> {
        let id = frame.request_id;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if self.is_closed() {
                return Err(KvError::SessionClosed);
            }
            pending.insert(id, tx);
        }

        if let Err(e) = self.shared.send(frame).await {
            self.shared.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(KvError::SessionClosed),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                tracing::warn!("[{}] Request {} timed out waiting for {}", self.label(), id, what);
                Err(KvError::Timeout(what))
            }
        }
    }

    /// Tear the session down after a fatal error
    pub fn abort(&self, reason: &KvError) {
        tracing::warn!("[{}] Aborting session: {}", self.label(), reason);
        self.shared.outgoing.lock().take();
        self.shared.teardown();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    /// Flush queued frames, stop both tasks, and drop exposed regions
    pub async fn close(&self) {
        self.shared.outgoing.lock().take();

        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            let _ = tokio::time::timeout(self.config.request_timeout(), writer).await;
        }
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
            let _ = reader.await;
        }
        self.shared.teardown();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.get_mut().take() {
            writer.abort();
        }
        self.shared.teardown();
    }
}

impl RegionTransport for Endpoint {
    fn read_remote(
        &self,
        desc: RegionDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>> {
        Box::pin(async move {
            let request = Frame::control(
                FrameKind::Read,
                self.next_request_id(),
                Payload::Rendezvous(desc),
            );
            let reply = self
                .call(request, self.config.rendezvous_timeout(), "region read")
                .await?;
            match reply.kind {
                FrameKind::ReadData => match reply.payload {
                    Payload::Inline(data) => Ok(data),
                    Payload::None => Ok(Bytes::new()),
                    Payload::Rendezvous(_) => {
                        Err(KvError::violation("READ_DATA carrying a region descriptor"))
                    }
                },
                FrameKind::Error => Err(KvError::Remote(reply.error_message())),
                kind => Err(KvError::violation(format!("{kind:?} in reply to READ"))),
            }
        })
    }

    fn signal_done(
        &self,
        desc: RegionDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.send(Frame::control(FrameKind::Done, 0, Payload::Rendezvous(desc)))
                .await
        })
    }
}

async fn writer_loop<W>(writer: W, mut rx: mpsc::Receiver<EncodedFrame>, shared: Arc<Shared>)
where
    W: AsyncWrite + Send + Unpin,
{
    let mut writer = BufWriter::new(writer);
    let result: Result<()> = async {
        while let Some(frame) = rx.recv().await {
            write_frame(&mut writer, &frame).await?;
            // Batch whatever is already queued behind this frame
            while let Ok(next) = rx.try_recv() {
                write_frame(&mut writer, &next).await?;
            }
            writer.flush().await?;
        }
        writer.shutdown().await?;
        Ok(())
    }
    .await;

    if let Err(e) = result {
        tracing::debug!("[{}] Writer stopped: {}", shared.label, e);
        shared.teardown();
    }
}

async fn reader_loop<R>(
    mut reader: R,
    shared: Arc<Shared>,
    requests: Option<mpsc::Sender<Frame>>,
    max_frame_size: usize,
) where
    R: AsyncRead + Send + Unpin,
{
    let result: Result<()> = async {
        while let Some(frame) = read_frame(&mut reader, max_frame_size).await? {
            if !shared.dispatch(frame, requests.as_ref()).await? {
                break;
            }
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => tracing::debug!("[{}] Peer closed the session", shared.label),
        Err(KvError::ProtocolViolation(msg)) => {
            tracing::warn!("[{}] Protocol violation, tearing down: {}", shared.label, msg)
        }
        Err(e) => tracing::debug!("[{}] Reader stopped: {}", shared.label, e),
    }
    shared.outgoing.lock().take();
    shared.teardown();
}

/// Client half of the handshake
pub async fn client_handshake(endpoint: &Endpoint) -> Result<SessionInfo> {
    let config = endpoint.config();
    let hello = HelloBody {
        protocol_version: PROTOCOL_VERSION,
        node_id: config.node_id,
        session_id: 0,
        rendezvous: config.rendezvous,
        eager_threshold: config.eager_threshold as u64,
    };
    let request = Frame::control(
        FrameKind::Hello,
        endpoint.next_request_id(),
        Payload::Inline(hello.encode()?),
    );

    let reply = endpoint
        .call(request, config.handshake_timeout(), "handshake")
        .await?;
    let body = match (&reply.kind, &reply.payload) {
        (FrameKind::HelloAck, Payload::Inline(body)) => HelloBody::decode(body)
            .map_err(|e| KvError::Handshake(format!("undecodable HELLO_ACK: {e}")))?,
        (FrameKind::Error, _) => return Err(KvError::Handshake(reply.error_message())),
        (kind, _) => return Err(KvError::Handshake(format!("{kind:?} in reply to HELLO"))),
    };
    if body.protocol_version != PROTOCOL_VERSION {
        return Err(KvError::Handshake(format!(
            "server speaks protocol {}, expected {}",
            body.protocol_version, PROTOCOL_VERSION
        )));
    }

    Ok(SessionInfo {
        session_id: body.session_id,
        peer_node_id: body.node_id,
        rendezvous: body.rendezvous && config.rendezvous,
        peer_eager_threshold: body.eager_threshold,
    })
}

/// Server half of the handshake: validate the client's HELLO and build the
/// HELLO_ACK reply
pub fn accept_hello(
    frame: &Frame,
    config: &TransportConfig,
    session_id: u64,
) -> Result<(SessionInfo, Frame)> {
    let Payload::Inline(body) = &frame.payload else {
        return Err(KvError::Handshake("HELLO without body".into()));
    };
    let hello = HelloBody::decode(body)
        .map_err(|e| KvError::Handshake(format!("undecodable HELLO: {e}")))?;
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(KvError::Handshake(format!(
            "client speaks protocol {}, expected {}",
            hello.protocol_version, PROTOCOL_VERSION
        )));
    }

    let ack = HelloBody {
        protocol_version: PROTOCOL_VERSION,
        node_id: config.node_id,
        session_id,
        rendezvous: config.rendezvous,
        eager_threshold: config.eager_threshold as u64,
    };
    let reply = Frame::control(
        FrameKind::HelloAck,
        frame.request_id,
        Payload::Inline(ack.encode()?),
    );
    let info = SessionInfo {
        session_id,
        peer_node_id: hello.node_id,
        rendezvous: hello.rendezvous && config.rendezvous,
        peer_eager_threshold: hello.eager_threshold,
    };
    Ok((info, reply))
}
