//! Transport abstraction
//!
//! The substrate is any reliable byte channel (`AsyncRead + AsyncWrite`),
//! TCP in production and in-memory pipes in tests. On top of it this module
//! provides framed reads and writes, connection setup with a timeout, and
//! the [`RegionTransport`] trait through which rendezvous pulls registered
//! memory from the peer.

use crate::error::{KvError, Result};
use crate::protocol::{
    EncodedFrame, Frame, FrameHeader, Payload, PayloadHeader, PayloadPolicy, RegionDescriptor,
    DEFAULT_EAGER_THRESHOLD, FIXED_HEADER_LEN,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const UPFRONT_ALLOCATION_LIMIT: usize = 16 * 1024 * 1024;

/// Configuration for the transport
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Node ID for this transport instance
    pub node_id: u32,
    /// Payloads at or above this size use rendezvous
    pub eager_threshold: usize,
    /// Whether this side registers memory and serves remote reads
    pub rendezvous: bool,
    pub handshake_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Bound on a whole rendezvous transfer, pull and completion included
    pub rendezvous_timeout_ms: u64,
    /// Largest inline payload accepted from the peer
    pub max_frame_size: usize,
    /// Requests a session may queue ahead of its worker; overflow is refused
    pub max_pending_requests: usize,
    pub tcp_nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            eager_threshold: DEFAULT_EAGER_THRESHOLD,
            rendezvous: true,
            handshake_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            rendezvous_timeout_ms: 30_000,
            max_frame_size: 1024 * 1024 * 1024, // 1GB
            max_pending_requests: 1024,
            tcp_nodelay: true,
        }
    }
}

impl TransportConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous_timeout_ms)
    }

    pub fn policy(&self) -> PayloadPolicy {
        PayloadPolicy::new(self.eager_threshold)
    }
}

/// One-sided access to memory the peer has registered
pub trait RegionTransport: Send + Sync {
    /// Read the whole region described by `desc`
    fn read_remote(
        &self,
        desc: RegionDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>>;

    /// Tell the owner the region is no longer needed
    fn signal_done(
        &self,
        desc: RegionDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Open a TCP connection, bounded by the handshake timeout
pub async fn connect(addr: &str, config: &TransportConfig) -> Result<TcpStream> {
    let stream = match tokio::time::timeout(config.handshake_timeout(), TcpStream::connect(addr)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(KvError::Connection {
                addr: addr.to_string(),
                source,
            })
        }
        Err(_) => return Err(KvError::ConnectTimeout("connect")),
    };
    stream.set_nodelay(config.tcp_nodelay)?;
    Ok(stream)
}

/// Read one frame. Returns `None` when the peer closed the channel cleanly
/// between frames.
///
/// Inline payload bytes are read straight into their final allocation.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut fixed = [0u8; FIXED_HEADER_LEN];
    let n = reader.read(&mut fixed).await?;
    if n == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut fixed[n..]).await?;
    let header = FrameHeader::parse(&fixed)?;

    let mut descriptor = [0u8; 32];
    let descriptor = &mut descriptor[..header.descriptor_len()];
    reader.read_exact(descriptor).await?;
    let payload_header = PayloadHeader::parse(header.tag, descriptor)?;

    let key = read_exact_bytes(reader, header.key_len as usize, max_frame_size).await?;

    let payload = match payload_header {
        PayloadHeader::None => Payload::None,
        PayloadHeader::Rendezvous(desc) => Payload::Rendezvous(desc),
        PayloadHeader::Inline { len } => {
            let len = usize::try_from(len)
                .map_err(|_| KvError::violation(format!("inline payload of {len} bytes")))?;
            Payload::Inline(read_exact_bytes(reader, len, max_frame_size).await?)
        }
    };

    Ok(Some(Frame::new(header.kind, header.request_id, key, payload)))
}

async fn read_exact_bytes<R>(reader: &mut R, len: usize, max: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    if len == 0 {
        return Ok(Bytes::new());
    }
    if len > max {
        return Err(KvError::violation(format!(
            "{len} byte field exceeds frame limit of {max}"
        )));
    }
    // Allocate up front only what a peer is unlikely to announce without
    // sending; larger fields grow as their bytes arrive.
    let mut buf = vec![0u8; len.min(UPFRONT_ALLOCATION_LIMIT)];
    reader.read_exact(&mut buf).await?;
    while buf.len() < len {
        let filled = buf.len();
        let step = (len - filled).min(UPFRONT_ALLOCATION_LIMIT);
        buf.reserve_exact(step);
        buf.resize(filled + step, 0);
        reader.read_exact(&mut buf[filled..]).await?;
    }
    Ok(Bytes::from(buf))
}

/// Write an encoded frame chunk by chunk
pub async fn write_frame<W>(writer: &mut W, frame: &EncodedFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for chunk in &frame.chunks {
        writer.write_all(chunk).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Access, FrameKind, RemoteKey};

    async fn round_trip(frame: &Frame) -> Frame {
        let encoded = frame.encode().unwrap();
        let (mut tx, mut rx) = tokio::io::duplex(1 << 20);
        let bytes = encoded.to_bytes();
        let writer = tokio::spawn(async move {
            tx.write_all(&bytes).await.unwrap();
        });
        let decoded = read_frame(&mut rx, 1 << 30).await.unwrap().unwrap();
        writer.await.unwrap();
        decoded
    }

    #[tokio::test]
    async fn test_eager_frame_over_channel() {
        let frame = Frame::new(
            FrameKind::Set,
            1,
            Bytes::from_static(b"key1"),
            Payload::Inline(Bytes::from_static(b"value1")),
        );
        assert_eq!(round_trip(&frame).await, frame);
    }

    #[tokio::test]
    async fn test_large_inline_frame_over_channel() {
        let value: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
        let frame = Frame::control(FrameKind::ReadData, 99, Payload::Inline(Bytes::from(value)));
        assert_eq!(round_trip(&frame).await, frame);
    }

    #[tokio::test]
    async fn test_rendezvous_frame_over_channel() {
        let frame = Frame::new(
            FrameKind::Set,
            5,
            Bytes::from_static(b"large_key"),
            Payload::Rendezvous(RegionDescriptor {
                rkey: RemoteKey(12),
                length: 64000,
                access: Access::REMOTE_READ,
                token: 77,
            }),
        );
        assert_eq!(round_trip(&frame).await, frame);
    }

    #[tokio::test]
    async fn test_clean_eof_and_oversized_payload() {
        let mut empty: &[u8] = &[];
        assert!(read_frame(&mut empty, 1024).await.unwrap().is_none());

        let frame = Frame::control(
            FrameKind::Value,
            1,
            Payload::Inline(Bytes::from(vec![0u8; 2048])),
        );
        let bytes = frame.encode().unwrap().to_bytes();
        let mut reader: &[u8] = &bytes;
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, KvError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_truncated_huge_payload_fails() {
        // Announces 512MB inline but the channel ends after a few bytes
        let frame = Frame::control(FrameKind::Value, 1, Payload::Inline(Bytes::from_static(b"abc")));
        let mut bytes = frame.encode().unwrap().to_bytes().to_vec();
        let len_at = FIXED_HEADER_LEN;
        bytes[len_at..len_at + 8].copy_from_slice(&(512u64 << 20).to_be_bytes());

        let mut reader: &[u8] = &bytes;
        let err = read_frame(&mut reader, 1 << 30).await.unwrap_err();
        assert!(matches!(err, KvError::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn test_payload_beyond_upfront_limit() {
        let value: Vec<u8> = (0..UPFRONT_ALLOCATION_LIMIT + 4097).map(|i| (i % 253) as u8).collect();
        let frame = Frame::control(FrameKind::ReadData, 3, Payload::Inline(Bytes::from(value)));
        let bytes = frame.encode().unwrap().to_bytes();
        let mut reader: &[u8] = &bytes;
        let decoded = read_frame(&mut reader, 1 << 30).await.unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = connect(&addr, &TransportConfig::default()).await.unwrap_err();
        assert!(err.is_connection_error());
    }
}
