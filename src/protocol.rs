//! Wire protocol for the KV session
//!
//! Every message is a frame: a fixed 17-byte header, a payload descriptor
//! whose size depends on the payload tag, the key bytes, and for inline
//! payloads the value bytes themselves.
//!
//! ```text
//! offset size field
//! 0      2    magic 0x4B56
//! 2      1    version
//! 3      1    kind
//! 4      8    request id
//! 12     4    key length
//! 16     1    payload tag (0 none, 1 inline, 2 rendezvous)
//! 17     ..   descriptor: inline = u64 length,
//!             rendezvous = rkey u64, length u64, access u8, token u64
//! ```
//!
//! All integers are big endian.

use crate::error::{KvError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub const MAGIC: u16 = 0x4B56;
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed part of every frame header
pub const FIXED_HEADER_LEN: usize = 17;

/// Payloads at or above this many bytes go through rendezvous by default
pub const DEFAULT_EAGER_THRESHOLD: usize = 4096;

const TAG_NONE: u8 = 0;
const TAG_INLINE: u8 = 1;
const TAG_RENDEZVOUS: u8 = 2;

const INLINE_DESCRIPTOR_LEN: usize = 8;
const RENDEZVOUS_DESCRIPTOR_LEN: usize = 25;

/// Operation carried by a frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Hello = 1,
    HelloAck = 2,
    Set = 3,
    Get = 4,
    Delete = 5,
    Ack = 6,
    Value = 7,
    NotFound = 8,
    /// One-sided pull of a registered region
    Read = 9,
    ReadData = 10,
    /// Receiver finished pulling a region
    Done = 11,
    Error = 12,
    Bye = 13,
}

impl FrameKind {
    /// Kinds that answer an earlier request and are routed by request id
    pub fn is_response(self) -> bool {
        matches!(
            self,
            FrameKind::HelloAck
                | FrameKind::Ack
                | FrameKind::Value
                | FrameKind::NotFound
                | FrameKind::ReadData
                | FrameKind::Error
        )
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = KvError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => FrameKind::Hello,
            2 => FrameKind::HelloAck,
            3 => FrameKind::Set,
            4 => FrameKind::Get,
            5 => FrameKind::Delete,
            6 => FrameKind::Ack,
            7 => FrameKind::Value,
            8 => FrameKind::NotFound,
            9 => FrameKind::Read,
            10 => FrameKind::ReadData,
            11 => FrameKind::Done,
            12 => FrameKind::Error,
            13 => FrameKind::Bye,
            other => return Err(KvError::violation(format!("unknown frame kind {other}"))),
        })
    }
}

/// Access rights granted on a registered region
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Access(u8);

impl Access {
    pub const NONE: Access = Access(0);
    pub const REMOTE_READ: Access = Access(0b01);
    pub const REMOTE_WRITE: Access = Access(0b10);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Access(bits & 0b11)
    }

    pub fn contains(self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Remote key identifying a registered region within one registry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteKey(pub u64);

/// Capability advertised to a peer so it can pull one region
///
/// The token is only known to the registry that issued the descriptor, so a
/// peer cannot forge access to regions it was never told about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub rkey: RemoteKey,
    pub length: u64,
    pub access: Access,
    pub token: u64,
}

/// How the value bytes of a frame travel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    None,
    Inline(Bytes),
    Rendezvous(RegionDescriptor),
}

impl Payload {
    fn tag(&self) -> u8 {
        match self {
            Payload::None => TAG_NONE,
            Payload::Inline(_) => TAG_INLINE,
            Payload::Rendezvous(_) => TAG_RENDEZVOUS,
        }
    }
}

/// Eager or rendezvous, decided per payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferMode {
    Eager,
    Rendezvous,
}

/// Size-based choice between inline and zero-copy transfer
#[derive(Clone, Copy, Debug)]
pub struct PayloadPolicy {
    pub eager_threshold: usize,
}

impl PayloadPolicy {
    pub fn new(eager_threshold: usize) -> Self {
        Self { eager_threshold }
    }

    /// Payloads at or above the threshold use rendezvous when the peer can
    /// serve region reads; everything else is inlined.
    pub fn classify(&self, len: usize, peer_rendezvous: bool) -> TransferMode {
        if peer_rendezvous && len >= self.eager_threshold {
            TransferMode::Rendezvous
        } else {
            TransferMode::Eager
        }
    }
}

impl Default for PayloadPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_EAGER_THRESHOLD)
    }
}

/// Handshake body carried inline by HELLO and HELLO_ACK
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloBody {
    pub protocol_version: u8,
    pub node_id: u32,
    /// Assigned by the server; zero in the client's HELLO
    pub session_id: u64,
    /// Whether this side can register regions and serve READ
    pub rendezvous: bool,
    pub eager_threshold: u64,
}

impl HelloBody {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// A decoded protocol frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub request_id: u64,
    pub key: Bytes,
    pub payload: Payload,
}

impl Frame {
    pub fn new(kind: FrameKind, request_id: u64, key: Bytes, payload: Payload) -> Self {
        Self {
            kind,
            request_id,
            key,
            payload,
        }
    }

    /// Frame without key, used for replies and control messages
    pub fn control(kind: FrameKind, request_id: u64, payload: Payload) -> Self {
        Self::new(kind, request_id, Bytes::new(), payload)
    }

    pub fn error(request_id: u64, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::control(FrameKind::Error, request_id, Payload::Inline(Bytes::from(message)))
    }

    /// Human-readable text of an ERROR frame
    pub fn error_message(&self) -> String {
        match &self.payload {
            Payload::Inline(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            _ => String::from("unspecified error"),
        }
    }

    /// Encode into the chunks that go on the wire. The header and key are
    /// copied into a small scratch buffer; inline payload bytes are passed
    /// through as the same `Bytes` so large values are never staged.
    pub fn encode(&self) -> Result<EncodedFrame> {
        let key_len = u32::try_from(self.key.len())
            .map_err(|_| KvError::InvalidArgument(format!("key of {} bytes", self.key.len())))?;

        let mut header = BytesMut::with_capacity(
            FIXED_HEADER_LEN + RENDEZVOUS_DESCRIPTOR_LEN + self.key.len(),
        );
        header.put_u16(MAGIC);
        header.put_u8(PROTOCOL_VERSION);
        header.put_u8(self.kind as u8);
        header.put_u64(self.request_id);
        header.put_u32(key_len);
        header.put_u8(self.payload.tag());
        match &self.payload {
            Payload::None => {}
            Payload::Inline(bytes) => header.put_u64(bytes.len() as u64),
            Payload::Rendezvous(desc) => {
                header.put_u64(desc.rkey.0);
                header.put_u64(desc.length);
                header.put_u8(desc.access.bits());
                header.put_u64(desc.token);
            }
        }
        header.put_slice(&self.key);

        let mut chunks = SmallVec::new();
        chunks.push(header.freeze());
        if let Payload::Inline(bytes) = &self.payload {
            if !bytes.is_empty() {
                chunks.push(bytes.clone());
            }
        }
        Ok(EncodedFrame { chunks })
    }
}

/// Wire chunks of one frame, written back to back
#[derive(Debug)]
pub struct EncodedFrame {
    pub chunks: SmallVec<[Bytes; 2]>,
}

impl EncodedFrame {
    /// Bytes this frame occupies on the wire
    pub fn wire_len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// Flatten into one contiguous buffer
    #[cfg(test)]
    pub(crate) fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.wire_len());
        for chunk in &self.chunks {
            out.put_slice(chunk);
        }
        out.freeze()
    }
}

/// Parsed fixed header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub request_id: u64,
    pub key_len: u32,
    pub tag: u8,
}

impl FrameHeader {
    pub fn parse(buf: &[u8; FIXED_HEADER_LEN]) -> Result<Self> {
        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != MAGIC {
            return Err(KvError::violation(format!("bad magic {magic:#06x}")));
        }
        if buf[2] != PROTOCOL_VERSION {
            return Err(KvError::violation(format!(
                "unsupported protocol version {}",
                buf[2]
            )));
        }
        let kind = FrameKind::try_from(buf[3])?;
        let request_id = u64::from_be_bytes(read_array(&buf[4..12]));
        let key_len = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let tag = buf[16];
        if tag > TAG_RENDEZVOUS {
            return Err(KvError::violation(format!("unknown payload tag {tag}")));
        }
        Ok(Self {
            kind,
            request_id,
            key_len,
            tag,
        })
    }

    /// Bytes of payload descriptor that follow the fixed header
    pub fn descriptor_len(&self) -> usize {
        match self.tag {
            TAG_INLINE => INLINE_DESCRIPTOR_LEN,
            TAG_RENDEZVOUS => RENDEZVOUS_DESCRIPTOR_LEN,
            _ => 0,
        }
    }
}

/// Payload descriptor as read off the wire, before inline bytes arrive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadHeader {
    None,
    Inline { len: u64 },
    Rendezvous(RegionDescriptor),
}

impl PayloadHeader {
    pub fn parse(tag: u8, buf: &[u8]) -> Result<Self> {
        match tag {
            TAG_NONE => Ok(PayloadHeader::None),
            TAG_INLINE if buf.len() == INLINE_DESCRIPTOR_LEN => Ok(PayloadHeader::Inline {
                len: u64::from_be_bytes(read_array(buf)),
            }),
            TAG_RENDEZVOUS if buf.len() == RENDEZVOUS_DESCRIPTOR_LEN => {
                Ok(PayloadHeader::Rendezvous(RegionDescriptor {
                    rkey: RemoteKey(u64::from_be_bytes(read_array(&buf[0..8]))),
                    length: u64::from_be_bytes(read_array(&buf[8..16])),
                    access: Access::from_bits(buf[16]),
                    token: u64::from_be_bytes(read_array(&buf[17..25])),
                }))
            }
            _ => Err(KvError::violation(format!(
                "descriptor of {} bytes for tag {tag}",
                buf.len()
            ))),
        }
    }
}

fn read_array(buf: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[..8]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(bytes: &Bytes) -> [u8; FIXED_HEADER_LEN] {
        let mut out = [0u8; FIXED_HEADER_LEN];
        out.copy_from_slice(&bytes[..FIXED_HEADER_LEN]);
        out
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let policy = PayloadPolicy::new(4096);
        assert_eq!(policy.classify(4095, true), TransferMode::Eager);
        assert_eq!(policy.classify(4096, true), TransferMode::Rendezvous);
        assert_eq!(policy.classify(64000, true), TransferMode::Rendezvous);
        // Peers without registration capability always get inline payloads
        assert_eq!(policy.classify(64000, false), TransferMode::Eager);
    }

    #[test]
    fn test_inline_payload_is_not_copied() {
        let value = Bytes::from(vec![b'a'; 10_000]);
        let frame = Frame::new(
            FrameKind::Set,
            7,
            Bytes::from_static(b"large_key"),
            Payload::Inline(value.clone()),
        );
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.chunks.len(), 2);
        assert_eq!(encoded.chunks[1].as_ptr(), value.as_ptr());
        assert_eq!(
            encoded.wire_len(),
            FIXED_HEADER_LEN + INLINE_DESCRIPTOR_LEN + 9 + 10_000
        );
    }

    #[test]
    fn test_header_fields() {
        let desc = RegionDescriptor {
            rkey: RemoteKey(3),
            length: 64000,
            access: Access::REMOTE_READ,
            token: 0xdead_beef,
        };
        let frame = Frame::new(
            FrameKind::Value,
            42,
            Bytes::from_static(b"k"),
            Payload::Rendezvous(desc),
        );
        let bytes = frame.encode().unwrap().to_bytes();

        let header = FrameHeader::parse(&fixed(&bytes)).unwrap();
        assert_eq!(header.kind, FrameKind::Value);
        assert_eq!(header.request_id, 42);
        assert_eq!(header.key_len, 1);
        assert_eq!(header.descriptor_len(), RENDEZVOUS_DESCRIPTOR_LEN);

        let end = FIXED_HEADER_LEN + RENDEZVOUS_DESCRIPTOR_LEN;
        let payload = PayloadHeader::parse(header.tag, &bytes[FIXED_HEADER_LEN..end]).unwrap();
        assert_eq!(payload, PayloadHeader::Rendezvous(desc));
        assert_eq!(&bytes[end..], b"k");
    }

    #[test]
    fn test_rejects_bad_magic_and_kind() {
        let frame = Frame::control(FrameKind::Bye, 0, Payload::None);
        let mut raw = fixed(&frame.encode().unwrap().to_bytes());

        let mut bad_magic = raw;
        bad_magic[0] = 0;
        assert!(matches!(
            FrameHeader::parse(&bad_magic),
            Err(KvError::ProtocolViolation(_))
        ));

        raw[3] = 200;
        assert!(matches!(
            FrameHeader::parse(&raw),
            Err(KvError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_access_rights() {
        let rw = Access::from_bits(Access::REMOTE_READ.bits() | Access::REMOTE_WRITE.bits());
        assert!(rw.contains(Access::REMOTE_READ));
        assert!(!Access::REMOTE_WRITE.contains(Access::REMOTE_READ));
        assert_eq!(Access::from_bits(0xff), rw);
    }

    #[test]
    fn test_hello_body_encoding() {
        let hello = HelloBody {
            protocol_version: PROTOCOL_VERSION,
            node_id: 9,
            session_id: 0,
            rendezvous: true,
            eager_threshold: 4096,
        };
        let decoded = HelloBody::decode(&hello.encode().unwrap()).unwrap();
        assert_eq!(decoded, hello);
    }
}
