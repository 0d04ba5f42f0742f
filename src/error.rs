//! Error taxonomy and public status codes
//!
//! Every public operation reports a [`KvError`]; callers that need the flat
//! status contract of the store convert it with [`Status::from`].

use std::io;
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T, E = KvError> = std::result::Result<T, E>;

/// Errors produced by the transport, session and client layers
#[derive(Debug, Error)]
pub enum KvError {
    /// The peer could not be reached
    #[error("failed to connect to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Peer answered, but not with a handshake this client understands
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The session is gone (peer hung up, closed locally, or torn down)
    #[error("session closed")]
    SessionClosed,

    /// A bounded wait expired
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Connecting or the handshake did not finish in time
    #[error("timed out opening session: {0}")]
    ConnectTimeout(&'static str),

    /// Caller supplied an argument the protocol cannot carry
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Peer sent something the protocol does not allow; fatal to the session
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A rendezvous transfer was abandoned before completion
    #[error("rendezvous aborted: {0}")]
    RendezvousAborted(String),

    /// Peer answered the request with an error
    #[error("remote error: {0}")]
    Remote(String),

    #[error("handshake encoding failed: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl KvError {
    /// Failure to establish or keep a session
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            KvError::Connection { .. }
                | KvError::Handshake(_)
                | KvError::ConnectTimeout(_)
                | KvError::SessionClosed
        )
    }

    /// A single operation failed while the session may still be usable
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            KvError::Timeout(_)
                | KvError::InvalidArgument(_)
                | KvError::RendezvousAborted(_)
                | KvError::Remote(_)
        )
    }

    /// Text sent to the peer in an ERROR frame
    pub(crate) fn remote_message(&self) -> String {
        match self {
            KvError::Remote(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        KvError::ProtocolViolation(msg.into())
    }
}

/// Flat status codes of the store contract; zero means success
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Ok = 0,
    ConnectionFailed = 1,
    Timeout = 2,
    InvalidArgument = 3,
    InternalError = 4,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl From<&KvError> for Status {
    fn from(err: &KvError) -> Self {
        match err {
            KvError::Connection { .. } | KvError::Handshake(_) | KvError::SessionClosed => {
                Status::ConnectionFailed
            }
            KvError::Timeout(_) | KvError::ConnectTimeout(_) => Status::Timeout,
            KvError::InvalidArgument(_) => Status::InvalidArgument,
            KvError::ProtocolViolation(_)
            | KvError::RendezvousAborted(_)
            | KvError::Remote(_)
            | KvError::Codec(_)
            | KvError::Io(_) => Status::InternalError,
        }
    }
}

impl<T> From<&Result<T>> for Status {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(e) => e.into(),
        }
    }
}
