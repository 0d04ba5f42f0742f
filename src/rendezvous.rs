//! Rendezvous transfers of large values
//!
//! Sender: `Prepared` (region registered, descriptor sent) → `Transferring`
//! (peer is pulling the region) → `Complete` (peer signalled) → deregistered.
//!
//! Receiver: `AwaitingDescriptor` → `Pulling` (one-sided read of the
//! advertised region into the single destination buffer) → `Done`.

use crate::error::{KvError, Result};
use crate::memory::RegionRegistry;
use crate::protocol::{Access, RegionDescriptor};
use crate::transport::RegionTransport;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Sender-side state of an exposed region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendState {
    Prepared,
    Transferring,
    Complete,
}

/// Receiver-side state of a pull
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvState {
    AwaitingDescriptor,
    Pulling,
    Done,
}

/// How the receiver tells the sender it is finished with a region
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionSignal {
    /// Send DONE right after the pull (receiver of a VALUE)
    Done,
    /// The reply to the originating request acts as the signal (receiver of a SET)
    Reply,
}

/// A value exposed to the peer for one transfer
///
/// Dropping the guard before completion aborts the transfer and deregisters
/// the region, so later reads from the peer fail instead of observing memory
/// the owner no longer vouches for.
pub struct ExposedRegion {
    registry: Arc<RegionRegistry>,
    descriptor: RegionDescriptor,
    done: Option<oneshot::Receiver<()>>,
    finished: bool,
}

impl ExposedRegion {
    pub fn expose(registry: &Arc<RegionRegistry>, data: Bytes) -> Self {
        let (descriptor, done) = registry.register(data, Access::REMOTE_READ);
        Self {
            registry: Arc::clone(registry),
            descriptor,
            done: Some(done),
            finished: false,
        }
    }

    pub fn descriptor(&self) -> RegionDescriptor {
        self.descriptor
    }

    pub fn state(&self) -> Option<SendState> {
        self.registry.state(self.descriptor.rkey)
    }

    /// Complete on behalf of the peer, when its reply to our request is the
    /// completion signal.
    pub fn complete(mut self) -> Result<()> {
        self.finished = true;
        if self.registry.complete(self.descriptor.rkey)? {
            Ok(())
        } else {
            Err(KvError::RendezvousAborted(format!(
                "region {} was deregistered before completion",
                self.descriptor.rkey.0
            )))
        }
    }

    /// Wait for the peer's DONE. On timeout the region is aborted.
    pub async fn wait_complete(mut self, timeout: Duration) -> Result<()> {
        let Some(done) = self.done.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, done).await {
            Ok(Ok(())) => {
                self.finished = true;
                Ok(())
            }
            // Sender dropped: region was aborted (session teardown)
            Ok(Err(_)) => {
                self.finished = true;
                Err(KvError::RendezvousAborted(format!(
                    "region {} aborted",
                    self.descriptor.rkey.0
                )))
            }
            Err(_) => {
                tracing::warn!(
                    "Peer never completed region rkey={}, aborting",
                    self.descriptor.rkey.0
                );
                Err(KvError::Timeout("rendezvous completion"))
            }
        }
    }
}

impl Drop for ExposedRegion {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.abort(self.descriptor.rkey);
        }
    }
}

/// Receiver side of one transfer
#[derive(Debug)]
pub struct InboundTransfer {
    descriptor: Option<RegionDescriptor>,
    state: RecvState,
}

impl InboundTransfer {
    pub fn new() -> Self {
        Self {
            descriptor: None,
            state: RecvState::AwaitingDescriptor,
        }
    }

    pub fn state(&self) -> RecvState {
        self.state
    }

    /// Pull the advertised region. The returned buffer is only surfaced once
    /// every byte has arrived; failures discard whatever was read.
    pub async fn pull<T>(
        &mut self,
        transport: &T,
        descriptor: RegionDescriptor,
        timeout: Duration,
        signal: CompletionSignal,
    ) -> Result<Bytes>
    where
        T: RegionTransport + ?Sized,
    {
        if self.state != RecvState::AwaitingDescriptor {
            return Err(KvError::violation(format!(
                "pull requested in state {:?}",
                self.state
            )));
        }
        self.descriptor = Some(descriptor);
        self.state = RecvState::Pulling;

        tracing::debug!(
            "Pulling region rkey={} len={}",
            descriptor.rkey.0,
            descriptor.length
        );

        let data = match tokio::time::timeout(timeout, transport.read_remote(descriptor)).await {
            Ok(result) => result?,
            Err(_) => return Err(KvError::Timeout("rendezvous read")),
        };

        if data.len() as u64 != descriptor.length {
            return Err(KvError::RendezvousAborted(format!(
                "region {} delivered {} of {} bytes",
                descriptor.rkey.0,
                data.len(),
                descriptor.length
            )));
        }

        if signal == CompletionSignal::Done {
            transport.signal_done(descriptor).await?;
        }
        self.state = RecvState::Done;
        Ok(data)
    }
}

impl Default for InboundTransfer {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull a region with a fresh receiver state machine
pub async fn pull<T>(
    transport: &T,
    descriptor: RegionDescriptor,
    timeout: Duration,
    signal: CompletionSignal,
) -> Result<Bytes>
where
    T: RegionTransport + ?Sized,
{
    InboundTransfer::new()
        .pull(transport, descriptor, timeout, signal)
        .await
}
