//! Registered memory for zero-copy transfers
//!
//! A [`RegionRegistry`] holds the regions one side of a session has exposed
//! to its peer. Regions are immutable [`Bytes`], so serving a remote read
//! hands out another reference to the registered memory instead of copying
//! it. The [`BufferLedger`] tracks value buffers handed to the application
//! until they are released.

use crate::error::{KvError, Result};
use crate::protocol::{Access, RegionDescriptor, RemoteKey};
use crate::rendezvous::SendState;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::BuildHasher;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};

struct Region {
    data: Bytes,
    access: Access,
    token: u64,
    state: SendState,
    /// Fired when the peer signals completion
    done: Option<oneshot::Sender<()>>,
    registered_at: Instant,
}

/// Regions exposed by one side of a session
pub struct RegionRegistry {
    regions: Mutex<HashMap<u64, Region>>,
    next_rkey: AtomicU64,
    token_hasher: RandomState,
    drained: Notify,
}

impl RegionRegistry {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(HashMap::new()),
            next_rkey: AtomicU64::new(1),
            token_hasher: RandomState::new(),
            drained: Notify::new(),
        }
    }

    /// Expose `data` to the peer. The region starts `Prepared`; the returned
    /// receiver resolves once the peer signals completion.
    pub fn register(&self, data: Bytes, access: Access) -> (RegionDescriptor, oneshot::Receiver<()>) {
        let rkey = self.next_rkey.fetch_add(1, Ordering::Relaxed);
        let token = self.token_hasher.hash_one((rkey, data.as_ptr() as usize));
        let (done_tx, done_rx) = oneshot::channel();

        let descriptor = RegionDescriptor {
            rkey: RemoteKey(rkey),
            length: data.len() as u64,
            access,
            token,
        };

        tracing::trace!("Registered region rkey={} len={}", rkey, data.len());

        self.regions.lock().insert(
            rkey,
            Region {
                data,
                access,
                token,
                state: SendState::Prepared,
                done: Some(done_tx),
                registered_at: Instant::now(),
            },
        );

        (descriptor, done_rx)
    }

    /// Serve a one-sided read of a region. Returns a reference to the
    /// registered bytes; nothing is copied.
    pub fn read(&self, desc: &RegionDescriptor) -> Result<Bytes> {
        let mut regions = self.regions.lock();
        let region = regions
            .get_mut(&desc.rkey.0)
            .ok_or_else(|| KvError::Remote(format!("region {} is not registered", desc.rkey.0)))?;

        if region.token != desc.token {
            return Err(KvError::Remote(format!("bad token for region {}", desc.rkey.0)));
        }
        if !region.access.contains(Access::REMOTE_READ) || !desc.access.contains(Access::REMOTE_READ) {
            return Err(KvError::Remote(format!(
                "region {} does not grant remote read",
                desc.rkey.0
            )));
        }
        if region.data.len() as u64 != desc.length {
            return Err(KvError::Remote(format!(
                "length mismatch for region {}: registered {}, requested {}",
                desc.rkey.0,
                region.data.len(),
                desc.length
            )));
        }

        region.state = SendState::Transferring;
        Ok(region.data.clone())
    }

    /// Peer finished with the region: deregister it and wake the owner.
    ///
    /// Returns `Ok(false)` for unknown keys (the region may already have been
    /// aborted). Completing a non-empty region nobody has read yet is an
    /// out-of-order signal.
    pub fn complete(&self, rkey: RemoteKey) -> Result<bool> {
        let mut regions = self.regions.lock();
        let Some(region) = regions.get(&rkey.0) else {
            return Ok(false);
        };
        if region.state == SendState::Prepared && !region.data.is_empty() {
            return Err(KvError::violation(format!(
                "completion for region {} before it was read",
                rkey.0
            )));
        }

        let Some(mut region) = regions.remove(&rkey.0) else {
            return Ok(false);
        };
        region.state = SendState::Complete;
        if let Some(done) = region.done.take() {
            let _ = done.send(());
        }
        tracing::trace!(
            "Region rkey={} complete after {:?}",
            rkey.0,
            region.registered_at.elapsed()
        );
        let empty = regions.is_empty();
        drop(regions);

        if empty {
            self.drained.notify_waiters();
        }
        Ok(true)
    }

    /// Deregister without completion. Later reads of the region fail.
    pub fn abort(&self, rkey: RemoteKey) -> bool {
        let mut regions = self.regions.lock();
        let removed = regions.remove(&rkey.0).is_some();
        let empty = regions.is_empty();
        drop(regions);

        if removed {
            tracing::debug!("Aborted region rkey={}", rkey.0);
            if empty {
                self.drained.notify_waiters();
            }
        }
        removed
    }

    /// Deregister everything, returning how many regions were dropped
    pub fn abort_all(&self) -> usize {
        let count = {
            let mut regions = self.regions.lock();
            let count = regions.len();
            regions.clear();
            count
        };
        if count > 0 {
            tracing::debug!("Aborted {} outstanding regions", count);
        }
        self.drained.notify_waiters();
        count
    }

    pub fn state(&self, rkey: RemoteKey) -> Option<SendState> {
        self.regions.lock().get(&rkey.0).map(|r| r.state)
    }

    pub fn outstanding(&self) -> usize {
        self.regions.lock().len()
    }

    /// Wait until no regions remain registered; false on timeout
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                if self.outstanding() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    pub fn stats(&self) -> RegistryStats {
        let regions = self.regions.lock();
        RegistryStats {
            regions: regions.len(),
            bytes: regions.values().map(|r| r.data.len()).sum(),
        }
    }
}

impl Default for RegionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub regions: usize,
    pub bytes: usize,
}

/// Size of a memory page on this host
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Resident set size of the current process in bytes, from `/proc/self/statm`
pub fn resident_set_size() -> io::Result<usize> {
    let statm = std::fs::read_to_string("/proc/self/statm")?;
    let pages: usize = statm
        .split_whitespace()
        .nth(1)
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed statm"))?;
    Ok(pages * page_size())
}

/// Accounting for value buffers owned by the application
#[derive(Debug, Default)]
pub struct BufferLedger {
    outstanding: AtomicUsize,
    outstanding_bytes: AtomicUsize,
    released: AtomicU64,
}

impl BufferLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a buffer handed to the application
    pub fn lease(self: &Arc<Self>, len: usize) -> Lease {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.outstanding_bytes.fetch_add(len, Ordering::AcqRel);
        Lease {
            ledger: Arc::clone(self),
            len,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes.load(Ordering::Acquire)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }
}

/// Ownership record of one handed-out buffer; released exactly once on drop
#[derive(Debug)]
pub struct Lease {
    ledger: Arc<BufferLedger>,
    len: usize,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.ledger.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.ledger
            .outstanding_bytes
            .fetch_sub(self.len, Ordering::AcqRel);
        self.ledger.released.fetch_add(1, Ordering::AcqRel);
    }
}
