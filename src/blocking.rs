//! Blocking client
//!
//! Wraps [`crate::client::KvClient`] with a private runtime so callers
//! without an async context get the plain open/set/get/release/close
//! contract, each call blocking the calling thread until it completes.
//!
//! Must not be used from within an async runtime.

use crate::client::{self, ClientConfig, ValueBuffer};
use crate::error::Result;
use bytes::Bytes;
use tokio::runtime::{Builder, Runtime};

/// An open session that blocks the calling thread on every operation
pub struct KvClient {
    // Dropped before the runtime that drives it
    inner: client::KvClient,
    runtime: Runtime,
}

impl KvClient {
    pub fn connect(server_addr: impl Into<String>) -> Result<Self> {
        Self::open(ClientConfig {
            server_addr: server_addr.into(),
            ..Default::default()
        })
    }

    pub fn open(config: ClientConfig) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("kv-client-io")
            .enable_all()
            .build()?;
        let inner = runtime.block_on(client::KvClient::open(config))?;
        Ok(Self { inner, runtime })
    }

    pub fn session_id(&self) -> u64 {
        self.inner.session_id()
    }

    pub fn set(&self, key: impl AsRef<[u8]>, value: impl Into<Bytes>) -> Result<()> {
        self.runtime.block_on(self.inner.set(key, value))
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<ValueBuffer> {
        self.runtime.block_on(self.inner.get(key))
    }

    pub fn delete(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        self.runtime.block_on(self.inner.delete(key))
    }

    /// Give back a buffer returned by [`KvClient::get`]
    pub fn release(&self, value: ValueBuffer) {
        value.release();
    }

    pub fn outstanding_buffers(&self) -> usize {
        self.inner.outstanding_buffers()
    }

    pub fn close(self) -> Result<()> {
        let Self { inner, runtime } = self;
        runtime.block_on(inner.close())
    }
}
