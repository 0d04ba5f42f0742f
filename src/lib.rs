//! In-memory key-value store over an eager/rendezvous transport
//!
//! Small values are copied inline into protocol frames. Values at or above
//! the eager threshold are exposed as registered memory regions and pulled
//! by the peer in one piece, without staging copies on the owning side.

pub mod blocking;
pub mod client;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod rendezvous;
pub mod server;
pub mod session;
pub mod store;
pub mod transport;

pub use client::{ClientConfig, KvClient, ValueBuffer};
pub use error::{KvError, Result, Status};
pub use protocol::{PayloadPolicy, RegionDescriptor, DEFAULT_EAGER_THRESHOLD};
pub use server::{KvServer, ServerConfig, ServerHandle};
pub use store::KvStore;
pub use transport::TransportConfig;
