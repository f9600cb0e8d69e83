//! Data layer module
//!
//! Everything between callers and the data:
//! - TTL cache with typed keys
//! - Live store connection (MongoDB, or in-memory for development)
//! - On-disk fallback snapshots
//! - The facade combining the three

mod access;
mod cache;
mod connection;
mod fallback;
mod keys;
mod memory;
mod models;
mod mongo;
mod store;

pub use access::{DataAccess, SyncReport};
pub use cache::{CacheStats, CacheStore, PersistReport};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use fallback::FallbackStore;
pub use keys::{Accessor, CacheKey};
pub use memory::MemoryStore;
pub use models::*;
pub use mongo::MongoStore;
pub use store::{Connector, DocumentStore, Query, StoreError, UriConnector};
