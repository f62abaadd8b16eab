//! embercache: a RESP-compatible in-memory cache server with durable
//! persistence.
//!
//! A segmented LRU cache fronts an LSM storage engine; a cache manager
//! orchestrates cache-aside reads and write-through / write-back writes; a
//! RESP TCP front end makes the whole thing speak the Redis text protocol;
//! an embedded Raft node can order write commands across a cluster.

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod lsm;
pub mod manager;
pub mod metrics;
pub mod raft;
pub mod resp;
pub mod server;
pub mod tasks;
pub mod tmpfs;

pub use backend::{FileBackend, StorageBackend};
pub use cache::SegmentedCache;
pub use config::{Config, LsmConfig};
pub use error::{Error, Result};
pub use lsm::LsmEngine;
pub use manager::{CacheManager, WriteMode};
pub use server::Server;
