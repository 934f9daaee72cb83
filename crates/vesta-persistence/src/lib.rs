//! Vesta Persistence - Release store contract and backends
//!
//! This crate provides:
//! - Storage model types (files, releases, history, gray resources, groups)
//! - Persistence trait abstractions (`ReleaseStore`, `ReleaseTx`, `ReleaseContentStore`)
//! - An in-memory transactional release store
//! - Release content offload stores (RocksDB and in-memory)

pub mod embedded;
pub mod memory;
pub mod model;
pub mod traits;

// Re-export persistence traits
pub use traits::{ReleaseContentStore, ReleaseStore, ReleaseTx};

// Re-export backends
pub use embedded::RocksContentStore;
pub use memory::{MemoryContentStore, MemoryReleaseStore};

// Re-export model types
pub use model::{
    ClientLabel, ConfigFile, ConfigFileGroup, ConfigFileKey, ConfigFileRelease,
    ConfigFileReleaseHistory, ConfigFileReleaseKey, GrayResource, MatchString, MatchType, Page,
    ReleaseOpType, ReleaseStatus, ReleaseType, SimpleConfigFileRelease,
};
