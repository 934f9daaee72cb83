//! Persistence traits for the release engine
//!
//! `ReleaseStore` is the transactional source of truth for files, releases,
//! history and gray rules. `ReleaseContentStore` is the derived, rebuildable
//! offload store holding active release bodies outside process memory.

pub mod content;
pub mod release;

pub use content::ReleaseContentStore;
pub use release::{ReleaseStore, ReleaseTx};
