//! Release content offload trait
//!
//! One logical bucket per owner key (`namespace@group`), entries keyed by the
//! release active key. Implementations are synchronous; callers treat every
//! error as a persistence failure.

/// Offload store for active release content bodies
pub trait ReleaseContentStore: Send + Sync {
    /// Idempotent upsert of a content body
    fn put(&self, owner_key: &str, active_key: &str, content: &str) -> anyhow::Result<()>;

    fn get(&self, owner_key: &str, active_key: &str) -> anyhow::Result<Option<String>>;

    /// Idempotent delete; deleting a missing entry succeeds
    fn delete(&self, owner_key: &str, active_key: &str) -> anyhow::Result<()>;

    /// Active keys currently stored in a bucket
    fn bucket_keys(&self, owner_key: &str) -> anyhow::Result<Vec<String>>;

    /// Drop every bucket, used before a full rebuild
    fn clear(&self) -> anyhow::Result<()>;
}
