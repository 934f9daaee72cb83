// In-memory release content store
// Bucket per owner key, used by tests and by deployments without a data dir

use std::collections::HashMap;

use dashmap::DashMap;

use crate::traits::ReleaseContentStore;

/// Release content kept in process memory, one bucket per owner key
#[derive(Default)]
pub struct MemoryContentStore {
    buckets: DashMap<String, HashMap<String, String>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored entries across all buckets
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReleaseContentStore for MemoryContentStore {
    fn put(&self, owner_key: &str, active_key: &str, content: &str) -> anyhow::Result<()> {
        self.buckets
            .entry(owner_key.to_string())
            .or_default()
            .insert(active_key.to_string(), content.to_string());
        Ok(())
    }

    fn get(&self, owner_key: &str, active_key: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .buckets
            .get(owner_key)
            .and_then(|bucket| bucket.get(active_key).cloned()))
    }

    fn delete(&self, owner_key: &str, active_key: &str) -> anyhow::Result<()> {
        if let Some(mut bucket) = self.buckets.get_mut(owner_key) {
            bucket.remove(active_key);
            if bucket.is_empty() {
                drop(bucket);
                self.buckets.remove_if(owner_key, |_, b| b.is_empty());
            }
        }
        Ok(())
    }

    fn bucket_keys(&self, owner_key: &str) -> anyhow::Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .buckets
            .get(owner_key)
            .map(|bucket| bucket.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> anyhow::Result<()> {
        self.buckets.clear();
        Ok(())
    }
}
