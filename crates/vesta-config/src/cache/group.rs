// Config group cache

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use dashmap::DashMap;
use tracing::debug;

use vesta_common::VestaError;
use vesta_persistence::{ConfigFileGroup, ReleaseStore};

use super::flight::SingleFlight;

pub struct GroupCache {
    store: Arc<dyn ReleaseStore>,
    /// owner key -> group
    groups: DashMap<String, ConfigFileGroup>,
    last_fetch_time: AtomicI64,
    loaded: AtomicBool,
    flight: SingleFlight,
}

impl GroupCache {
    pub fn new(store: Arc<dyn ReleaseStore>) -> Self {
        Self {
            store,
            groups: DashMap::new(),
            last_fetch_time: AtomicI64::new(0),
            loaded: AtomicBool::new(false),
            flight: SingleFlight::default(),
        }
    }

    pub async fn update(&self) -> Result<(), VestaError> {
        self.flight.run(|| self.refresh()).await.0
    }

    /// Refresh, never settling for a fetch that started before the call
    pub async fn update_latest(&self) -> Result<(), VestaError> {
        self.flight.run_latest(|| self.refresh()).await
    }

    async fn refresh(&self) -> Result<(), VestaError> {
        let first_load = !self.loaded.load(Ordering::Acquire);
        let since = self.last_fetch_time.load(Ordering::Acquire);
        let rows = self
            .store
            .get_more_config_group(since, first_load)
            .await
            .map_err(VestaError::store)?;

        if let Some(max_time) = rows.iter().map(|g| g.modify_time).max() {
            for group in rows {
                let owner = group.owner_key();
                if !group.valid {
                    self.groups.remove(&owner);
                    continue;
                }
                let stale = self
                    .groups
                    .get(&owner)
                    .is_some_and(|g| g.modify_time > group.modify_time);
                if !stale {
                    self.groups.insert(owner, group);
                }
            }
            debug!(count = self.groups.len(), "config group cache refreshed");
            self.last_fetch_time.store(max_time, Ordering::Release);
        }
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<ConfigFileGroup> {
        self.groups
            .get(&vesta_persistence::model::owner_key(namespace, name))
            .map(|g| g.value().clone())
    }

    /// Groups of a namespace sorted by name
    pub fn list(&self, namespace: &str) -> Vec<ConfigFileGroup> {
        let mut groups: Vec<ConfigFileGroup> = self
            .groups
            .iter()
            .filter(|g| g.namespace == namespace)
            .map(|g| g.value().clone())
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }
}
