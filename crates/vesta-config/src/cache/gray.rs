// Gray rule cache: compiled match rules keyed by gray resource name

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use dashmap::DashMap;
use tracing::{debug, warn};

use vesta_common::VestaError;
use vesta_persistence::{GrayResource, ReleaseStore};

use super::flight::SingleFlight;
use crate::gray::GrayMatchRule;

pub struct GrayCache {
    store: Arc<dyn ReleaseStore>,
    rules: DashMap<String, Arc<GrayMatchRule>>,
    /// resource name -> modify time of the applied row
    modify_times: DashMap<String, i64>,
    last_fetch_time: AtomicI64,
    loaded: AtomicBool,
    flight: SingleFlight,
}

impl GrayCache {
    pub fn new(store: Arc<dyn ReleaseStore>) -> Self {
        Self {
            store,
            rules: DashMap::new(),
            modify_times: DashMap::new(),
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
            .get_more_gray_resource(since, first_load)
            .await
            .map_err(VestaError::store)?;

        if let Some(max_time) = rows.iter().map(|r| r.modify_time).max() {
            self.apply(rows);
            self.last_fetch_time.store(max_time, Ordering::Release);
        }
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    fn apply(&self, mut rows: Vec<GrayResource>) {
        rows.sort_by_key(|r| r.modify_time);
        for resource in rows {
            let stale = self
                .modify_times
                .get(&resource.name)
                .is_some_and(|t| *t > resource.modify_time);
            if stale {
                continue;
            }
            self.modify_times
                .insert(resource.name.clone(), resource.modify_time);

            if !resource.valid {
                self.rules.remove(&resource.name);
                debug!(resource = %resource.name, "gray rule removed");
                continue;
            }

            // a rule that no longer compiles never matches
            let rule = GrayMatchRule::from_json(&resource.match_rule).unwrap_or_else(|e| {
                warn!(resource = %resource.name, error = %e, "invalid gray rule in store");
                GrayMatchRule::default()
            });
            debug!(resource = %resource.name, "gray rule updated");
            self.rules.insert(resource.name, Arc::new(rule));
        }
    }

    pub fn get_rule(&self, name: &str) -> Option<Arc<GrayMatchRule>> {
        self.rules.get(name).map(|r| r.value().clone())
    }

    /// Whether the client hits the named gray rule; an absent rule never hits
    pub fn hit(&self, name: &str, client_labels: &HashMap<String, String>) -> bool {
        self.get_rule(name)
            .is_some_and(|rule| rule.matches(client_labels))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use vesta_persistence::{ClientLabel, ConfigFileKey, MemoryReleaseStore};

    use super::*;
    use crate::gray::{labels, serialize_beta_labels};

    #[tokio::test]
    async fn test_gray_rules_follow_store() {
        let store = Arc::new(MemoryReleaseStore::new());
        let cache = GrayCache::new(store.clone());
        let file = ConfigFileKey::new("ns", "g", "app.yaml");
        let name = file.gray_resource_name();

        let mut tx = store.start_tx().await.unwrap();
        tx.create_gray_resource(
            &file,
            GrayResource {
                name: name.clone(),
                match_rule: serialize_beta_labels(&[ClientLabel::exact(labels::CLIENT_IP, "1.1.1.1")])
                    .unwrap(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        cache.update().await.unwrap();
        let client: HashMap<String, String> =
            [(labels::CLIENT_IP.to_string(), "1.1.1.1".to_string())].into();
        assert!(cache.hit(&name, &client));
        assert!(!cache.hit(&name, &HashMap::new()));

        let mut tx = store.start_tx().await.unwrap();
        tx.clean_gray_resource(&file).await.unwrap();
        tx.commit().await.unwrap();

        cache.update().await.unwrap();
        assert!(cache.is_empty());
        assert!(!cache.hit(&name, &client));
    }
}
