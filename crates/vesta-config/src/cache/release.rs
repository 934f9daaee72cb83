//! Incremental release cache
//!
//! Mirrors release metadata in memory and offloads the content bodies of
//! active releases into a `ReleaseContentStore`. Three flat indexes:
//! - release id -> metadata
//! - release key (`ns@group@file@name`) -> release id
//! - active key (`ns@group@file@type`) -> metadata of the active release
//!
//! Deltas are pulled with `get_more_release_file(last_fetch_time)` and applied
//! in modify-time order. An activation is only promoted if its version is not
//! older than the highest version already promoted under the same active key.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use vesta_common::{KEY_SEPARATOR, VestaError, md5_hex};
use vesta_persistence::model::owner_key;
use vesta_persistence::{
    ConfigFileKey, ConfigFileRelease, ConfigFileReleaseKey, Page, ReleaseContentStore,
    ReleaseStore, ReleaseType, SimpleConfigFileRelease,
};

use super::flight::SingleFlight;
use super::metrics::CacheMetricsSink;
use crate::model::{ReleaseQuery, ReleaseVersion};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Visible state of a file's release type changed in the cache
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReleaseChangeEvent {
    pub file: ConfigFileKey,
    pub release_type: ReleaseType,
}

/// Files and groups touched by one delta batch
#[derive(Default)]
struct DeltaChanges {
    files: HashSet<ReleaseChangeEvent>,
    groups: HashSet<(String, String)>,
}

impl DeltaChanges {
    fn touch(&mut self, release: &SimpleConfigFileRelease) {
        self.files.insert(ReleaseChangeEvent {
            file: release.file(),
            release_type: release.release_type,
        });
        self.groups
            .insert((release.namespace.clone(), release.group.clone()));
    }
}

pub struct ReleaseCache {
    store: Arc<dyn ReleaseStore>,
    content: Arc<dyn ReleaseContentStore>,
    metrics: Arc<dyn CacheMetricsSink>,
    by_id: DashMap<u64, SimpleConfigFileRelease>,
    by_name: DashMap<String, u64>,
    active: DashMap<String, SimpleConfigFileRelease>,
    /// active key -> highest version ever promoted
    version_marks: DashMap<String, u64>,
    /// owner key -> group revision
    revisions: DashMap<String, String>,
    last_fetch_time: AtomicI64,
    loaded: AtomicBool,
    flight: SingleFlight,
    events: broadcast::Sender<ReleaseChangeEvent>,
}

impl ReleaseCache {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        content: Arc<dyn ReleaseContentStore>,
        metrics: Arc<dyn CacheMetricsSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            content,
            metrics,
            by_id: DashMap::new(),
            by_name: DashMap::new(),
            active: DashMap::new(),
            version_marks: DashMap::new(),
            revisions: DashMap::new(),
            last_fetch_time: AtomicI64::new(0),
            loaded: AtomicBool::new(false),
            flight: SingleFlight::default(),
            events,
        }
    }

    /// Stream of visible release changes, one event per changed file and type
    pub fn subscribe(&self) -> broadcast::Receiver<ReleaseChangeEvent> {
        self.events.subscribe()
    }

    /// Pull and apply everything changed since the last fetch.
    /// Concurrent callers share one in-flight fetch.
    pub async fn update(&self) -> Result<(), VestaError> {
        self.flight.run(|| self.refresh()).await.0
    }

    /// Like `update`, but runs a second fetch if the first one was shared,
    /// so every commit that finished before the call is observed
    pub async fn update_latest(&self) -> Result<(), VestaError> {
        self.flight.run_latest(|| self.refresh()).await
    }

    async fn refresh(&self) -> Result<(), VestaError> {
        let first_load = !self.loaded.load(Ordering::Acquire);
        let since = self.last_fetch_time.load(Ordering::Acquire);

        if first_load {
            // the offload store is derived state, rebuilt from the first full fetch
            self.content.clear().map_err(VestaError::persistence)?;
        }

        let rows = self
            .store
            .get_more_release_file(since, first_load)
            .await
            .map_err(VestaError::store)?;

        let Some(max_time) = rows.iter().map(|r| r.simple.modify_time).max() else {
            self.loaded.store(true, Ordering::Release);
            return Ok(());
        };
        let count = rows.len();

        self.apply_delta(rows)?;

        self.last_fetch_time.store(max_time, Ordering::Release);
        if first_load {
            info!(count, "release cache loaded");
        } else {
            debug!(count, last_fetch_time = max_time, "release cache refreshed");
        }
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// Apply a batch of release rows. Revisions are recomputed and change events
    /// published for whatever was applied, even if a later row fails.
    pub(crate) fn apply_delta(&self, mut rows: Vec<ConfigFileRelease>) -> Result<(), VestaError> {
        rows.sort_by_key(|r| (r.simple.modify_time, r.simple.id));

        let mut changes = DeltaChanges::default();
        let mut result = Ok(());
        for row in rows {
            if let Err(err) = self.apply_row(row, &mut changes) {
                result = Err(err);
                break;
            }
        }

        self.recompute_groups(&changes.groups);
        for event in changes.files {
            let _ = self.events.send(event);
        }
        result
    }

    fn apply_row(
        &self,
        row: ConfigFileRelease,
        changes: &mut DeltaChanges,
    ) -> Result<(), VestaError> {
        let ConfigFileRelease {
            simple: meta,
            content,
        } = row;

        let already_applied = match self.by_id.get(&meta.id) {
            Some(existing) if existing.modify_time > meta.modify_time => {
                debug!(release_id = meta.id, "skip stale release delta");
                return Ok(());
            }
            Some(existing) => *existing == meta,
            None => false,
        };
        // redelivered row; only an activation that failed to land is retried
        if already_applied && (!meta.active || self.is_active(&meta)) {
            return Ok(());
        }

        let release_key = meta.release_key();

        // same release name re-created under a new id
        let previous_id = self.by_name.get(&release_key).map(|id| *id);
        if let Some(previous_id) = previous_id.filter(|id| *id != meta.id) {
            if let Some((_, previous)) = self.by_id.remove(&previous_id) {
                let replaced_in_place = meta.valid
                    && meta.active
                    && previous.release_type == meta.release_type;
                if !replaced_in_place {
                    self.demote(&previous, changes)?;
                }
            }
        }

        if !meta.valid {
            self.demote(&meta, changes)?;
            self.by_name.remove_if(&release_key, |_, id| *id == meta.id);
            self.by_id.remove(&meta.id);
            debug!(
                release_key = %release_key,
                version = meta.version,
                "release removed from cache"
            );
            return Ok(());
        }

        self.by_id.insert(meta.id, meta.clone());
        self.by_name.insert(release_key, meta.id);

        if meta.active {
            self.promote(meta, &content, changes)
        } else {
            self.demote(&meta, changes)
        }
    }

    fn promote(
        &self,
        meta: SimpleConfigFileRelease,
        content: &str,
        changes: &mut DeltaChanges,
    ) -> Result<(), VestaError> {
        let active_key = meta.active_key();
        let mark = self.version_marks.get(&active_key).map_or(0, |v| *v);
        if meta.version < mark {
            debug!(
                active_key = %active_key,
                version = meta.version,
                current = mark,
                "ignore out-of-order activation"
            );
            return Ok(());
        }

        // content first, so an indexed active release always has a body
        self.content
            .put(&meta.owner_key(), &active_key, content)
            .map_err(VestaError::persistence)?;
        self.version_marks.insert(active_key.clone(), meta.version);
        changes.touch(&meta);
        debug!(
            active_key = %active_key,
            release_name = %meta.name,
            version = meta.version,
            "release activated in cache"
        );
        self.active.insert(active_key, meta);
        Ok(())
    }

    fn is_active(&self, meta: &SimpleConfigFileRelease) -> bool {
        self.active
            .get(&meta.active_key())
            .is_some_and(|current| current.id == meta.id)
    }

    /// Drop `meta` from the active index if it is the active release
    fn demote(
        &self,
        meta: &SimpleConfigFileRelease,
        changes: &mut DeltaChanges,
    ) -> Result<(), VestaError> {
        let active_key = meta.active_key();
        if self
            .active
            .remove_if(&active_key, |_, current| current.id == meta.id)
            .is_some()
        {
            self.content
                .delete(&meta.owner_key(), &active_key)
                .map_err(VestaError::persistence)?;
            changes.touch(meta);
            debug!(
                active_key = %active_key,
                release_name = %meta.name,
                "release deactivated in cache"
            );
        }
        Ok(())
    }

    /// Revision of a group: md5 over its sorted active release versions
    fn recompute_groups(&self, groups: &HashSet<(String, String)>) {
        for (namespace, group) in groups {
            let owner = owner_key(namespace, group);
            let prefix = format!("{}{}", owner, KEY_SEPARATOR);
            let mut entries: Vec<String> = self
                .active
                .iter()
                .filter(|e| e.key().starts_with(&prefix))
                .map(|e| format!("{}@{}:{}", e.file_name, e.release_type, e.version))
                .collect();
            entries.sort();

            self.metrics
                .group_release_count(namespace, group, entries.len());
            if entries.is_empty() {
                self.revisions.remove(&owner);
            } else {
                self.revisions.insert(owner, md5_hex(&entries.join(",")));
            }
        }
    }

    /// Metadata of the active release of a file and type
    pub fn get_active_meta(
        &self,
        file: &ConfigFileKey,
        release_type: ReleaseType,
    ) -> Option<SimpleConfigFileRelease> {
        self.active
            .get(&file.active_key(release_type))
            .map(|e| e.value().clone())
    }

    /// Active release with its content read back from the offload store
    pub fn get_active_release(
        &self,
        file: &ConfigFileKey,
        release_type: ReleaseType,
    ) -> Result<Option<ConfigFileRelease>, VestaError> {
        let Some(meta) = self.get_active_meta(file, release_type) else {
            return Ok(None);
        };
        let content = self
            .content
            .get(&meta.owner_key(), &meta.active_key())
            .map_err(VestaError::persistence)?;
        match content {
            Some(content) => Ok(Some(ConfigFileRelease {
                simple: meta,
                content,
            })),
            None => {
                warn!(
                    active_key = %meta.active_key(),
                    version = meta.version,
                    "active release content missing from offload store"
                );
                Err(VestaError::Persistence(format!(
                    "content of active release '{}' is missing",
                    meta.release_key()
                )))
            }
        }
    }

    pub fn get_release(&self, key: &ConfigFileReleaseKey) -> Option<SimpleConfigFileRelease> {
        let id = self.by_name.get(&key.release_key()).map(|id| *id)?;
        self.by_id.get(&id).map(|e| e.value().clone())
    }

    /// Filtered listing; the nested namespace/group/file view is materialized here
    pub fn query_releases(&self, query: &ReleaseQuery) -> Page<SimpleConfigFileRelease> {
        let mut items: Vec<SimpleConfigFileRelease> = self
            .by_id
            .iter()
            .map(|e| e.value().clone())
            .filter(|r| query.namespace.is_empty() || r.namespace == query.namespace)
            .filter(|r| query.group.is_empty() || r.group == query.group)
            .filter(|r| query.file_name.is_empty() || r.file_name == query.file_name)
            .filter(|r| query.release_name.is_empty() || r.name.contains(&query.release_name))
            .filter(|r| !query.only_active || r.active)
            .collect();
        items.sort_by(|a, b| {
            (&a.namespace, &a.group, &a.file_name, Reverse(a.version))
                .cmp(&(&b.namespace, &b.group, &b.file_name, Reverse(b.version)))
        });
        Page::paginate(items, query.offset, query.limit)
    }

    /// Every cached release of a file, newest version first
    pub fn get_release_versions(&self, file: &ConfigFileKey) -> Vec<ReleaseVersion> {
        let mut versions: Vec<ReleaseVersion> = self
            .by_id
            .iter()
            .filter(|e| {
                e.namespace == file.namespace && e.group == file.group && e.file_name == file.name
            })
            .map(|e| ReleaseVersion::from(e.value()))
            .collect();
        versions.sort_by_key(|v| Reverse(v.version));
        versions
    }

    pub fn group_revision(&self, namespace: &str, group: &str) -> Option<String> {
        self.revisions
            .get(&owner_key(namespace, group))
            .map(|e| e.value().clone())
    }

    pub fn release_count(&self) -> usize {
        self.by_id.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
