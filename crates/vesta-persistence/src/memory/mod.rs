// In-memory transactional release store
// Standalone backend: per-file row locks, staged writes, atomic commit

mod content;

pub use content::MemoryContentStore;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use vesta_common::VestaError;

use crate::model::{
    ConfigFile, ConfigFileGroup, ConfigFileKey, ConfigFileRelease, ConfigFileReleaseHistory,
    ConfigFileReleaseKey, GrayResource, Page, ReleaseType,
};
use crate::traits::{ReleaseStore, ReleaseTx};

#[derive(Default)]
struct StoreState {
    /// file key -> file row
    files: HashMap<String, ConfigFile>,
    /// file key -> release name -> release row (tombstones included)
    releases: HashMap<String, BTreeMap<String, ConfigFileRelease>>,
    /// file key -> highest version ever handed out
    max_versions: HashMap<String, u64>,
    /// gray resource name -> resource
    gray_resources: HashMap<String, GrayResource>,
    histories: Vec<ConfigFileReleaseHistory>,
    /// owner key -> group
    groups: HashMap<String, ConfigFileGroup>,
}

struct StoreInner {
    state: RwLock<StoreState>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    clock: AtomicI64,
    file_seq: AtomicU64,
    release_seq: AtomicU64,
    history_seq: AtomicU64,
    group_seq: AtomicU64,
}

impl StoreInner {
    /// Strictly increasing millisecond timestamp
    fn tick(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let mut prev = self.clock.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .clock
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    fn file_lock(&self, file_key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(file_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Standalone release store keeping every row in process memory
///
/// Transactions lock a file on first touch and stage its rows; `commit`
/// publishes every staged row under one write lock with one modify time.
#[derive(Clone)]
pub struct MemoryReleaseStore {
    inner: Arc<StoreInner>,
}

impl Default for MemoryReleaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryReleaseStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(StoreState::default()),
                locks: DashMap::new(),
                clock: AtomicI64::new(0),
                file_seq: AtomicU64::new(0),
                release_seq: AtomicU64::new(0),
                history_seq: AtomicU64::new(0),
                group_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Number of release rows for a file, tombstones included
    pub fn release_row_count(&self, file: &ConfigFileKey) -> usize {
        self.inner
            .state
            .read()
            .releases
            .get(&file.file_key())
            .map_or(0, |rows| rows.len())
    }
}

#[async_trait]
impl ReleaseStore for MemoryReleaseStore {
    async fn start_tx(&self) -> anyhow::Result<Box<dyn ReleaseTx>> {
        Ok(Box::new(MemoryTx {
            inner: self.inner.clone(),
            locks: FileLocks {
                inner: self.inner.clone(),
                guards: HashMap::new(),
            },
            files: HashMap::new(),
            gray: HashMap::new(),
            histories: Vec::new(),
        }))
    }

    async fn get_config_file(&self, key: &ConfigFileKey) -> anyhow::Result<Option<ConfigFile>> {
        Ok(self.inner.state.read().files.get(&key.file_key()).cloned())
    }

    async fn get_more_release_file(
        &self,
        since: i64,
        first_load: bool,
    ) -> anyhow::Result<Vec<ConfigFileRelease>> {
        let state = self.inner.state.read();
        let mut rows: Vec<ConfigFileRelease> = state
            .releases
            .values()
            .flat_map(|rows| rows.values())
            .filter(|r| r.simple.modify_time > since)
            .filter(|r| !first_load || r.simple.valid)
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.simple.modify_time, r.simple.id));
        Ok(rows)
    }

    async fn get_more_gray_resource(
        &self,
        since: i64,
        first_load: bool,
    ) -> anyhow::Result<Vec<GrayResource>> {
        let state = self.inner.state.read();
        let mut rows: Vec<GrayResource> = state
            .gray_resources
            .values()
            .filter(|r| r.modify_time > since)
            .filter(|r| !first_load || r.valid)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.modify_time);
        Ok(rows)
    }

    async fn get_more_config_group(
        &self,
        since: i64,
        first_load: bool,
    ) -> anyhow::Result<Vec<ConfigFileGroup>> {
        let state = self.inner.state.read();
        let mut rows: Vec<ConfigFileGroup> = state
            .groups
            .values()
            .filter(|g| g.modify_time > since)
            .filter(|g| !first_load || g.valid)
            .cloned()
            .collect();
        rows.sort_by_key(|g| g.modify_time);
        Ok(rows)
    }

    async fn create_config_file_group(
        &self,
        group: ConfigFileGroup,
    ) -> anyhow::Result<ConfigFileGroup> {
        let mut state = self.inner.state.write();
        let now = self.inner.tick();
        let stored = match state.groups.get(&group.owner_key()) {
            Some(existing) => ConfigFileGroup {
                id: existing.id,
                create_time: existing.create_time,
                created_by: existing.created_by.clone(),
                valid: true,
                modify_time: now,
                ..group
            },
            None => ConfigFileGroup {
                id: self.inner.group_seq.fetch_add(1, Ordering::SeqCst) + 1,
                valid: true,
                create_time: now,
                modify_time: now,
                ..group
            },
        };
        state.groups.insert(stored.owner_key(), stored.clone());
        Ok(stored)
    }

    async fn create_release_history(
        &self,
        mut history: ConfigFileReleaseHistory,
    ) -> anyhow::Result<()> {
        let mut state = self.inner.state.write();
        history.id = self.inner.history_seq.fetch_add(1, Ordering::SeqCst) + 1;
        if history.create_time == 0 {
            history.create_time = self.inner.tick();
        }
        state.histories.push(history);
        Ok(())
    }

    async fn query_release_histories(
        &self,
        file: &ConfigFileKey,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Page<ConfigFileReleaseHistory>> {
        let state = self.inner.state.read();
        let items: Vec<ConfigFileReleaseHistory> = state
            .histories
            .iter()
            .rev()
            .filter(|h| {
                h.namespace == file.namespace && h.group == file.group && h.file_name == file.name
            })
            .cloned()
            .collect();
        Ok(Page::paginate(items, offset, limit))
    }
}

/// Rows of one file copied into a transaction
struct StagedFile {
    file: Option<ConfigFile>,
    file_dirty: bool,
    releases: BTreeMap<String, ConfigFileRelease>,
    dirty: HashSet<String>,
    max_version: u64,
}

impl StagedFile {
    fn deactivate(&mut self, release_type: ReleaseType, except: &str) {
        for (name, row) in self.releases.iter_mut() {
            if name != except
                && row.simple.valid
                && row.simple.active
                && row.simple.release_type == release_type
            {
                row.simple.active = false;
                self.dirty.insert(name.clone());
            }
        }
    }

    fn valid_release_mut(&mut self, name: &str) -> Option<&mut ConfigFileRelease> {
        self.releases.get_mut(name).filter(|r| r.simple.valid)
    }
}

/// Row locks held by one transaction. Released on drop; a lock nobody else
/// holds or waits for is removed from the store.
struct FileLocks {
    inner: Arc<StoreInner>,
    guards: HashMap<String, OwnedMutexGuard<()>>,
}

impl Drop for FileLocks {
    fn drop(&mut self) {
        for (file_key, guard) in self.guards.drain() {
            drop(guard);
            self.inner
                .locks
                .remove_if(&file_key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

struct MemoryTx {
    inner: Arc<StoreInner>,
    locks: FileLocks,
    files: HashMap<String, StagedFile>,
    gray: HashMap<String, GrayResource>,
    histories: Vec<ConfigFileReleaseHistory>,
}

impl MemoryTx {
    /// Lock the file on first touch and snapshot its committed rows
    async fn stage(&mut self, key: &ConfigFileKey) -> anyhow::Result<&mut StagedFile> {
        let file_key = key.file_key();
        if !self.files.contains_key(&file_key) {
            let guard = self.inner.file_lock(&file_key).lock_owned().await;
            let staged = {
                let state = self.inner.state.read();
                StagedFile {
                    file: state.files.get(&file_key).cloned(),
                    file_dirty: false,
                    releases: state.releases.get(&file_key).cloned().unwrap_or_default(),
                    dirty: HashSet::new(),
                    max_version: state.max_versions.get(&file_key).copied().unwrap_or(0),
                }
            };
            debug!(file_key = %file_key, "config file locked");
            self.locks.guards.insert(file_key.clone(), guard);
            self.files.insert(file_key.clone(), staged);
        }
        self.files
            .get_mut(&file_key)
            .ok_or_else(|| anyhow::anyhow!("staged file '{}' disappeared", file_key))
    }

    fn current_gray(&self, name: &str) -> Option<GrayResource> {
        self.gray
            .get(name)
            .cloned()
            .or_else(|| self.inner.state.read().gray_resources.get(name).cloned())
    }
}

fn release_not_found(key: &ConfigFileReleaseKey) -> anyhow::Error {
    anyhow::Error::new(VestaError::NotFoundResource(format!(
        "config file release '{}' not found",
        key.release_key()
    )))
}

#[async_trait]
impl ReleaseTx for MemoryTx {
    async fn lock_config_file(&mut self, key: &ConfigFileKey) -> anyhow::Result<Option<ConfigFile>> {
        Ok(self.stage(key).await?.file.clone())
    }

    async fn get_config_file(&mut self, key: &ConfigFileKey) -> anyhow::Result<Option<ConfigFile>> {
        Ok(self.stage(key).await?.file.clone())
    }

    async fn upsert_config_file(&mut self, file: ConfigFile) -> anyhow::Result<ConfigFile> {
        let next_id = self.inner.file_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let staged = self.stage(&file.key()).await?;
        let stored = match staged.file.as_ref() {
            Some(existing) => ConfigFile {
                id: existing.id,
                created_by: existing.created_by.clone(),
                create_time: existing.create_time,
                ..file
            },
            None => ConfigFile {
                id: next_id,
                ..file
            },
        };
        staged.file = Some(stored.clone());
        staged.file_dirty = true;
        Ok(stored)
    }

    async fn get_config_file_release(
        &mut self,
        key: &ConfigFileReleaseKey,
    ) -> anyhow::Result<Option<ConfigFileRelease>> {
        let staged = self.stage(&key.file()).await?;
        Ok(staged.valid_release_mut(&key.name).map(|r| r.clone()))
    }

    async fn get_config_file_active_release(
        &mut self,
        file: &ConfigFileKey,
        release_type: ReleaseType,
    ) -> anyhow::Result<Option<ConfigFileRelease>> {
        let staged = self.stage(file).await?;
        Ok(staged
            .releases
            .values()
            .find(|r| r.simple.valid && r.simple.active && r.simple.release_type == release_type)
            .cloned())
    }

    async fn create_config_file_release(
        &mut self,
        mut release: ConfigFileRelease,
    ) -> anyhow::Result<ConfigFileRelease> {
        let id = self.inner.release_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let staged = self.stage(&release.simple.file()).await?;
        let name = release.simple.name.clone();

        staged.deactivate(release.simple.release_type, &name);
        staged.max_version += 1;

        release.simple.id = id;
        release.simple.version = staged.max_version;
        release.simple.active = true;
        release.simple.valid = true;

        staged.releases.insert(name.clone(), release.clone());
        staged.dirty.insert(name);
        Ok(release)
    }

    async fn active_config_file_release(
        &mut self,
        key: &ConfigFileReleaseKey,
    ) -> anyhow::Result<ConfigFileRelease> {
        let staged = self.stage(&key.file()).await?;
        let release_type = match staged.valid_release_mut(&key.name) {
            Some(row) => row.simple.release_type,
            None => return Err(release_not_found(key)),
        };

        staged.deactivate(release_type, &key.name);
        staged.max_version += 1;
        let version = staged.max_version;

        let row = staged
            .valid_release_mut(&key.name)
            .ok_or_else(|| release_not_found(key))?;
        row.simple.version = version;
        row.simple.active = true;
        let activated = row.clone();
        staged.dirty.insert(key.name.clone());
        Ok(activated)
    }

    async fn inactive_config_file_release(
        &mut self,
        key: &ConfigFileReleaseKey,
    ) -> anyhow::Result<()> {
        let staged = self.stage(&key.file()).await?;
        if let Some(row) = staged.valid_release_mut(&key.name) {
            if row.simple.active {
                row.simple.active = false;
                staged.dirty.insert(key.name.clone());
            }
        }
        Ok(())
    }

    async fn delete_config_file_release(
        &mut self,
        key: &ConfigFileReleaseKey,
    ) -> anyhow::Result<()> {
        let staged = self.stage(&key.file()).await?;
        if let Some(row) = staged.valid_release_mut(&key.name) {
            row.simple.valid = false;
            staged.dirty.insert(key.name.clone());
        }
        Ok(())
    }

    async fn create_gray_resource(
        &mut self,
        file: &ConfigFileKey,
        mut resource: GrayResource,
    ) -> anyhow::Result<()> {
        self.stage(file).await?;
        resource.valid = true;
        self.gray.insert(resource.name.clone(), resource);
        Ok(())
    }

    async fn clean_gray_resource(&mut self, file: &ConfigFileKey) -> anyhow::Result<()> {
        self.stage(file).await?;
        let name = file.gray_resource_name();
        if let Some(mut resource) = self.current_gray(&name).filter(|r| r.valid) {
            resource.valid = false;
            self.gray.insert(name, resource);
        }
        Ok(())
    }

    async fn create_release_history(
        &mut self,
        history: ConfigFileReleaseHistory,
    ) -> anyhow::Result<()> {
        self.histories.push(history);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        let MemoryTx {
            inner,
            locks,
            files,
            gray,
            histories,
        } = *self;

        {
            let mut state = inner.state.write();
            let now = inner.tick();

            for (file_key, staged) in files {
                if staged.file_dirty {
                    if let Some(mut file) = staged.file {
                        if file.create_time == 0 {
                            file.create_time = now;
                        }
                        file.modify_time = now;
                        state.files.insert(file_key.clone(), file);
                    }
                }

                if !staged.dirty.is_empty() {
                    let rows = state.releases.entry(file_key.clone()).or_default();
                    for name in staged.dirty {
                        if let Some(mut row) = staged.releases.get(&name).cloned() {
                            if row.simple.create_time == 0 {
                                row.simple.create_time = now;
                            }
                            row.simple.modify_time = now;
                            rows.insert(name, row);
                        }
                    }
                }

                let max_version = state.max_versions.entry(file_key).or_default();
                *max_version = (*max_version).max(staged.max_version);
            }

            for (name, mut resource) in gray {
                if resource.create_time == 0 {
                    resource.create_time = now;
                }
                resource.modify_time = now;
                state.gray_resources.insert(name, resource);
            }

            for mut history in histories {
                history.id = inner.history_seq.fetch_add(1, Ordering::SeqCst) + 1;
                history.create_time = now;
                state.histories.push(history);
            }
        }

        drop(locks);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        // Staged rows are discarded and the row locks released on drop
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::SimpleConfigFileRelease;

    fn file_key() -> ConfigFileKey {
        ConfigFileKey::new("ns", "g", "app.yaml")
    }

    fn release(name: &str, release_type: ReleaseType, content: &str) -> ConfigFileRelease {
        ConfigFileRelease {
            simple: SimpleConfigFileRelease {
                namespace: "ns".to_string(),
                group: "g".to_string(),
                file_name: "app.yaml".to_string(),
                name: name.to_string(),
                release_type,
                ..Default::default()
            },
            content: content.to_string(),
        }
    }

    async fn seed_file(store: &MemoryReleaseStore) {
        let mut tx = store.start_tx().await.unwrap();
        tx.upsert_config_file(ConfigFile {
            namespace: "ns".to_string(),
            group: "g".to_string(),
            name: "app.yaml".to_string(),
            content: "a=1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_makes_rows_visible() {
        let store = MemoryReleaseStore::new();
        seed_file(&store).await;

        let mut tx = store.start_tx().await.unwrap();
        let created = tx
            .create_config_file_release(release("r1", ReleaseType::Normal, "a=1"))
            .await
            .unwrap();
        assert_eq!(created.simple.version, 1);
        assert!(store.get_more_release_file(0, true).await.unwrap().is_empty());

        tx.commit().await.unwrap();
        let rows = store.get_more_release_file(0, true).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].simple.active);
        assert!(rows[0].simple.modify_time > 0);

        // nothing committed since the last row seen
        let since = rows[0].simple.modify_time;
        assert!(store.get_more_release_file(since, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_discards_rows() {
        let store = MemoryReleaseStore::new();
        seed_file(&store).await;

        let mut tx = store.start_tx().await.unwrap();
        tx.create_config_file_release(release("r1", ReleaseType::Normal, "a=1"))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(store.get_more_release_file(0, false).await.unwrap().is_empty());
        // the lock is released, a new transaction can proceed
        let mut tx = store.start_tx().await.unwrap();
        assert!(tx.lock_config_file(&file_key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_deactivates_previous_of_same_type() {
        let store = MemoryReleaseStore::new();
        seed_file(&store).await;

        let mut tx = store.start_tx().await.unwrap();
        tx.create_config_file_release(release("r1", ReleaseType::Normal, "a=1"))
            .await
            .unwrap();
        tx.create_config_file_release(release("g1", ReleaseType::Gray, "a=2"))
            .await
            .unwrap();
        tx.create_config_file_release(release("r2", ReleaseType::Normal, "a=3"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let rows = store.get_more_release_file(0, true).await.unwrap();
        let active: Vec<&str> = rows
            .iter()
            .filter(|r| r.simple.active)
            .map(|r| r.simple.name.as_str())
            .collect();
        assert_eq!(active.len(), 2);
        assert!(active.contains(&"g1"));
        assert!(active.contains(&"r2"));
    }

    #[tokio::test]
    async fn test_version_survives_delete_and_recreate() {
        let store = MemoryReleaseStore::new();
        seed_file(&store).await;

        let mut tx = store.start_tx().await.unwrap();
        let key = release("r1", ReleaseType::Normal, "").simple.key();
        tx.create_config_file_release(release("r1", ReleaseType::Normal, "x"))
            .await
            .unwrap();
        tx.active_config_file_release(&key).await.unwrap();
        tx.delete_config_file_release(&key).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.start_tx().await.unwrap();
        assert!(tx.get_config_file_release(&key).await.unwrap().is_none());
        let recreated = tx
            .create_config_file_release(release("r1", ReleaseType::Normal, "y"))
            .await
            .unwrap();
        assert_eq!(recreated.simple.version, 3);
        tx.commit().await.unwrap();
        assert_eq!(store.release_row_count(&file_key()), 1);
    }

    #[tokio::test]
    async fn test_file_lock_serializes_transactions() {
        let store = MemoryReleaseStore::new();
        seed_file(&store).await;

        let mut first = store.start_tx().await.unwrap();
        first.lock_config_file(&file_key()).await.unwrap();

        let second_store = store.clone();
        let waiter = tokio::spawn(async move {
            let mut tx = second_store.start_tx().await.unwrap();
            tx.lock_config_file(&file_key()).await.unwrap();
            tx.commit().await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        first.commit().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(store.inner.locks.is_empty());
    }

    #[tokio::test]
    async fn test_file_locks_are_pruned() {
        let store = MemoryReleaseStore::new();
        seed_file(&store).await;

        let mut tx = store.start_tx().await.unwrap();
        let missing = ConfigFileKey::new("ns", "g", "missing.yaml");
        assert!(tx.lock_config_file(&missing).await.unwrap().is_none());
        assert_eq!(store.inner.locks.len(), 1);
        tx.rollback().await.unwrap();
        assert!(store.inner.locks.is_empty());

        let mut tx = store.start_tx().await.unwrap();
        tx.lock_config_file(&file_key()).await.unwrap();
        drop(tx);
        assert!(store.inner.locks.is_empty());
    }

    #[tokio::test]
    async fn test_active_missing_release_is_not_found() {
        let store = MemoryReleaseStore::new();
        let mut tx = store.start_tx().await.unwrap();
        let err = tx
            .active_config_file_release(&release("nope", ReleaseType::Normal, "").simple.key())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VestaError>(),
            Some(VestaError::NotFoundResource(_))
        ));
    }

    #[tokio::test]
    async fn test_gray_resource_clean() {
        let store = MemoryReleaseStore::new();
        let mut tx = store.start_tx().await.unwrap();
        tx.create_gray_resource(
            &file_key(),
            GrayResource {
                name: file_key().gray_resource_name(),
                match_rule: "[]".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.get_more_gray_resource(0, true).await.unwrap().len(), 1);

        let mut tx = store.start_tx().await.unwrap();
        tx.clean_gray_resource(&file_key()).await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.get_more_gray_resource(0, true).await.unwrap().is_empty());
        let all = store.get_more_gray_resource(0, false).await.unwrap();
        assert!(!all[0].valid);
    }
}
