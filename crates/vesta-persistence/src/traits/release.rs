//! Release store traits
//!
//! Every lifecycle operation runs inside one `ReleaseTx`. A transaction that is
//! dropped without `commit` is rolled back.

use async_trait::async_trait;

use crate::model::{
    ConfigFile, ConfigFileGroup, ConfigFileKey, ConfigFileRelease, ConfigFileReleaseHistory,
    ConfigFileReleaseKey, GrayResource, Page, ReleaseType,
};

/// Transactional release store
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Open a new transaction
    async fn start_tx(&self) -> anyhow::Result<Box<dyn ReleaseTx>>;

    /// Read a committed config file
    async fn get_config_file(&self, key: &ConfigFileKey) -> anyhow::Result<Option<ConfigFile>>;

    /// Releases modified after `since` (milliseconds), in modify-time order.
    /// On first load tombstoned rows are skipped.
    async fn get_more_release_file(
        &self,
        since: i64,
        first_load: bool,
    ) -> anyhow::Result<Vec<ConfigFileRelease>>;

    /// Gray resources modified after `since`
    async fn get_more_gray_resource(
        &self,
        since: i64,
        first_load: bool,
    ) -> anyhow::Result<Vec<GrayResource>>;

    /// Config groups modified after `since`
    async fn get_more_config_group(
        &self,
        since: i64,
        first_load: bool,
    ) -> anyhow::Result<Vec<ConfigFileGroup>>;

    /// Create or update a config group
    async fn create_config_file_group(
        &self,
        group: ConfigFileGroup,
    ) -> anyhow::Result<ConfigFileGroup>;

    /// Append a history record outside any transaction
    async fn create_release_history(&self, history: ConfigFileReleaseHistory)
    -> anyhow::Result<()>;

    /// History of a file, newest first
    async fn query_release_histories(
        &self,
        file: &ConfigFileKey,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Page<ConfigFileReleaseHistory>>;
}

/// Operations available inside a release store transaction
#[async_trait]
pub trait ReleaseTx: Send {
    /// Take the row lock of a config file and return the file if it exists.
    /// The lock is held until the transaction ends, whether or not the file exists.
    async fn lock_config_file(&mut self, key: &ConfigFileKey) -> anyhow::Result<Option<ConfigFile>>;

    async fn get_config_file(&mut self, key: &ConfigFileKey) -> anyhow::Result<Option<ConfigFile>>;

    /// Create or update a config file row; returns the stored row
    async fn upsert_config_file(&mut self, file: ConfigFile) -> anyhow::Result<ConfigFile>;

    /// Valid (non-tombstoned) release with the given name
    async fn get_config_file_release(
        &mut self,
        key: &ConfigFileReleaseKey,
    ) -> anyhow::Result<Option<ConfigFileRelease>>;

    /// Currently active release of the given type
    async fn get_config_file_active_release(
        &mut self,
        file: &ConfigFileKey,
        release_type: ReleaseType,
    ) -> anyhow::Result<Option<ConfigFileRelease>>;

    /// Currently active gray release
    async fn get_config_file_beta_release(
        &mut self,
        file: &ConfigFileKey,
    ) -> anyhow::Result<Option<ConfigFileRelease>> {
        self.get_config_file_active_release(file, ReleaseType::Gray)
            .await
    }

    /// Insert a release as the active release of its type. Any row with the same
    /// name (tombstoned or not) is replaced, the previously active release of the
    /// same type is deactivated and the file version is bumped.
    async fn create_config_file_release(
        &mut self,
        release: ConfigFileRelease,
    ) -> anyhow::Result<ConfigFileRelease>;

    /// Re-activate an existing release under a freshly bumped version,
    /// deactivating whatever is active for the same type
    async fn active_config_file_release(
        &mut self,
        key: &ConfigFileReleaseKey,
    ) -> anyhow::Result<ConfigFileRelease>;

    async fn inactive_config_file_release(&mut self, key: &ConfigFileReleaseKey)
    -> anyhow::Result<()>;

    /// Tombstone a release row
    async fn delete_config_file_release(&mut self, key: &ConfigFileReleaseKey)
    -> anyhow::Result<()>;

    async fn create_gray_resource(
        &mut self,
        file: &ConfigFileKey,
        resource: GrayResource,
    ) -> anyhow::Result<()>;

    /// Tombstone the gray resource bound to the file
    async fn clean_gray_resource(&mut self, file: &ConfigFileKey) -> anyhow::Result<()>;

    async fn create_release_history(
        &mut self,
        history: ConfigFileReleaseHistory,
    ) -> anyhow::Result<()>;

    async fn commit(self: Box<Self>) -> anyhow::Result<()>;

    async fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}
