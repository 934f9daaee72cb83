//! Request/response surface of the release engine
//!
//! Every write answers with a code and message, batch writes with one response
//! per item. Reads degrade to "no data" or "no change" instead of failing when
//! a release is simply absent.

use std::sync::Arc;

use tracing::{debug, warn};

use vesta_common::error::NOT_FOUND_RESOURCE;
use vesta_common::{DEFAULT_OPERATOR, VestaError, is_valid_name};
use vesta_persistence::{
    ConfigFile, ConfigFileGroup, ConfigFileKey, ConfigFileReleaseHistory, ConfigFileReleaseKey,
    Page, ReleaseStore, SimpleConfigFileRelease,
};

use crate::cache::CacheManager;
use crate::model::{
    ApiResponse, BatchWriteResponse, ChangedFile, ClientConfigFile, ClientConfigFileRequest,
    ConfigFileGroupInfo, ConfigFilePublishInfo, ConfigFileReleaseRequest, FileWatcher,
    HistoryQuery, ReleaseQuery, ReleaseVersion, WatchConfigFileRequest, WatchedFile,
};
use crate::service::ReleaseService;
use crate::service::release::check_file_key;
use crate::watch::WatchCenter;

#[derive(Clone)]
pub struct ConfigCenter {
    store: Arc<dyn ReleaseStore>,
    cache: Arc<CacheManager>,
    releases: ReleaseService,
    watch: WatchCenter,
}

impl ConfigCenter {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        cache: Arc<CacheManager>,
        releases: ReleaseService,
        watch: WatchCenter,
    ) -> Self {
        Self {
            store,
            cache,
            releases,
            watch,
        }
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn watch(&self) -> &WatchCenter {
        &self.watch
    }

    pub async fn publish_config_file(
        &self,
        req: &ConfigFileReleaseRequest,
    ) -> ApiResponse<SimpleConfigFileRelease> {
        ApiResponse::from_result(self.releases.publish(req).await)
    }

    pub async fn upsert_and_release_config_file(
        &self,
        info: &ConfigFilePublishInfo,
    ) -> ApiResponse<SimpleConfigFileRelease> {
        ApiResponse::from_result(self.releases.upsert_and_release(info).await)
    }

    pub async fn rollback_config_file_releases(
        &self,
        keys: Vec<ConfigFileReleaseKey>,
    ) -> BatchWriteResponse {
        self.releases.batch_rollback(keys).await
    }

    pub async fn stop_gray_config_file_releases(
        &self,
        files: Vec<ConfigFileKey>,
    ) -> BatchWriteResponse {
        self.releases.batch_stop_gray(files).await
    }

    pub async fn delete_config_file_releases(
        &self,
        keys: Vec<ConfigFileReleaseKey>,
    ) -> BatchWriteResponse {
        self.releases.batch_delete(keys).await
    }

    /// Save a config file without publishing it
    pub async fn create_config_file(&self, file: ConfigFile) -> ApiResponse<ConfigFile> {
        ApiResponse::from_result(self.releases.upsert_config_file(file).await)
    }

    pub async fn create_config_file_group(
        &self,
        group: ConfigFileGroup,
    ) -> ApiResponse<ConfigFileGroup> {
        ApiResponse::from_result(self.create_group(group).await)
    }

    async fn create_group(
        &self,
        mut group: ConfigFileGroup,
    ) -> Result<ConfigFileGroup, VestaError> {
        if !is_valid_name(&group.namespace) {
            return Err(VestaError::InvalidParameter(format!(
                "invalid namespace '{}'",
                group.namespace
            )));
        }
        if !is_valid_name(&group.name) {
            return Err(VestaError::InvalidParameter(format!(
                "invalid group '{}'",
                group.name
            )));
        }
        if group.created_by.is_empty() {
            group.created_by = DEFAULT_OPERATOR.to_string();
        }

        let stored = self
            .store
            .create_config_file_group(group)
            .await
            .map_err(VestaError::store)?;
        if let Err(e) = self.cache.groups().update().await {
            warn!(error = %e, "group cache refresh after create failed");
        }
        Ok(stored)
    }

    /// Groups of a namespace with their release revision
    pub fn get_config_file_groups(&self, namespace: &str) -> ApiResponse<Vec<ConfigFileGroupInfo>> {
        let groups = self
            .cache
            .groups()
            .list(namespace)
            .into_iter()
            .map(|group| {
                let revision = self
                    .cache
                    .releases()
                    .group_revision(&group.namespace, &group.name)
                    .unwrap_or_default();
                ConfigFileGroupInfo { group, revision }
            })
            .collect();
        ApiResponse::success(groups)
    }

    /// Client read of the release visible to its labels
    pub fn get_config_file_with_cache(
        &self,
        req: &ClientConfigFileRequest,
    ) -> ApiResponse<ClientConfigFile> {
        let file = req.file();
        if let Err(e) = check_file_key(&file) {
            return ApiResponse::from_error(&e);
        }

        let release = match self.cache.resolve_release(&file, &req.effective_labels()) {
            Ok(Some(release)) => release,
            Ok(None) => {
                return ApiResponse::new(
                    NOT_FOUND_RESOURCE,
                    format!("no active release of config file '{}'", file),
                    None,
                );
            }
            Err(e) => return ApiResponse::from_error(&e),
        };

        let md5_matches = req.md5.is_empty() || req.md5 == release.simple.md5;
        if req.version >= release.simple.version && md5_matches {
            return ApiResponse::no_change();
        }
        debug!(
            client_id = %req.client_id,
            file = %file,
            version = release.simple.version,
            "serving config file"
        );
        ApiResponse::success(ClientConfigFile::from(release))
    }

    /// Long-poll until a watched file changes for this client or the timeout elapses
    pub async fn long_pull_watch_file(
        &self,
        req: &WatchConfigFileRequest,
    ) -> ApiResponse<Vec<ChangedFile>> {
        for watch_file in &req.watch_files {
            if let Err(e) = check_file_key(&watch_file.file()) {
                return ApiResponse::from_error(&e);
            }
        }
        match self.watch.long_pull(req).await {
            Ok(changed) if changed.is_empty() => ApiResponse::no_change(),
            Ok(changed) => ApiResponse::success(changed),
            Err(e) => ApiResponse::from_error(&e),
        }
    }

    /// Administrative listing; refreshes the cache past any in-flight fetch first
    pub async fn get_config_file_releases(
        &self,
        query: &ReleaseQuery,
    ) -> ApiResponse<Page<SimpleConfigFileRelease>> {
        if query.namespace.is_empty() {
            return ApiResponse::from_error(&VestaError::InvalidParameter(
                "namespace is required".to_string(),
            ));
        }
        self.refresh_latest().await;
        ApiResponse::success(self.cache.releases().query_releases(query))
    }

    pub async fn get_config_file_release_versions(
        &self,
        file: &ConfigFileKey,
    ) -> ApiResponse<Vec<ReleaseVersion>> {
        if let Err(e) = check_file_key(file) {
            return ApiResponse::from_error(&e);
        }
        self.refresh_latest().await;
        ApiResponse::success(self.cache.releases().get_release_versions(file))
    }

    pub async fn get_config_file_release_histories(
        &self,
        query: &HistoryQuery,
    ) -> ApiResponse<Page<ConfigFileReleaseHistory>> {
        let file = query.file();
        if let Err(e) = check_file_key(&file) {
            return ApiResponse::from_error(&e);
        }
        let result = self
            .store
            .query_release_histories(&file, query.offset, query.limit)
            .await
            .map_err(VestaError::store);
        ApiResponse::from_result(result)
    }

    pub fn get_config_subscribers(&self, file: &ConfigFileKey) -> ApiResponse<Vec<FileWatcher>> {
        ApiResponse::success(self.watch.get_config_subscribers(file))
    }

    pub fn get_client_subscribers(&self, client_id: &str) -> ApiResponse<Vec<WatchedFile>> {
        ApiResponse::success(self.watch.get_client_subscribers(client_id))
    }

    async fn refresh_latest(&self) {
        // a stale listing beats no listing
        if let Err(e) = self.cache.update_latest().await {
            warn!(error = %e, "release cache refresh before query failed");
        }
    }
}
