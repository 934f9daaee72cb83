//! Release lifecycle manager
//!
//! Publish, upsert-and-release, rollback, stop-gray and delete. Each operation
//! runs in one store transaction that locks the owning config file first; a
//! failed step rolls the whole transaction back, appends a `fail` history
//! record and emits no notification.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinSet;
use tracing::{info, warn};

use vesta_common::{
    DEFAULT_OPERATOR, VestaError, is_valid_file_name, is_valid_name, md5_hex,
};
use vesta_persistence::{
    ConfigFile, ConfigFileKey, ConfigFileRelease, ConfigFileReleaseHistory, ConfigFileReleaseKey,
    GrayResource, ReleaseOpType, ReleaseStatus, ReleaseStore, ReleaseTx, ReleaseType,
    SimpleConfigFileRelease,
};

use super::event::{ReleaseEventSink, ReleaseNotice};
use crate::gray::{serialize_beta_labels, validate_beta_labels};
use crate::model::{
    ApiResponse, BatchWriteResponse, ConfigFilePublishInfo, ConfigFileReleaseRequest,
};

/// Default upper bound of a config file body: 10 MiB
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 10 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ReleaseServiceConfig {
    pub max_content_length: usize,
}

impl Default for ReleaseServiceConfig {
    fn default() -> Self {
        Self {
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }
}

/// What to write into the `fail` history record of an aborted operation
struct FailureContext {
    key: ConfigFileReleaseKey,
    op_type: ReleaseOpType,
    operator: String,
}

impl FailureContext {
    fn new(key: ConfigFileReleaseKey, op_type: ReleaseOpType, operator: &str) -> Self {
        Self {
            key,
            op_type,
            operator: operator_or_default(operator).to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ReleaseService {
    config: ReleaseServiceConfig,
    store: Arc<dyn ReleaseStore>,
    events: Arc<dyn ReleaseEventSink>,
    seq: Arc<AtomicU64>,
}

impl ReleaseService {
    pub fn new(
        config: ReleaseServiceConfig,
        store: Arc<dyn ReleaseStore>,
        events: Arc<dyn ReleaseEventSink>,
    ) -> Self {
        Self {
            config,
            store,
            events,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish the current content of an existing config file
    pub async fn publish(
        &self,
        req: &ConfigFileReleaseRequest,
    ) -> Result<SimpleConfigFileRelease, VestaError> {
        let file = req.file();
        check_file_key(&file)?;
        check_release_request(req)?;

        let mut tx = self.start_tx().await?;
        let result = self.publish_in_tx(tx.as_mut(), req).await;
        let failure = FailureContext::new(
            ConfigFileReleaseKey::new(&file, &req.release_name, req.release_type),
            ReleaseOpType::Create,
            &req.operator,
        );
        let (release, op_type) = self.finish(tx, result, failure).await?;
        self.released(&release, op_type);
        Ok(release.simple)
    }

    /// Create or update the config file, then publish it in the same transaction.
    /// A non-empty `md5` must match the stored content.
    pub async fn upsert_and_release(
        &self,
        info: &ConfigFilePublishInfo,
    ) -> Result<SimpleConfigFileRelease, VestaError> {
        let file = info.file();
        check_file_key(&file)?;
        self.check_content(&info.content)?;
        let req = info.release_request();
        check_release_request(&req)?;

        let mut tx = self.start_tx().await?;
        let result = self
            .upsert_and_release_in_tx(tx.as_mut(), info, &req)
            .await;
        let failure = FailureContext::new(
            ConfigFileReleaseKey::new(&file, &info.release_name, info.release_type),
            ReleaseOpType::Create,
            &info.operator,
        );
        let (release, op_type) = self.finish(tx, result, failure).await?;
        self.released(&release, op_type);
        Ok(release.simple)
    }

    /// Re-activate a previous release
    pub async fn rollback(
        &self,
        key: &ConfigFileReleaseKey,
    ) -> Result<SimpleConfigFileRelease, VestaError> {
        check_release_key(key)?;

        let mut tx = self.start_tx().await?;
        let result = self.rollback_in_tx(tx.as_mut(), key).await;
        let failure = FailureContext::new(key.clone(), ReleaseOpType::Rollback, DEFAULT_OPERATOR);
        let release = self.finish(tx, result, failure).await?;
        self.released(&release, ReleaseOpType::Rollback);
        Ok(release.simple)
    }

    /// Stop the active gray release of a file; `None` if there was none
    pub async fn stop_gray(
        &self,
        file: &ConfigFileKey,
    ) -> Result<Option<SimpleConfigFileRelease>, VestaError> {
        check_file_key(file)?;

        let mut tx = self.start_tx().await?;
        let result = self.stop_gray_in_tx(tx.as_mut(), file).await;
        let failure = FailureContext::new(
            ConfigFileReleaseKey::new(file, "", ReleaseType::Gray),
            ReleaseOpType::CancelGray,
            DEFAULT_OPERATOR,
        );
        let stopped = self.finish(tx, result, failure).await?;
        if let Some(release) = &stopped {
            self.released(release, ReleaseOpType::CancelGray);
        }
        Ok(stopped.map(|r| r.simple))
    }

    /// Delete a release; `None` if it did not exist
    pub async fn delete(
        &self,
        key: &ConfigFileReleaseKey,
    ) -> Result<Option<SimpleConfigFileRelease>, VestaError> {
        check_release_key(key)?;

        let mut tx = self.start_tx().await?;
        let result = self.delete_in_tx(tx.as_mut(), key).await;
        let failure = FailureContext::new(key.clone(), ReleaseOpType::Delete, DEFAULT_OPERATOR);
        let deleted = self.finish(tx, result, failure).await?;
        if let Some(release) = &deleted {
            self.released(release, ReleaseOpType::Delete);
        }
        Ok(deleted.map(|r| r.simple))
    }

    /// Create or update a config file without publishing it
    pub async fn upsert_config_file(&self, file: ConfigFile) -> Result<ConfigFile, VestaError> {
        let key = file.key();
        check_file_key(&key)?;
        self.check_content(&file.content)?;

        let mut tx = self.start_tx().await?;
        let result = upsert_file_in_tx(tx.as_mut(), file).await;
        match result {
            Ok(stored) => {
                tx.commit().await?;
                info!(
                    namespace = %key.namespace,
                    group = %key.group,
                    file_name = %key.name,
                    "config file saved"
                );
                Ok(stored)
            }
            Err(err) => {
                if let Err(e) = tx.rollback().await {
                    warn!(error = %e, "transaction rollback failed");
                }
                Err(err)
            }
        }
    }

    pub async fn batch_rollback(&self, keys: Vec<ConfigFileReleaseKey>) -> BatchWriteResponse {
        self.fan_out(keys, |service, key| async move {
            service.rollback(&key).await.map(|_| ())
        })
        .await
    }

    pub async fn batch_stop_gray(&self, files: Vec<ConfigFileKey>) -> BatchWriteResponse {
        self.fan_out(files, |service, file| async move {
            service.stop_gray(&file).await.map(|_| ())
        })
        .await
    }

    pub async fn batch_delete(&self, keys: Vec<ConfigFileReleaseKey>) -> BatchWriteResponse {
        self.fan_out(keys, |service, key| async move {
            service.delete(&key).await.map(|_| ())
        })
        .await
    }

    /// One task and one transaction per item; a failing item never aborts its siblings
    async fn fan_out<T, F, Fut>(&self, items: Vec<T>, op: F) -> BatchWriteResponse
    where
        T: Send + 'static,
        F: Fn(ReleaseService, T) -> Fut + Copy + Send + 'static,
        Fut: Future<Output = Result<(), VestaError>> + Send + 'static,
    {
        let mut responses: Vec<ApiResponse<()>> = (0..items.len())
            .map(|_| {
                ApiResponse::from_error(&VestaError::Internal(
                    "batch item did not complete".to_string(),
                ))
            })
            .collect();

        let mut tasks = JoinSet::new();
        for (idx, item) in items.into_iter().enumerate() {
            let service = self.clone();
            tasks.spawn(async move { (idx, op(service, item).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => responses[idx] = ApiResponse::from_result(result),
                Err(e) => warn!(error = %e, "batch release task failed"),
            }
        }
        BatchWriteResponse::collect(responses)
    }

    async fn publish_in_tx(
        &self,
        tx: &mut dyn ReleaseTx,
        req: &ConfigFileReleaseRequest,
    ) -> Result<(ConfigFileRelease, ReleaseOpType), VestaError> {
        let file_key = req.file();
        let Some(file) = tx.lock_config_file(&file_key).await? else {
            return Err(VestaError::NotFoundResource(format!(
                "config file '{}' not found",
                file_key
            )));
        };

        if let Some(gray) = tx.get_config_file_beta_release(&file_key).await? {
            return Err(VestaError::DataConflict(format!(
                "gray release '{}' of config file '{}' is in progress",
                gray.simple.name, file_key
            )));
        }

        let operator = operator_or_default(&req.operator);
        let name = if req.release_name.is_empty() {
            self.next_release_name(&file.name)
        } else {
            req.release_name.clone()
        };
        let key = ConfigFileReleaseKey::new(&file_key, &name, req.release_type);
        let snapshot = snapshot_release(&file, &key, req, operator);

        let (release, op_type) = match tx.get_config_file_release(&key).await? {
            Some(existing) if existing.simple.release_type != req.release_type => {
                return Err(VestaError::DataConflict(format!(
                    "release '{}' already exists as a {} release",
                    key.release_key(),
                    existing.simple.release_type
                )));
            }
            // same snapshot: re-stamp the existing row
            Some(existing)
                if existing.simple.md5 == snapshot.simple.md5
                    && existing.simple.beta_labels == snapshot.simple.beta_labels =>
            {
                (
                    tx.active_config_file_release(&key).await?,
                    ReleaseOpType::Update,
                )
            }
            Some(_) => (
                tx.create_config_file_release(snapshot).await?,
                ReleaseOpType::Update,
            ),
            None => (
                tx.create_config_file_release(snapshot).await?,
                ReleaseOpType::Create,
            ),
        };

        if release.simple.release_type == ReleaseType::Gray {
            create_gray_resource(tx, &release, operator).await?;
        }
        tx.create_release_history(release_history(&release, op_type, operator))
            .await?;
        Ok((release, op_type))
    }

    async fn upsert_and_release_in_tx(
        &self,
        tx: &mut dyn ReleaseTx,
        info: &ConfigFilePublishInfo,
        req: &ConfigFileReleaseRequest,
    ) -> Result<(ConfigFileRelease, ReleaseOpType), VestaError> {
        let file_key = info.file();
        let existing = tx.lock_config_file(&file_key).await?;

        if !info.md5.is_empty() {
            let current = existing.as_ref().map(|f| md5_hex(&f.content));
            if current.as_deref() != Some(info.md5.as_str()) {
                return Err(VestaError::DataConflict(format!(
                    "config file '{}' was modified concurrently: md5 mismatch",
                    file_key
                )));
            }
        }

        let operator = operator_or_default(&info.operator);
        let file = ConfigFile {
            namespace: info.namespace.clone(),
            group: info.group.clone(),
            name: info.file_name.clone(),
            content: info.content.clone(),
            format: info.format.clone(),
            comment: info.comment.clone(),
            encrypt: info.encrypt,
            encrypt_algo: info.encrypt_algo.clone(),
            metadata: info.metadata.clone(),
            created_by: operator.to_string(),
            modified_by: operator.to_string(),
            ..Default::default()
        };
        upsert_file_in_tx(&mut *tx, file).await?;
        self.publish_in_tx(tx, req).await
    }

    async fn rollback_in_tx(
        &self,
        tx: &mut dyn ReleaseTx,
        key: &ConfigFileReleaseKey,
    ) -> Result<ConfigFileRelease, VestaError> {
        let file_key = key.file();
        if tx.lock_config_file(&file_key).await?.is_none() {
            return Err(VestaError::NotFoundResource(format!(
                "config file '{}' not found",
                file_key
            )));
        }
        if tx.get_config_file_release(key).await?.is_none() {
            return Err(VestaError::NotFoundResource(format!(
                "config file release '{}' not found",
                key.release_key()
            )));
        }

        let release = tx.active_config_file_release(key).await?;
        if release.simple.release_type == ReleaseType::Gray {
            create_gray_resource(tx, &release, DEFAULT_OPERATOR).await?;
        }
        tx.create_release_history(release_history(
            &release,
            ReleaseOpType::Rollback,
            DEFAULT_OPERATOR,
        ))
        .await?;
        Ok(release)
    }

    async fn stop_gray_in_tx(
        &self,
        tx: &mut dyn ReleaseTx,
        file: &ConfigFileKey,
    ) -> Result<Option<ConfigFileRelease>, VestaError> {
        tx.lock_config_file(file).await?;
        let Some(mut gray) = tx.get_config_file_beta_release(file).await? else {
            return Ok(None);
        };

        tx.clean_gray_resource(file).await?;
        tx.inactive_config_file_release(&gray.simple.key()).await?;
        gray.simple.active = false;
        tx.create_release_history(release_history(
            &gray,
            ReleaseOpType::CancelGray,
            DEFAULT_OPERATOR,
        ))
        .await?;
        Ok(Some(gray))
    }

    async fn delete_in_tx(
        &self,
        tx: &mut dyn ReleaseTx,
        key: &ConfigFileReleaseKey,
    ) -> Result<Option<ConfigFileRelease>, VestaError> {
        let file_key = key.file();
        tx.lock_config_file(&file_key).await?;
        let Some(target) = tx.get_config_file_release(key).await? else {
            return Ok(None);
        };

        // bump the version once more so watchers observe the removal
        let was_active = target.simple.active;
        let mut deleted = if was_active {
            tx.active_config_file_release(key).await?
        } else {
            target
        };
        tx.delete_config_file_release(key).await?;
        if was_active && deleted.simple.release_type == ReleaseType::Gray {
            tx.clean_gray_resource(&file_key).await?;
        }
        deleted.simple.valid = false;
        tx.create_release_history(release_history(
            &deleted,
            ReleaseOpType::Delete,
            DEFAULT_OPERATOR,
        ))
        .await?;
        Ok(Some(deleted))
    }

    async fn start_tx(&self) -> Result<Box<dyn ReleaseTx>, VestaError> {
        self.store.start_tx().await.map_err(VestaError::store)
    }

    /// Commit on success; otherwise roll back and append a `fail` history record
    async fn finish<T>(
        &self,
        tx: Box<dyn ReleaseTx>,
        result: Result<T, VestaError>,
        failure: FailureContext,
    ) -> Result<T, VestaError> {
        let err = match result {
            Ok(value) => match tx.commit().await {
                Ok(()) => return Ok(value),
                Err(e) => VestaError::from(e),
            },
            Err(err) => {
                if let Err(e) = tx.rollback().await {
                    warn!(error = %e, "transaction rollback failed");
                }
                err
            }
        };
        self.record_failure(failure, &err).await;
        Err(err)
    }

    async fn record_failure(&self, failure: FailureContext, err: &VestaError) {
        let key = failure.key;
        warn!(
            namespace = %key.namespace,
            group = %key.group,
            file_name = %key.file_name,
            release_name = %key.name,
            op = failure.op_type.as_str(),
            error = %err,
            "release operation failed"
        );
        let history = ConfigFileReleaseHistory {
            namespace: key.namespace,
            group: key.group,
            file_name: key.file_name,
            release_name: key.name,
            release_type: key.release_type,
            op_type: failure.op_type,
            status: ReleaseStatus::Fail,
            reason: err.to_string(),
            created_by: failure.operator,
            ..Default::default()
        };
        if let Err(e) = self.store.create_release_history(history).await {
            warn!(error = %e, "failed to record release failure history");
        }
    }

    fn released(&self, release: &ConfigFileRelease, op_type: ReleaseOpType) {
        let simple = &release.simple;
        info!(
            namespace = %simple.namespace,
            group = %simple.group,
            file_name = %simple.file_name,
            release_name = %simple.name,
            release_type = %simple.release_type,
            version = simple.version,
            op = op_type.as_str(),
            "config file release changed"
        );
        self.events.release_changed(ReleaseNotice {
            release: simple.clone(),
            op_type,
        });
    }

    /// `fileName-<unixSeconds>-<sequence>`
    fn next_release_name(&self, file_name: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}-{}", file_name, chrono::Utc::now().timestamp(), seq)
    }

    fn check_content(&self, content: &str) -> Result<(), VestaError> {
        if content.len() > self.config.max_content_length {
            return Err(VestaError::InvalidParameter(format!(
                "content length {} exceeds the limit of {} bytes",
                content.len(),
                self.config.max_content_length
            )));
        }
        Ok(())
    }
}

async fn upsert_file_in_tx(
    tx: &mut dyn ReleaseTx,
    file: ConfigFile,
) -> Result<ConfigFile, VestaError> {
    tx.lock_config_file(&file.key()).await?;
    Ok(tx.upsert_config_file(file).await?)
}

async fn create_gray_resource(
    tx: &mut dyn ReleaseTx,
    release: &ConfigFileRelease,
    operator: &str,
) -> Result<(), VestaError> {
    let file = release.simple.file();
    let resource = GrayResource {
        name: file.gray_resource_name(),
        match_rule: serialize_beta_labels(&release.simple.beta_labels)?,
        created_by: operator.to_string(),
        ..Default::default()
    };
    Ok(tx.create_gray_resource(&file, resource).await?)
}

fn snapshot_release(
    file: &ConfigFile,
    key: &ConfigFileReleaseKey,
    req: &ConfigFileReleaseRequest,
    operator: &str,
) -> ConfigFileRelease {
    let beta_labels = match key.release_type {
        ReleaseType::Gray => req.beta_labels.clone(),
        ReleaseType::Normal => Vec::new(),
    };
    ConfigFileRelease {
        simple: SimpleConfigFileRelease {
            namespace: key.namespace.clone(),
            group: key.group.clone(),
            file_name: key.file_name.clone(),
            name: key.name.clone(),
            release_type: key.release_type,
            md5: md5_hex(&file.content),
            format: file.format.clone(),
            comment: file.comment.clone(),
            release_description: req.release_description.clone(),
            metadata: file.metadata.clone(),
            beta_labels,
            created_by: operator.to_string(),
            modified_by: operator.to_string(),
            ..Default::default()
        },
        content: file.content.clone(),
    }
}

fn release_history(
    release: &ConfigFileRelease,
    op_type: ReleaseOpType,
    operator: &str,
) -> ConfigFileReleaseHistory {
    let simple = &release.simple;
    ConfigFileReleaseHistory {
        namespace: simple.namespace.clone(),
        group: simple.group.clone(),
        file_name: simple.file_name.clone(),
        release_name: simple.name.clone(),
        release_type: simple.release_type,
        content: release.content.clone(),
        format: simple.format.clone(),
        md5: simple.md5.clone(),
        version: simple.version,
        metadata: simple.metadata.clone(),
        beta_labels: simple.beta_labels.clone(),
        op_type,
        status: ReleaseStatus::Success,
        release_description: simple.release_description.clone(),
        created_by: operator.to_string(),
        ..Default::default()
    }
}

fn operator_or_default(operator: &str) -> &str {
    if operator.is_empty() {
        DEFAULT_OPERATOR
    } else {
        operator
    }
}

pub(crate) fn check_file_key(file: &ConfigFileKey) -> Result<(), VestaError> {
    if !is_valid_name(&file.namespace) {
        return Err(VestaError::InvalidParameter(format!(
            "invalid namespace '{}'",
            file.namespace
        )));
    }
    if !is_valid_name(&file.group) {
        return Err(VestaError::InvalidParameter(format!(
            "invalid group '{}'",
            file.group
        )));
    }
    if !is_valid_file_name(&file.name) {
        return Err(VestaError::InvalidParameter(format!(
            "invalid file name '{}'",
            file.name
        )));
    }
    Ok(())
}

/// Release names follow the file-name rules, since synthesized names embed the file name
fn check_release_key(key: &ConfigFileReleaseKey) -> Result<(), VestaError> {
    check_file_key(&key.file())?;
    if !is_valid_file_name(&key.name) {
        return Err(VestaError::InvalidParameter(format!(
            "invalid release name '{}'",
            key.name
        )));
    }
    Ok(())
}

fn check_release_request(req: &ConfigFileReleaseRequest) -> Result<(), VestaError> {
    if !req.release_name.is_empty() && !is_valid_file_name(&req.release_name) {
        return Err(VestaError::InvalidParameter(format!(
            "invalid release name '{}'",
            req.release_name
        )));
    }
    if req.release_type == ReleaseType::Gray {
        validate_beta_labels(&req.beta_labels)?;
    }
    Ok(())
}
