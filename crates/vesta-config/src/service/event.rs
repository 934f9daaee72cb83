// Release change notifications emitted after a lifecycle transaction commits

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use vesta_persistence::{ReleaseOpType, SimpleConfigFileRelease};

use crate::cache::CacheManager;

/// Lightweight notification of a committed lifecycle transition
#[derive(Clone, Debug)]
pub struct ReleaseNotice {
    pub release: SimpleConfigFileRelease,
    pub op_type: ReleaseOpType,
}

/// Receives notices after commit. Implementations must not block the caller.
pub trait ReleaseEventSink: Send + Sync {
    fn release_changed(&self, notice: ReleaseNotice);
}

/// Forwards notices to a task that refreshes the caches right away
#[derive(Clone)]
pub struct CacheRefreshSink {
    sender: mpsc::UnboundedSender<ReleaseNotice>,
}

impl CacheRefreshSink {
    /// Spawn the refresh task; it ends once every sink clone is dropped
    pub fn spawn(cache: Arc<CacheManager>) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ReleaseNotice>();

        let handle = tokio::spawn(async move {
            while let Some(notice) = receiver.recv().await {
                let mut pending = 1usize;
                // coalesce a burst of notices into one refresh
                while receiver.try_recv().is_ok() {
                    pending += 1;
                }
                debug!(
                    namespace = %notice.release.namespace,
                    group = %notice.release.group,
                    file_name = %notice.release.file_name,
                    op = notice.op_type.as_str(),
                    pending,
                    "refreshing caches after release change"
                );
                if let Err(e) = cache.update_latest().await {
                    warn!(error = %e, "cache refresh after release change failed");
                }
            }
        });

        (Self { sender }, handle)
    }
}

impl ReleaseEventSink for CacheRefreshSink {
    fn release_changed(&self, notice: ReleaseNotice) {
        if self.sender.send(notice).is_err() {
            warn!("release change dropped: cache refresh task is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use vesta_persistence::{
        ConfigFile, ConfigFileGroup, ConfigFileKey, ConfigFileRelease, ConfigFileReleaseHistory,
        GrayResource, MemoryContentStore, MemoryReleaseStore, Page, ReleaseStore, ReleaseTx,
        ReleaseType,
    };

    use super::*;
    use crate::cache::{CacheMetricsSink, ReleaseCacheConfig};

    struct NoopSink;

    impl CacheMetricsSink for NoopSink {
        fn group_release_count(&self, _: &str, _: &str, _: usize) {}
    }

    /// Release reads take a while to come back, leaving a window in which a
    /// commit lands behind a fetch already in flight
    struct SlowStore {
        inner: MemoryReleaseStore,
        delay: Duration,
    }

    #[async_trait]
    impl ReleaseStore for SlowStore {
        async fn start_tx(&self) -> anyhow::Result<Box<dyn ReleaseTx>> {
            self.inner.start_tx().await
        }

        async fn get_config_file(&self, key: &ConfigFileKey) -> anyhow::Result<Option<ConfigFile>> {
            self.inner.get_config_file(key).await
        }

        async fn get_more_release_file(
            &self,
            since: i64,
            first_load: bool,
        ) -> anyhow::Result<Vec<ConfigFileRelease>> {
            let rows = self.inner.get_more_release_file(since, first_load).await?;
            tokio::time::sleep(self.delay).await;
            Ok(rows)
        }

        async fn get_more_gray_resource(
            &self,
            since: i64,
            first_load: bool,
        ) -> anyhow::Result<Vec<GrayResource>> {
            self.inner.get_more_gray_resource(since, first_load).await
        }

        async fn get_more_config_group(
            &self,
            since: i64,
            first_load: bool,
        ) -> anyhow::Result<Vec<ConfigFileGroup>> {
            self.inner.get_more_config_group(since, first_load).await
        }

        async fn create_config_file_group(
            &self,
            group: ConfigFileGroup,
        ) -> anyhow::Result<ConfigFileGroup> {
            self.inner.create_config_file_group(group).await
        }

        async fn create_release_history(
            &self,
            history: ConfigFileReleaseHistory,
        ) -> anyhow::Result<()> {
            self.inner.create_release_history(history).await
        }

        async fn query_release_histories(
            &self,
            file: &ConfigFileKey,
            offset: usize,
            limit: usize,
        ) -> anyhow::Result<Page<ConfigFileReleaseHistory>> {
            self.inner.query_release_histories(file, offset, limit).await
        }
    }

    async fn commit_release(store: &MemoryReleaseStore) -> ConfigFileRelease {
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
        let created = tx
            .create_config_file_release(ConfigFileRelease {
                simple: SimpleConfigFileRelease {
                    namespace: "ns".to_string(),
                    group: "g".to_string(),
                    file_name: "app.yaml".to_string(),
                    name: "r1".to_string(),
                    ..Default::default()
                },
                content: "a=1".to_string(),
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        created
    }

    #[tokio::test(start_paused = true)]
    async fn test_notice_is_not_absorbed_by_earlier_refresh() {
        let store = Arc::new(SlowStore {
            inner: MemoryReleaseStore::new(),
            delay: Duration::from_millis(200),
        });
        let cache = Arc::new(CacheManager::new(
            ReleaseCacheConfig::default(),
            store.clone(),
            Arc::new(MemoryContentStore::new()),
            Arc::new(NoopSink),
        ));
        cache.update().await.unwrap();
        let (sink, task) = CacheRefreshSink::spawn(cache.clone());

        // a refresh that reads the store before the commit below
        let earlier = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.update().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let release = commit_release(&store.inner).await;
        sink.release_changed(ReleaseNotice {
            release: release.simple,
            op_type: ReleaseOpType::Create,
        });
        earlier.await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let file = ConfigFileKey::new("ns", "g", "app.yaml");
        let active = cache
            .releases()
            .get_active_meta(&file, ReleaseType::Normal)
            .unwrap();
        assert_eq!(active.name, "r1");

        drop(sink);
        task.await.unwrap();
    }
}
