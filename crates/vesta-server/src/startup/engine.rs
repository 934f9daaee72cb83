//! Wiring of the release engine components

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use vesta_config::cache::{CacheMetricsSink, GaugeMetricsSink};
use vesta_config::service::CacheRefreshSink;
use vesta_config::{
    CacheManager, ConfigCenter, ReleaseCacheConfig, ReleaseService, ReleaseServiceConfig,
    WatchCenter, WatchCenterConfig,
};
use vesta_persistence::{MemoryReleaseStore, ReleaseContentStore, ReleaseStore, RocksContentStore};

use super::ShutdownSignal;
use crate::model::config::Configuration;

#[derive(Clone, Debug, Default)]
pub struct EngineSettings {
    pub cache: ReleaseCacheConfig,
    pub watch: WatchCenterConfig,
    pub release: ReleaseServiceConfig,
}

impl From<&Configuration> for EngineSettings {
    fn from(configuration: &Configuration) -> Self {
        Self {
            cache: configuration.cache_config(),
            watch: configuration.watch_config(),
            release: configuration.release_service_config(),
        }
    }
}

/// Running engine: the facade plus its background tasks
pub struct Engine {
    pub center: ConfigCenter,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Assemble the engine over the given stores, load the caches once and
    /// start the refresh loop and the watch dispatcher
    pub async fn start(
        store: Arc<dyn ReleaseStore>,
        content: Arc<dyn ReleaseContentStore>,
        metrics: Arc<dyn CacheMetricsSink>,
        settings: EngineSettings,
        shutdown: &ShutdownSignal,
    ) -> anyhow::Result<Self> {
        let cache = Arc::new(CacheManager::new(
            settings.cache,
            store.clone(),
            content,
            metrics,
        ));
        cache.update().await?;
        info!(
            releases = cache.releases().release_count(),
            active = cache.releases().active_count(),
            "release cache loaded"
        );

        let (refresh_sink, refresh_task) = CacheRefreshSink::spawn(cache.clone());
        let releases = ReleaseService::new(settings.release, store.clone(), Arc::new(refresh_sink));
        let watch = WatchCenter::new(settings.watch, cache.clone());
        let watch_task = watch.start(cache.releases().subscribe(), shutdown.subscribe());
        let refresh_loop = cache.clone().start(shutdown.subscribe());

        Ok(Engine {
            center: ConfigCenter::new(store, cache, releases, watch),
            tasks: vec![refresh_task, watch_task, refresh_loop],
        })
    }

    /// Production wiring: in-memory release store, RocksDB content offload
    pub async fn from_configuration(
        configuration: &Configuration,
        shutdown: &ShutdownSignal,
    ) -> anyhow::Result<Self> {
        let content_path = configuration.content_path();
        let content = Arc::new(RocksContentStore::open(&content_path)?);
        Self::start(
            Arc::new(MemoryReleaseStore::new()),
            content,
            Arc::new(GaugeMetricsSink::new()),
            EngineSettings::from(configuration),
            shutdown,
        )
        .await
    }
}
