//! Release engine caches
//!
//! `CacheManager` owns the gray-rule, release and group caches and refreshes
//! them in that order, so an active gray release is never visible before its
//! rule. Refresh runs periodically and on demand.

mod flight;
pub mod gray;
pub mod group;
pub mod metrics;
pub mod release;

pub use gray::GrayCache;
pub use group::GroupCache;
pub use metrics::{CacheMetricsSink, GaugeMetricsSink};
pub use release::{ReleaseCache, ReleaseChangeEvent};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use vesta_common::VestaError;
use vesta_persistence::{
    ConfigFileKey, ConfigFileRelease, ReleaseContentStore, ReleaseStore, ReleaseType,
    SimpleConfigFileRelease,
};

/// Default background refresh interval in milliseconds
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 1000;

#[derive(Clone, Debug)]
pub struct ReleaseCacheConfig {
    pub refresh_interval: Duration,
}

impl Default for ReleaseCacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_millis(DEFAULT_REFRESH_INTERVAL_MS),
        }
    }
}

pub struct CacheManager {
    config: ReleaseCacheConfig,
    gray: GrayCache,
    releases: ReleaseCache,
    groups: GroupCache,
}

impl CacheManager {
    pub fn new(
        config: ReleaseCacheConfig,
        store: Arc<dyn ReleaseStore>,
        content: Arc<dyn ReleaseContentStore>,
        metrics: Arc<dyn CacheMetricsSink>,
    ) -> Self {
        Self {
            config,
            gray: GrayCache::new(store.clone()),
            releases: ReleaseCache::new(store.clone(), content, metrics),
            groups: GroupCache::new(store),
        }
    }

    pub fn releases(&self) -> &ReleaseCache {
        &self.releases
    }

    pub fn gray(&self) -> &GrayCache {
        &self.gray
    }

    pub fn groups(&self) -> &GroupCache {
        &self.groups
    }

    /// Metadata of the release a client sees: the active gray release if the
    /// client hits its rule, the active normal release otherwise
    pub fn resolve_meta(
        &self,
        file: &ConfigFileKey,
        client_labels: &HashMap<String, String>,
    ) -> Option<SimpleConfigFileRelease> {
        if let Some(gray) = self.releases.get_active_meta(file, ReleaseType::Gray) {
            if self.gray.hit(&file.gray_resource_name(), client_labels) {
                return Some(gray);
            }
        }
        self.releases.get_active_meta(file, ReleaseType::Normal)
    }

    /// Like `resolve_meta`, with the content read from the offload store
    pub fn resolve_release(
        &self,
        file: &ConfigFileKey,
        client_labels: &HashMap<String, String>,
    ) -> Result<Option<ConfigFileRelease>, VestaError> {
        let Some(meta) = self.resolve_meta(file, client_labels) else {
            return Ok(None);
        };
        match self.releases.get_active_release(file, meta.release_type)? {
            Some(release) => Ok(Some(release)),
            // gray stopped between the two reads
            None if meta.release_type == ReleaseType::Gray => {
                self.releases.get_active_release(file, ReleaseType::Normal)
            }
            None => Ok(None),
        }
    }

    /// Refresh every cache, sharing any refresh already in flight
    pub async fn update(&self) -> Result<(), VestaError> {
        self.gray.update().await?;
        self.releases.update().await?;
        self.groups.update().await
    }

    /// Refresh every cache with fetches that started after the call, so every
    /// commit finished before it is visible afterwards
    pub async fn update_latest(&self) -> Result<(), VestaError> {
        self.gray.update_latest().await?;
        self.releases.update_latest().await?;
        self.groups.update_latest().await
    }

    /// Spawn the periodic refresh loop; it stops when `shutdown` fires
    pub fn start(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let manager = self;
        let interval = manager.config.refresh_interval;

        tokio::spawn(async move {
            info!(?interval, "starting release cache refresh task");
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = manager.update().await {
                            warn!(error = %e, "release cache refresh failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("release cache refresh task shutting down");
                        break;
                    }
                }
            }
        })
    }
}
