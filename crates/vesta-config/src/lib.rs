//! Vesta Config - Configuration release engine
//!
//! This crate provides:
//! - Gray release match rules (`gray`)
//! - The incremental release, gray-rule and group caches (`cache`)
//! - The release lifecycle manager (`service::release`)
//! - The long-poll watch center (`watch`)
//! - The `ConfigCenter` facade serving the request/response surface

pub mod cache;
pub mod center;
pub mod gray;
pub mod model;
pub mod service;
pub mod watch;

pub use cache::{CacheManager, CacheMetricsSink, ReleaseCacheConfig, ReleaseChangeEvent};
pub use center::ConfigCenter;
pub use gray::GrayMatchRule;
pub use service::{ReleaseService, ReleaseServiceConfig};
pub use watch::{WatchCenter, WatchCenterConfig};
