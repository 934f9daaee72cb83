//! Release lifecycle services

pub mod event;
pub mod release;

pub use event::{CacheRefreshSink, ReleaseEventSink, ReleaseNotice};
pub use release::{ReleaseService, ReleaseServiceConfig};
