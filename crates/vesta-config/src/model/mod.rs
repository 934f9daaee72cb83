//! Data models for the release engine
//!
//! Storage rows come from `vesta-persistence`; request and response shapes
//! of the exposed surface live here.

pub mod request;
pub mod response;

pub use request::*;
pub use response::*;

pub use vesta_persistence::{
    ClientLabel, ConfigFile, ConfigFileGroup, ConfigFileKey, ConfigFileRelease,
    ConfigFileReleaseHistory, ConfigFileReleaseKey, GrayResource, MatchString, MatchType, Page,
    ReleaseOpType, ReleaseStatus, ReleaseType, SimpleConfigFileRelease,
};
