//! Response types of the release engine surface
//!
//! Every operation answers with a structured code and message; batch writes
//! carry one response per item plus an aggregate code.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use vesta_common::VestaError;
use vesta_common::error::{DATA_NO_CHANGE, ErrorCode, SUCCESS};
use vesta_persistence::{ConfigFileGroup, ConfigFileRelease, ReleaseType, SimpleConfigFileRelease};

/// Generic result wrapper
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn new(code: ErrorCode<'_>, message: String, data: Option<T>) -> Self {
        ApiResponse {
            code: code.code,
            message,
            data,
        }
    }

    pub fn success(data: T) -> Self {
        Self::new(SUCCESS, SUCCESS.message.to_string(), Some(data))
    }

    /// The caller already holds the latest data
    pub fn no_change() -> Self {
        Self::new(DATA_NO_CHANGE, DATA_NO_CHANGE.message.to_string(), None)
    }

    pub fn from_error(err: &VestaError) -> Self {
        Self::new(err.code(), err.to_string(), None)
    }

    pub fn from_result(result: Result<T, VestaError>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(err) => Self::from_error(&err),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == SUCCESS.code
    }

    pub fn is_no_change(&self) -> bool {
        self.code == DATA_NO_CHANGE.code
    }
}

impl ApiResponse<()> {
    pub fn ok() -> Self {
        Self::new(SUCCESS, SUCCESS.message.to_string(), None)
    }
}

/// Per-item results of a batch write
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchWriteResponse {
    pub code: i32,
    pub message: String,
    pub responses: Vec<ApiResponse<()>>,
}

impl BatchWriteResponse {
    /// Aggregate code is the first failing item's code, or success
    pub fn collect(responses: Vec<ApiResponse<()>>) -> Self {
        let (code, message) = responses
            .iter()
            .find(|r| !r.is_success())
            .map(|r| (r.code, r.message.clone()))
            .unwrap_or_else(|| (SUCCESS.code, SUCCESS.message.to_string()));
        BatchWriteResponse {
            code,
            message,
            responses,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == SUCCESS.code
    }
}

/// Release content as served to a client
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfigFile {
    pub namespace: String,
    pub group: String,
    pub file_name: String,
    pub release_name: String,
    pub release_type: ReleaseType,
    pub version: u64,
    pub md5: String,
    pub content: String,
    pub format: String,
    pub metadata: HashMap<String, String>,
}

impl From<ConfigFileRelease> for ClientConfigFile {
    fn from(release: ConfigFileRelease) -> Self {
        let simple = release.simple;
        ClientConfigFile {
            namespace: simple.namespace,
            group: simple.group,
            file_name: simple.file_name,
            release_name: simple.name,
            release_type: simple.release_type,
            version: simple.version,
            md5: simple.md5,
            content: release.content,
            format: simple.format,
            metadata: simple.metadata,
        }
    }
}

/// Lightweight entry of a release version listing
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseVersion {
    pub id: u64,
    pub name: String,
    pub release_type: ReleaseType,
    pub version: u64,
    pub active: bool,
    pub modify_time: i64,
}

impl From<&SimpleConfigFileRelease> for ReleaseVersion {
    fn from(release: &SimpleConfigFileRelease) -> Self {
        ReleaseVersion {
            id: release.id,
            name: release.name.clone(),
            release_type: release.release_type,
            version: release.version,
            active: release.active,
            modify_time: release.modify_time,
        }
    }
}

/// Group with its aggregate release revision
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFileGroupInfo {
    #[serde(flatten)]
    pub group: ConfigFileGroup,
    /// Empty while the group has no active release
    pub revision: String,
}

/// A file whose visible version moved past the client's snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedFile {
    pub namespace: String,
    pub group: String,
    pub file_name: String,
    pub release_type: ReleaseType,
    pub version: u64,
    pub md5: String,
}

/// Watcher of a file as listed by introspection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWatcher {
    pub client_id: String,
    pub version: u64,
}

/// File watched by a client as listed by introspection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedFile {
    pub namespace: String,
    pub group: String,
    pub file_name: String,
    pub version: u64,
}
