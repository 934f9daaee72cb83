// Request shapes of the release engine surface

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use vesta_persistence::{ClientLabel, ConfigFileKey, ReleaseType};

use crate::gray::labels;

pub const DEFAULT_PAGE_LIMIT: usize = 100;

fn default_limit() -> usize {
    DEFAULT_PAGE_LIMIT
}

/// Publish the current content of an existing config file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigFileReleaseRequest {
    pub namespace: String,
    pub group: String,
    pub file_name: String,
    /// Synthesized when empty
    pub release_name: String,
    pub release_type: ReleaseType,
    pub release_description: String,
    pub beta_labels: Vec<ClientLabel>,
    pub operator: String,
}

impl ConfigFileReleaseRequest {
    pub fn file(&self) -> ConfigFileKey {
        ConfigFileKey::new(&self.namespace, &self.group, &self.file_name)
    }
}

/// Create-or-update a config file and publish it in one transaction
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigFilePublishInfo {
    pub namespace: String,
    pub group: String,
    pub file_name: String,
    pub content: String,
    pub format: String,
    pub comment: String,
    pub encrypt: bool,
    pub encrypt_algo: String,
    pub metadata: HashMap<String, String>,
    pub release_name: String,
    pub release_type: ReleaseType,
    pub release_description: String,
    pub beta_labels: Vec<ClientLabel>,
    /// Expected md5 of the stored content; empty skips the check
    pub md5: String,
    pub operator: String,
}

impl ConfigFilePublishInfo {
    pub fn file(&self) -> ConfigFileKey {
        ConfigFileKey::new(&self.namespace, &self.group, &self.file_name)
    }

    pub fn release_request(&self) -> ConfigFileReleaseRequest {
        ConfigFileReleaseRequest {
            namespace: self.namespace.clone(),
            group: self.group.clone(),
            file_name: self.file_name.clone(),
            release_name: self.release_name.clone(),
            release_type: self.release_type,
            release_description: self.release_description.clone(),
            beta_labels: self.beta_labels.clone(),
            operator: self.operator.clone(),
        }
    }
}

/// Client read of one config file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfigFileRequest {
    pub client_id: String,
    pub client_ip: String,
    pub namespace: String,
    pub group: String,
    pub file_name: String,
    /// Version the client already holds
    pub version: u64,
    /// Md5 of the content the client already holds; empty skips the check
    pub md5: String,
    /// Free-form labels matched against gray rules
    pub labels: HashMap<String, String>,
}

impl ClientConfigFileRequest {
    pub fn file(&self) -> ConfigFileKey {
        ConfigFileKey::new(&self.namespace, &self.group, &self.file_name)
    }

    pub fn effective_labels(&self) -> HashMap<String, String> {
        merge_client_labels(&self.labels, &self.client_id, &self.client_ip)
    }
}

/// One file of a watch interest set
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientWatchFile {
    pub namespace: String,
    pub group: String,
    pub file_name: String,
    /// Last version the client observed
    pub version: u64,
}

impl ClientWatchFile {
    pub fn file(&self) -> ConfigFileKey {
        ConfigFileKey::new(&self.namespace, &self.group, &self.file_name)
    }
}

/// Long-poll request
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WatchConfigFileRequest {
    pub client_id: String,
    pub client_ip: String,
    pub labels: HashMap<String, String>,
    pub watch_files: Vec<ClientWatchFile>,
    /// Falls back to the server default; capped by the server ceiling
    pub timeout_ms: Option<u64>,
}

impl WatchConfigFileRequest {
    pub fn effective_labels(&self) -> HashMap<String, String> {
        merge_client_labels(&self.labels, &self.client_id, &self.client_ip)
    }
}

/// Client identity is matched like any other label
fn merge_client_labels(
    labels: &HashMap<String, String>,
    client_id: &str,
    client_ip: &str,
) -> HashMap<String, String> {
    let mut merged = labels.clone();
    if !client_id.is_empty() {
        merged
            .entry(labels::CLIENT_ID.to_string())
            .or_insert_with(|| client_id.to_string());
    }
    if !client_ip.is_empty() {
        merged
            .entry(labels::CLIENT_IP.to_string())
            .or_insert_with(|| client_ip.to_string());
    }
    merged
}

/// Filtered, paginated release listing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReleaseQuery {
    pub namespace: String,
    /// Empty matches every group
    pub group: String,
    /// Empty matches every file
    pub file_name: String,
    /// Empty matches every release; otherwise a substring match
    pub release_name: String,
    pub only_active: bool,
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl Default for ReleaseQuery {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            group: String::new(),
            file_name: String::new(),
            release_name: String::new(),
            only_active: false,
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// Paginated history listing of one file
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HistoryQuery {
    pub namespace: String,
    pub group: String,
    pub file_name: String,
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            group: String::new(),
            file_name: String::new(),
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl HistoryQuery {
    pub fn file(&self) -> ConfigFileKey {
        ConfigFileKey::new(&self.namespace, &self.group, &self.file_name)
    }
}
