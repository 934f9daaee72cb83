//! Domain model types for the persistence abstraction layer
//!
//! These are the rows owned by the release store. The cache and the lifecycle
//! manager work on the same types, so derived keys live here too.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use vesta_common::KEY_SEPARATOR;

/// `namespace@group`
pub fn owner_key(namespace: &str, group: &str) -> String {
    [namespace, group].join(KEY_SEPARATOR)
}

/// `namespace@group@fileName`
pub fn file_key(namespace: &str, group: &str, file_name: &str) -> String {
    [namespace, group, file_name].join(KEY_SEPARATOR)
}

/// `namespace@group@fileName@releaseType`
pub fn active_key(namespace: &str, group: &str, file_name: &str, release_type: ReleaseType) -> String {
    [namespace, group, file_name, release_type.as_str()].join(KEY_SEPARATOR)
}

/// `namespace@group@fileName@releaseName`
pub fn release_key(namespace: &str, group: &str, file_name: &str, release_name: &str) -> String {
    [namespace, group, file_name, release_name].join(KEY_SEPARATOR)
}

/// Release variant of a config file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseType {
    #[default]
    Normal,
    Gray,
}

impl ReleaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseType::Normal => "normal",
            ReleaseType::Gray => "gray",
        }
    }
}

impl Display for ReleaseType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ReleaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "normal" => Ok(ReleaseType::Normal),
            "gray" | "beta" => Ok(ReleaseType::Gray),
            _ => Err(format!("Invalid release type: {}", s)),
        }
    }
}

/// Identity of a config file: (namespace, group, name)
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFileKey {
    pub namespace: String,
    pub group: String,
    pub name: String,
}

impl ConfigFileKey {
    pub fn new(namespace: &str, group: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            group: group.to_string(),
            name: name.to_string(),
        }
    }

    pub fn owner_key(&self) -> String {
        owner_key(&self.namespace, &self.group)
    }

    pub fn file_key(&self) -> String {
        file_key(&self.namespace, &self.group, &self.name)
    }

    pub fn active_key(&self, release_type: ReleaseType) -> String {
        active_key(&self.namespace, &self.group, &self.name, release_type)
    }

    /// Name of the gray resource bound to this file's gray release
    pub fn gray_resource_name(&self) -> String {
        self.active_key(ReleaseType::Gray)
    }

    /// Parse a `namespace@group@fileName` key back into its parts
    pub fn parse(file_key: &str) -> Option<Self> {
        let parts: Vec<&str> = file_key.splitn(3, KEY_SEPARATOR).collect();
        if parts.len() == 3 && parts.iter().all(|p| !p.is_empty()) {
            Some(Self::new(parts[0], parts[1], parts[2]))
        } else {
            None
        }
    }
}

impl Display for ConfigFileKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file_key())
    }
}

/// Identity of a release: file key + release name + release type
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFileReleaseKey {
    pub namespace: String,
    pub group: String,
    pub file_name: String,
    pub name: String,
    #[serde(default)]
    pub release_type: ReleaseType,
}

impl ConfigFileReleaseKey {
    pub fn new(file: &ConfigFileKey, name: &str, release_type: ReleaseType) -> Self {
        Self {
            namespace: file.namespace.clone(),
            group: file.group.clone(),
            file_name: file.name.clone(),
            name: name.to_string(),
            release_type,
        }
    }

    pub fn file(&self) -> ConfigFileKey {
        ConfigFileKey::new(&self.namespace, &self.group, &self.file_name)
    }

    pub fn owner_key(&self) -> String {
        owner_key(&self.namespace, &self.group)
    }

    pub fn file_key(&self) -> String {
        file_key(&self.namespace, &self.group, &self.file_name)
    }

    pub fn active_key(&self) -> String {
        active_key(&self.namespace, &self.group, &self.file_name, self.release_type)
    }

    pub fn release_key(&self) -> String {
        release_key(&self.namespace, &self.group, &self.file_name, &self.name)
    }
}

/// Editable config file row. Editing it never changes what clients are served.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigFile {
    pub id: u64,
    pub namespace: String,
    pub group: String,
    pub name: String,
    pub content: String,
    pub format: String,
    pub comment: String,
    pub encrypt: bool,
    pub encrypt_algo: String,
    pub metadata: HashMap<String, String>,
    pub status: String,
    pub created_by: String,
    pub modified_by: String,
    pub create_time: i64,
    pub modify_time: i64,
}

impl ConfigFile {
    pub fn key(&self) -> ConfigFileKey {
        ConfigFileKey::new(&self.namespace, &self.group, &self.name)
    }
}

/// Value matcher of a gray label predicate
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    #[default]
    Exact,
    Regex,
    NotEquals,
    In,
    NotIn,
    Range,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchString {
    #[serde(rename = "type", default)]
    pub match_type: MatchType,
    pub value: String,
}

/// One predicate of a gray rule: the client label `key` must satisfy `value`
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientLabel {
    pub key: String,
    pub value: MatchString,
}

impl ClientLabel {
    pub fn exact(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: MatchString {
                match_type: MatchType::Exact,
                value: value.to_string(),
            },
        }
    }
}

/// Release metadata without the content body
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimpleConfigFileRelease {
    pub id: u64,
    pub namespace: String,
    pub group: String,
    pub file_name: String,
    pub name: String,
    pub release_type: ReleaseType,
    pub version: u64,
    pub md5: String,
    pub active: bool,
    /// `false` once the row is tombstoned
    pub valid: bool,
    pub format: String,
    pub comment: String,
    pub release_description: String,
    pub metadata: HashMap<String, String>,
    pub beta_labels: Vec<ClientLabel>,
    pub created_by: String,
    pub modified_by: String,
    pub create_time: i64,
    pub modify_time: i64,
}

impl SimpleConfigFileRelease {
    pub fn key(&self) -> ConfigFileReleaseKey {
        ConfigFileReleaseKey {
            namespace: self.namespace.clone(),
            group: self.group.clone(),
            file_name: self.file_name.clone(),
            name: self.name.clone(),
            release_type: self.release_type,
        }
    }

    pub fn file(&self) -> ConfigFileKey {
        ConfigFileKey::new(&self.namespace, &self.group, &self.file_name)
    }

    pub fn owner_key(&self) -> String {
        owner_key(&self.namespace, &self.group)
    }

    pub fn file_key(&self) -> String {
        file_key(&self.namespace, &self.group, &self.file_name)
    }

    pub fn active_key(&self) -> String {
        active_key(&self.namespace, &self.group, &self.file_name, self.release_type)
    }

    pub fn release_key(&self) -> String {
        release_key(&self.namespace, &self.group, &self.file_name, &self.name)
    }
}

/// Full release row: metadata plus the content snapshot
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFileRelease {
    #[serde(flatten)]
    pub simple: SimpleConfigFileRelease,
    pub content: String,
}

/// Lifecycle transition recorded in release history
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseOpType {
    #[default]
    Create,
    Update,
    Delete,
    Rollback,
    CancelGray,
}

impl ReleaseOpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseOpType::Create => "create",
            ReleaseOpType::Update => "update",
            ReleaseOpType::Delete => "delete",
            ReleaseOpType::Rollback => "rollback",
            ReleaseOpType::CancelGray => "cancel-gray",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseStatus {
    #[default]
    Success,
    Fail,
}

/// Append-only audit record of a lifecycle transition
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigFileReleaseHistory {
    pub id: u64,
    pub namespace: String,
    pub group: String,
    pub file_name: String,
    pub release_name: String,
    pub release_type: ReleaseType,
    pub content: String,
    pub format: String,
    pub md5: String,
    pub version: u64,
    pub metadata: HashMap<String, String>,
    pub beta_labels: Vec<ClientLabel>,
    pub op_type: ReleaseOpType,
    pub status: ReleaseStatus,
    pub reason: String,
    pub release_description: String,
    pub created_by: String,
    pub create_time: i64,
}

/// Serialized gray match rule bound to a gray release
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GrayResource {
    pub name: String,
    /// JSON list of `ClientLabel`
    pub match_rule: String,
    pub valid: bool,
    pub created_by: String,
    pub create_time: i64,
    pub modify_time: i64,
}

/// Grouping container per namespace
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigFileGroup {
    pub id: u64,
    pub namespace: String,
    pub name: String,
    pub comment: String,
    pub metadata: HashMap<String, String>,
    pub valid: bool,
    pub created_by: String,
    pub create_time: i64,
    pub modify_time: i64,
}

impl ConfigFileGroup {
    pub fn owner_key(&self) -> String {
        owner_key(&self.namespace, &self.name)
    }
}

/// Generic paginated result
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub total_count: u64,
    pub page_items: Vec<T>,
}

impl<T> Page<T> {
    pub fn new(total_count: u64, page_items: Vec<T>) -> Self {
        Self {
            total_count,
            page_items,
        }
    }

    pub fn empty() -> Self {
        Self {
            total_count: 0,
            page_items: Vec::new(),
        }
    }

    /// Slice an already-filtered, already-sorted list
    pub fn paginate(items: Vec<T>, offset: usize, limit: usize) -> Self {
        let total_count = items.len() as u64;
        let page_items = items.into_iter().skip(offset).take(limit).collect();
        Self {
            total_count,
            page_items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_keys() {
        let key = ConfigFileReleaseKey {
            namespace: "ns".to_string(),
            group: "g".to_string(),
            file_name: "app.yaml".to_string(),
            name: "r1".to_string(),
            release_type: ReleaseType::Gray,
        };
        assert_eq!(key.owner_key(), "ns@g");
        assert_eq!(key.file_key(), "ns@g@app.yaml");
        assert_eq!(key.active_key(), "ns@g@app.yaml@gray");
        assert_eq!(key.release_key(), "ns@g@app.yaml@r1");
        assert_eq!(key.file().gray_resource_name(), "ns@g@app.yaml@gray");
    }

    #[test]
    fn test_release_type_parse() {
        assert_eq!("normal".parse::<ReleaseType>().unwrap(), ReleaseType::Normal);
        assert_eq!("".parse::<ReleaseType>().unwrap(), ReleaseType::Normal);
        assert_eq!("gray".parse::<ReleaseType>().unwrap(), ReleaseType::Gray);
        assert!("canary".parse::<ReleaseType>().is_err());
        assert_eq!(ReleaseType::Gray.to_string(), "gray");
    }

    #[test]
    fn test_file_key_parse() {
        let key = ConfigFileKey::parse("ns@g@dir/app.yaml").unwrap();
        assert_eq!(key.name, "dir/app.yaml");
        assert!(ConfigFileKey::parse("ns@g").is_none());
        assert!(ConfigFileKey::parse("ns@@f").is_none());
    }

    #[test]
    fn test_client_label_json() {
        let labels = vec![ClientLabel::exact("CLIENT_IP", "1.1.1.1")];
        let json = serde_json::to_string(&labels).unwrap();
        assert_eq!(
            json,
            r#"[{"key":"CLIENT_IP","value":{"type":"EXACT","value":"1.1.1.1"}}]"#
        );
        let parsed: Vec<ClientLabel> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, labels);
    }

    #[test]
    fn test_page_paginate() {
        let page = Page::paginate((0..10).collect::<Vec<_>>(), 8, 5);
        assert_eq!(page.total_count, 10);
        assert_eq!(page.page_items, vec![8, 9]);
    }
}
