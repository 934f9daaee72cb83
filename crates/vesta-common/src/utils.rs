//! Utility functions for Vesta
//!
//! Resource-name validation and content hashing shared by every crate.

use std::sync::LazyLock;

use md5::{Digest, Md5};

use crate::{MAX_FILE_NAME_LENGTH, MAX_NAME_LENGTH};

/// Namespace, group and release names
static NAME_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new("^[0-9A-Za-z_.:-]+$").expect("Invalid regex pattern"));

/// File names may additionally carry `/` separated path segments
static FILE_NAME_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new("^[0-9A-Za-z_.:/-]+$").expect("Invalid regex pattern"));

/// Validate a namespace, group or release name
///
/// Allowed characters: alphanumeric, underscore, dot, colon, hyphen.
///
/// # Examples
///
/// ```
/// use vesta_common::is_valid_name;
///
/// assert!(is_valid_name("DEFAULT_GROUP"));
/// assert!(is_valid_name("app.v1"));
/// assert!(!is_valid_name(""));
/// assert!(!is_valid_name("a@b"));
/// ```
pub fn is_valid_name(name: &str) -> bool {
    name.len() <= MAX_NAME_LENGTH && NAME_PATTERN.is_match(name)
}

/// Validate a config file name
///
/// ```
/// use vesta_common::is_valid_file_name;
///
/// assert!(is_valid_file_name("service/app.yaml"));
/// assert!(!is_valid_file_name("app@prod.yaml"));
/// ```
pub fn is_valid_file_name(name: &str) -> bool {
    name.len() <= MAX_FILE_NAME_LENGTH
        && FILE_NAME_PATTERN.is_match(name)
        && !name.starts_with('/')
        && !name.ends_with('/')
}

/// Lower-case hex md5 of the given content
pub fn md5_hex(content: &str) -> String {
    const_hex::encode(Md5::digest(content.as_bytes()))
}
