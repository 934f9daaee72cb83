//! Vesta Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all Vesta components:
//! - Error types and error codes
//! - Resource name validation
//! - Content hashing
//! - Common constants

pub mod error;
pub mod utils;

// Re-exports for convenience
pub use error::{ErrorCode, VestaError};
pub use utils::{is_valid_file_name, is_valid_name, md5_hex};

/// Default namespace used when no namespace is specified
pub const DEFAULT_NAMESPACE: &str = "default";

/// Separator used by every derived key (owner/file/active/release keys)
pub const KEY_SEPARATOR: &str = "@";

/// Operator recorded on audit fields when the caller supplies none
pub const DEFAULT_OPERATOR: &str = "vesta";

/// Maximum length of namespace, group and release names
pub const MAX_NAME_LENGTH: usize = 128;

/// Maximum length of a config file name (may contain path segments)
pub const MAX_FILE_NAME_LENGTH: usize = 128;
