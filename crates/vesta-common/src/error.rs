//! Error types and error codes for Vesta
//!
//! This module defines:
//! - `VestaError`: Service-boundary error enum
//! - `ErrorCode`: Structured error codes carried by every API response

use serde::{Deserialize, Serialize};

/// Service-boundary error types
///
/// Store and offload failures travel as `anyhow::Error` inside the library and
/// are folded into `StoreLayer` / `Persistence` when they cross a service call.
#[derive(thiserror::Error, Clone, Debug)]
pub enum VestaError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid match rule: {0}")]
    InvalidMatchRule(String),

    #[error("resource not found: {0}")]
    NotFoundResource(String),

    #[error("data conflict: {0}")]
    DataConflict(String),

    #[error("store layer error: {0}")]
    StoreLayer(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VestaError {
    /// Structured code for this error
    pub fn code(&self) -> ErrorCode<'static> {
        match self {
            VestaError::InvalidParameter(_) => INVALID_PARAMETER,
            VestaError::InvalidMatchRule(_) => INVALID_MATCH_RULE,
            VestaError::NotFoundResource(_) => NOT_FOUND_RESOURCE,
            VestaError::DataConflict(_) => DATA_CONFLICT,
            VestaError::StoreLayer(_) => STORE_LAYER_EXCEPTION,
            VestaError::Persistence(_) => PERSISTENCE_EXCEPTION,
            VestaError::Internal(_) => EXECUTE_EXCEPTION,
        }
    }

    /// Wrap a store failure, keeping the full context chain in the message
    pub fn store(err: anyhow::Error) -> Self {
        VestaError::StoreLayer(format!("{:#}", err))
    }

    /// Wrap an offload-store failure
    pub fn persistence(err: anyhow::Error) -> Self {
        VestaError::Persistence(format!("{:#}", err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VestaError::NotFoundResource(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, VestaError::DataConflict(_))
    }
}

impl From<anyhow::Error> for VestaError {
    fn from(value: anyhow::Error) -> Self {
        // Errors raised by this crate and wrapped in anyhow keep their variant
        match value.downcast::<VestaError>() {
            Ok(err) => err,
            Err(other) => VestaError::store(other),
        }
    }
}

/// Error code structure for API responses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

pub const SUCCESS: ErrorCode<'static> = ErrorCode {
    code: 200000,
    message: "execute success",
};

pub const DATA_NO_CHANGE: ErrorCode<'static> = ErrorCode {
    code: 200001,
    message: "data no change, no need to update",
};

pub const INVALID_PARAMETER: ErrorCode<'static> = ErrorCode {
    code: 400000,
    message: "invalid parameter",
};

pub const INVALID_MATCH_RULE: ErrorCode<'static> = ErrorCode {
    code: 400001,
    message: "invalid gray match rule",
};

pub const NOT_FOUND_RESOURCE: ErrorCode<'static> = ErrorCode {
    code: 400202,
    message: "not found resource",
};

pub const DATA_CONFLICT: ErrorCode<'static> = ErrorCode {
    code: 409000,
    message: "data is conflict, please try again",
};

pub const EXECUTE_EXCEPTION: ErrorCode<'static> = ErrorCode {
    code: 500000,
    message: "execute exception",
};

pub const STORE_LAYER_EXCEPTION: ErrorCode<'static> = ErrorCode {
    code: 500001,
    message: "store layer exception",
};

pub const PERSISTENCE_EXCEPTION: ErrorCode<'static> = ErrorCode {
    code: 500002,
    message: "release content persistence exception",
};
