//! Error types for snail
//!
//! Exit codes:
//! - 0: Success
//! - 2: User error (bad input, missing record, bad config or backup)
//! - 3: Permission denied on a row
//! - 4: Operation failed (storage, network, IO)

use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the snail CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const PERMISSION_DENIED: i32 = 3;
    pub const OPERATION_FAILED: i32 = 4;
}

/// The four failure classes the sync pipeline reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input. Never retried.
    Validation,
    /// Caller lacks rights over the row. Never retried.
    Permission,
    /// Target no longer exists. Satisfies delete-like operations.
    NotFound,
    /// Network/availability/storage failure. The user may re-issue the intent.
    Transient,
}

/// Main error type for snail operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Backend unavailable: {0}")]
    Transient(String),

    #[error("Sort order not saved: {0}")]
    SortNotSaved(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid backup: {0}")]
    InvalidBackup(String),

    #[error("Lock acquisition failed: {0}")]
    LockFailed(PathBuf),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Error {
    /// Classify this error into the pipeline taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_)
            | Error::InvalidConfig(_)
            | Error::InvalidBackup(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_) => ErrorKind::Validation,
            Error::Permission(_) => ErrorKind::Permission,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Transient(_)
            | Error::SortNotSaved(_)
            | Error::LockFailed(_)
            | Error::Storage(_)
            | Error::Io(_) => ErrorKind::Transient,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Only transient failures are worth re-issuing; nothing retries on its own.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::NotFound => exit_codes::USER_ERROR,
            ErrorKind::Permission => exit_codes::PERMISSION_DENIED,
            ErrorKind::Transient => exit_codes::OPERATION_FAILED,
        }
    }

    /// Extra structured context for JSON output.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::LockFailed(path) => Some(serde_json::json!({ "path": path })),
            Error::SortNotSaved(_) => Some(serde_json::json!({ "notice": "sort_not_saved" })),
            _ => None,
        }
    }
}

/// Result type alias for snail operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wrapper for displaying errors in JSON format
#[derive(serde::Serialize)]
pub struct JsonError {
    pub error: String,
    pub code: i32,
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&Error> for JsonError {
    fn from(err: &Error) -> Self {
        JsonError {
            error: err.to_string(),
            code: err.exit_code(),
            kind: err.kind(),
            details: err.details(),
        }
    }
}
