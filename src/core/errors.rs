// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the source manager.
///
/// Two variants carry client-facing meaning (spec §7): [`SourceMgrError::NoSuchEntry`]
/// is mapped to 404 by the (out-of-scope) HTTP front-end, [`SourceMgrError::InvalidArgument`]
/// to 400. Everything else is an opaque internal failure (500) that callers log at error
/// level before discarding or wrapping.
#[derive(Error, Debug)]
pub enum SourceMgrError {
    /// An id refers to a non-existent or soft-deleted source/feed.
    #[error("no such entry: {0}")]
    NoSuchEntry(String),

    /// A validation failure: range, uniqueness, regex-compile, missing PEM block, etc.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The persistence port returned an error.
    #[error("database error: {0}")]
    Database(String),

    /// Symmetric encryption/decryption of secret material failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// A download or PMD fetch failed at the HTTP layer.
    #[error("http client error: {0}")]
    Http(String),

    /// Filesystem or other I/O failure.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// Anything that does not fit the categories above.
    #[error("internal error: {0}")]
    Internal(String),
}

// Manual Clone because `std::io::Error` is not cloneable; wrapped in an Arc instead.
impl Clone for SourceMgrError {
    fn clone(&self) -> Self {
        match self {
            SourceMgrError::NoSuchEntry(s) => SourceMgrError::NoSuchEntry(s.clone()),
            SourceMgrError::InvalidArgument(s) => SourceMgrError::InvalidArgument(s.clone()),
            SourceMgrError::Database(s) => SourceMgrError::Database(s.clone()),
            SourceMgrError::Encryption(s) => SourceMgrError::Encryption(s.clone()),
            SourceMgrError::Http(s) => SourceMgrError::Http(s.clone()),
            SourceMgrError::Io(e) => SourceMgrError::Io(Arc::clone(e)),
            SourceMgrError::Internal(s) => SourceMgrError::Internal(s.clone()),
        }
    }
}

impl PartialEq for SourceMgrError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SourceMgrError::NoSuchEntry(a), SourceMgrError::NoSuchEntry(b)) => a == b,
            (SourceMgrError::InvalidArgument(a), SourceMgrError::InvalidArgument(b)) => a == b,
            (SourceMgrError::Database(a), SourceMgrError::Database(b)) => a == b,
            (SourceMgrError::Encryption(a), SourceMgrError::Encryption(b)) => a == b,
            (SourceMgrError::Http(a), SourceMgrError::Http(b)) => a == b,
            (SourceMgrError::Io(a), SourceMgrError::Io(b)) => a.to_string() == b.to_string(),
            (SourceMgrError::Internal(a), SourceMgrError::Internal(b)) => a == b,
            _ => false,
        }
    }
}

impl From<std::io::Error> for SourceMgrError {
    fn from(e: std::io::Error) -> Self {
        SourceMgrError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for SourceMgrError {
    fn from(e: reqwest::Error) -> Self {
        SourceMgrError::Http(e.to_string())
    }
}

impl From<regex::Error> for SourceMgrError {
    fn from(e: regex::Error) -> Self {
        SourceMgrError::InvalidArgument(format!("invalid regular expression: {e}"))
    }
}

impl From<sqlx::Error> for SourceMgrError {
    fn from(e: sqlx::Error) -> Self {
        SourceMgrError::Database(e.to_string())
    }
}

impl From<url::ParseError> for SourceMgrError {
    fn from(e: url::ParseError) -> Self {
        SourceMgrError::InvalidArgument(format!("invalid URL: {e}"))
    }
}

impl From<serde_json::Error> for SourceMgrError {
    fn from(e: serde_json::Error) -> Self {
        SourceMgrError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}
