//! Error types for the vulnreach crate.
//!
//! This module provides a comprehensive error type [`Error`] that covers
//! all failure modes in the library, enabling proper error handling.

use std::io;

/// The main error type for all operations in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed flags, arguments, or source URIs.
    #[error("usage error: {0}")]
    Usage(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP request via middleware failed.
    #[error("HTTP middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// JSON serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization failed (report skeletons).
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// I/O error (file operations, local DB sources, caches).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed vulnerability or CVE data.
    #[error("data error in {context}: {message}")]
    Data {
        /// What was being parsed (e.g. a CVE file path or module name).
        context: String,
        /// Description of what went wrong.
        message: String,
    },

    /// The CVE record carries a schema version the classifier does not support.
    #[error("CVE {id} has data version {version}: unsupported CVE version")]
    CveVersionUnsupported {
        /// CVE identifier.
        id: String,
        /// The unsupported `DataVersion` value.
        version: String,
    },

    /// An update precondition failed. The caller may bypass with `-force`.
    #[error("update precondition failed: {0}")]
    Precondition(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(String),

    /// CVE repository access failed.
    #[error("repo error: {0}")]
    Repo(String),

    /// Issue tracker operation failed.
    #[error("issue client error: {0}")]
    Issue(String),

    /// An internal consistency invariant was violated.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Sentinel: the scan found vulnerabilities. Not a failure for the
    /// library; the CLI translates it to exit status 3.
    #[error("vulnerabilities found")]
    VulnerabilitiesFound,
}

/// A specialized Result type for vulnreach operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new usage error.
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    /// Create a new data error.
    pub fn data(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Data {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create a new store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Create a new repo error.
    pub fn repo(message: impl Into<String>) -> Self {
        Self::Repo(message.into())
    }

    /// Create a new invariant error.
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }

    /// Check if this error is an update precondition that `-force` bypasses.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition(_))
    }

    /// Check if this error is the unsupported-CVE-version sentinel.
    pub fn is_cve_version_unsupported(&self) -> bool {
        matches!(self, Self::CveVersionUnsupported { .. })
    }
}
