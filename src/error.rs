//! Error types for the img-rehost library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`RehostError`]: **Fatal**: the run cannot proceed at all (source path
//!   missing, store credentials rejected, state directory not writable).
//!   Returned as `Err(RehostError)` from the top-level entry points in
//!   [`crate::rehost`].
//!
//! * [`ItemError`]: **Non-fatal**: a single URL or artifact failed (404,
//!   oversized image, transient network error after all retries) while every
//!   other item is fine. Stored inside [`crate::output::FetchResult`] and
//!   [`crate::output::UploadResult`] so one bad image never costs the whole
//!   document.
//!
//! Every `ItemError` maps onto a coarse [`ErrorKind`], which is what the
//! report carries and what the retry policy inspects.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the img-rehost library.
#[derive(Debug, Error)]
pub enum RehostError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Source file or directory does not exist.
    #[error("Source not found: '{path}'\nCheck the path exists and is readable.")]
    SourceNotFound { path: PathBuf },

    /// A document could not be processed as text (unknown extension).
    #[error("Unsupported document '{path}': {reason}")]
    FormatUnsupported { path: PathBuf, reason: String },

    /// Reading an input file failed.
    #[error("Failed to read '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Remote store errors ───────────────────────────────────────────────
    /// Credential exchange failed, or the store rejected the session mid-run.
    #[error("Authentication with media store '{store}' failed: {detail}\nCheck the app id and secret.")]
    AuthFailed { store: String, detail: String },

    // ── Mapping errors ────────────────────────────────────────────────────
    /// A persisted mapping file exists but is not a valid JSON object of strings.
    #[error("Mapping file '{path}' is corrupt: {detail}")]
    CorruptMapping { path: PathBuf, detail: String },

    /// A backup was requested for restore but does not exist.
    #[error("No backup found at '{path}'")]
    BackupMissing { path: PathBuf },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Writing shared run state (mapping files, URL list, artifact dir) failed.
    #[error("Failed to write state file '{path}': {source}")]
    StateWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not write a rewritten document or its backup.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an item failure, as carried in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Timeout, connection reset, 5xx, throttling. Retried.
    NetworkTransient,
    /// 404, other 4xx, unsupported content type. Not retried.
    NetworkPermanent,
    /// Payload larger than the configured or store limit. Not retried.
    SizeExceeded,
    /// Store rejected the credentials or session. Fatal for the run.
    AuthFailure,
    /// Content is not one of the accepted image formats, or a document
    /// cannot be read as text.
    FormatUnsupported,
    /// Local disk error. Retried once.
    IoFailure,
    /// The run was cancelled before this item was submitted.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NetworkTransient => "network-transient",
            ErrorKind::NetworkPermanent => "network-permanent",
            ErrorKind::SizeExceeded => "size-exceeded",
            ErrorKind::AuthFailure => "auth-failure",
            ErrorKind::FormatUnsupported => "format-unsupported",
            ErrorKind::IoFailure => "io-failure",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A non-fatal error for a single URL or artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ItemError {
    /// Retryable network failure.
    #[error("transient network error: {detail}")]
    Transient { detail: String },

    /// Non-retryable remote failure.
    #[error("permanent error: {detail}")]
    Permanent { detail: String },

    /// Payload too large.
    #[error("size {size} bytes exceeds limit of {limit} bytes")]
    SizeExceeded { size: u64, limit: u64 },

    /// The store refused the credentials or the session token.
    #[error("authentication rejected: {detail}")]
    Auth { detail: String },

    /// Downloaded bytes are not an accepted image format.
    #[error("unsupported format: {detail}")]
    Format { detail: String },

    /// Local file-system failure.
    #[error("I/O error: {detail}")]
    Io { detail: String },

    /// Never started because the run was cancelled.
    #[error("cancelled before start")]
    Cancelled,
}

impl ItemError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ItemError::Transient { .. } => ErrorKind::NetworkTransient,
            ItemError::Permanent { .. } => ErrorKind::NetworkPermanent,
            ItemError::SizeExceeded { .. } => ErrorKind::SizeExceeded,
            ItemError::Auth { .. } => ErrorKind::AuthFailure,
            ItemError::Format { .. } => ErrorKind::FormatUnsupported,
            ItemError::Io { .. } => ErrorKind::IoFailure,
            ItemError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn transient(detail: impl Into<String>) -> Self {
        ItemError::Transient {
            detail: detail.into(),
        }
    }

    pub(crate) fn permanent(detail: impl Into<String>) -> Self {
        ItemError::Permanent {
            detail: detail.into(),
        }
    }

    pub(crate) fn io(err: &std::io::Error) -> Self {
        ItemError::Io {
            detail: err.to_string(),
        }
    }

    /// Classify an HTTP status that is not a success.
    ///
    /// 408, 429 and every 5xx are transient; everything else (404, 403, 410…)
    /// is permanent.
    pub(crate) fn from_status(status: reqwest::StatusCode) -> Self {
        let code = status.as_u16();
        if code == 408 || code == 429 || status.is_server_error() {
            ItemError::transient(format!("HTTP {status}"))
        } else {
            ItemError::permanent(format!("HTTP {status}"))
        }
    }

    /// Classify a reqwest transport error.
    pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status);
        }
        if err.is_builder() || err.is_redirect() {
            return ItemError::permanent(err.to_string());
        }
        if err.is_timeout() {
            return ItemError::transient(format!("timed out: {err}"));
        }
        ItemError::transient(err.to_string())
    }
}
