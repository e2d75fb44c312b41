//! Remote media store capability.
//!
//! The republisher only ever talks to a [`MediaStore`]: one credential
//! exchange per run ([`MediaStore::authenticate`]) followed by any number of
//! [`MediaStore::upload`] calls sharing the returned [`Session`]. Vendor
//! specifics (endpoints, error codes, size limits) stay behind the trait.
//!
//! Two implementations ship with the crate:
//!
//! * [`wechat::WeChatStore`]: WeChat Official Account media API.
//! * [`memory::InMemoryStore`]: deterministic in-process fake for tests and
//!   dry runs.

pub mod memory;
pub mod wechat;

use crate::error::ItemError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

pub use memory::InMemoryStore;
pub use wechat::WeChatStore;

/// Durability of an uploaded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UploadMode {
    /// Persists indefinitely. (default)
    #[default]
    Permanent,
    /// Expires after a store-defined period (three days on WeChat).
    Temporary,
}

impl fmt::Display for UploadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadMode::Permanent => f.write_str("permanent"),
            UploadMode::Temporary => f.write_str("temporary"),
        }
    }
}

/// Credentials exchanged for a [`Session`].
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub app_id: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(app_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            secret: secret.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.app_id.is_empty() || self.secret.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("app_id", &self.app_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// An authenticated session, reused for every upload in a run.
#[derive(Clone)]
pub struct Session {
    pub token: String,
    pub expires_at: Option<Instant>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Bytes handed to the store for one upload.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Where an artifact landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAsset {
    pub remote_url: String,
    /// Opaque identifier usable for later reference (WeChat `media_id`).
    pub remote_id: String,
}

/// A remote media store.
///
/// Implementations must be `Send + Sync`: uploads run concurrently against a
/// shared `Arc<dyn MediaStore>`.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Where uploads land, e.g. the store name plus its endpoint. Saved upload
    /// state is only resumed by a store with the same identity.
    fn identity(&self) -> String {
        self.name().to_string()
    }

    /// Largest payload accepted for `mode`, in bytes.
    fn max_upload_bytes(&self, mode: UploadMode) -> u64;

    /// Exchange credentials for a session.
    ///
    /// Return [`ItemError::Auth`] when the store rejects the credentials and
    /// [`ItemError::Transient`] when the exchange may succeed on retry.
    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, ItemError>;

    /// Upload one payload.
    ///
    /// Return [`ItemError::Auth`] when the session is rejected; the caller
    /// treats that as fatal for the whole run.
    async fn upload(
        &self,
        session: &Session,
        payload: MediaPayload,
        mode: UploadMode,
    ) -> Result<RemoteAsset, ItemError>;
}

/// MIME type for an artifact path, from its extension.
pub fn content_type_for(path: &std::path::Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn credentials_debug_redacts_secret() {
        let c = Credentials::new("wx123", "topsecret");
        let dbg = format!("{c:?}");
        assert!(dbg.contains("wx123"));
        assert!(!dbg.contains("topsecret"));
    }

    #[test]
    fn content_type_from_extension() {
        assert_eq!(content_type_for(Path::new("a/b.PNG")), "image/png");
        assert_eq!(content_type_for(Path::new("b.webp")), "image/webp");
        assert_eq!(content_type_for(Path::new("b.jpeg")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("noext")), "image/jpeg");
    }

    #[test]
    fn empty_credentials_detected() {
        assert!(Credentials::default().is_empty());
        assert!(Credentials::new("id", "").is_empty());
        assert!(!Credentials::new("id", "s").is_empty());
    }
}
