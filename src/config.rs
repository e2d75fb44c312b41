//! Configuration types for a rehost run.
//!
//! All behaviour is controlled through [`RehostConfig`], built via its
//! [`RehostConfigBuilder`]. The library never reads flags or environment
//! variables itself; the CLI maps those onto the builder.

use crate::error::RehostError;
use crate::progress::ProgressCallback;
use crate::retry::{Backoff, RetryPolicy};
use crate::store::{Credentials, MediaStore, UploadMode};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default cap on a single image, in bytes (10 MiB).
pub const DEFAULT_MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;

/// Configuration for a rehost run.
///
/// Built via [`RehostConfig::builder()`] or using [`RehostConfig::default()`].
///
/// # Example
/// ```rust
/// use img_rehost::RehostConfig;
///
/// let config = RehostConfig::builder()
///     .concurrency(8)
///     .credentials("wx123", "secret")
///     .download_dir("cache/images")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct RehostConfig {
    /// Fetches (and, separately, uploads) in flight at once. Default: 5.
    ///
    /// Both stages are network-bound. Image hosts tend to throttle long
    /// before bandwidth runs out, so keep this modest.
    pub concurrency: usize,

    /// Per-request timeout for image downloads in seconds. Default: 30.
    pub fetch_timeout_secs: u64,

    /// Per-request timeout for store calls in seconds. Default: 60.
    pub upload_timeout_secs: u64,

    /// Retry policy shared by fetch, upload and authentication.
    /// Default: 3 attempts, exponential backoff from 1 s capped at 30 s.
    pub retry: RetryPolicy,

    /// Largest image accepted on download, in bytes. Default: 10 MiB.
    ///
    /// Enforced against `Content-Length` up front and again while the body
    /// streams in, so a lying server cannot exceed it.
    pub max_image_bytes: u64,

    /// Where downloaded artifacts are written. Default: `downloads`.
    pub download_dir: PathBuf,

    /// Where the URL list and the three mapping files live. Default: `.`.
    pub state_dir: PathBuf,

    /// Permanent or temporary uploads. Default: permanent.
    pub upload_mode: UploadMode,

    /// Store credentials. Redacted from `Debug`.
    pub credentials: Credentials,

    /// Pre-constructed media store. When `None` a WeChat store is built
    /// from `upload_timeout_secs`.
    pub store: Option<Arc<dyn MediaStore>>,

    /// Copy each document to `<file>.backup` before rewriting it in place.
    /// Default: true.
    pub backup: bool,

    /// Skip URLs and artifacts already recorded in the persisted stage
    /// mappings. Default: true.
    pub resume: bool,

    /// Write the URL list and mapping files to `state_dir`. Default: true.
    pub save_mapping: bool,

    /// Walk sub-directories when the source is a directory. Default: true.
    pub recursive: bool,

    /// Write rewritten documents here instead of in place. A file path for a
    /// single-document source, a directory (mirroring relative paths) for a
    /// directory source.
    pub output: Option<PathBuf>,

    /// `User-Agent` sent with image requests.
    pub user_agent: String,

    /// Stop submitting new work after this many seconds. Default: none.
    pub run_timeout_secs: Option<u64>,

    /// Optional per-item progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for RehostConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            fetch_timeout_secs: 30,
            upload_timeout_secs: 60,
            retry: RetryPolicy::default(),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            download_dir: PathBuf::from("downloads"),
            state_dir: PathBuf::from("."),
            upload_mode: UploadMode::default(),
            credentials: Credentials::default(),
            store: None,
            backup: true,
            resume: true,
            save_mapping: true,
            recursive: true,
            output: None,
            user_agent: concat!("img-rehost/", env!("CARGO_PKG_VERSION")).to_string(),
            run_timeout_secs: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for RehostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RehostConfig")
            .field("concurrency", &self.concurrency)
            .field("fetch_timeout_secs", &self.fetch_timeout_secs)
            .field("upload_timeout_secs", &self.upload_timeout_secs)
            .field("retry", &self.retry)
            .field("max_image_bytes", &self.max_image_bytes)
            .field("download_dir", &self.download_dir)
            .field("state_dir", &self.state_dir)
            .field("upload_mode", &self.upload_mode)
            .field("credentials", &self.credentials)
            .field("store", &self.store.as_ref().map(|s| s.name().to_string()))
            .field("backup", &self.backup)
            .field("resume", &self.resume)
            .field("save_mapping", &self.save_mapping)
            .field("recursive", &self.recursive)
            .field("output", &self.output)
            .field("run_timeout_secs", &self.run_timeout_secs)
            .finish()
    }
}

impl RehostConfig {
    /// Create a new builder for `RehostConfig`.
    pub fn builder() -> RehostConfigBuilder {
        RehostConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`RehostConfig`].
#[derive(Debug)]
pub struct RehostConfigBuilder {
    config: RehostConfig,
}

impl RehostConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs;
        self
    }

    pub fn upload_timeout_secs(mut self, secs: u64) -> Self {
        self.config.upload_timeout_secs = secs;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Total attempts per item, including the first.
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.retry.max_attempts = n.max(1);
        self
    }

    /// Base delay of the exponential backoff, keeping the current cap.
    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        let max = match self.config.retry.backoff {
            Backoff::Exponential { max, .. } => max,
            Backoff::Fixed(_) => Duration::from_secs(30),
        };
        self.config.retry.backoff = Backoff::Exponential {
            base: Duration::from_millis(ms),
            max,
        };
        self
    }

    pub fn max_image_bytes(mut self, bytes: u64) -> Self {
        self.config.max_image_bytes = bytes;
        self
    }

    pub fn download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.download_dir = dir.into();
        self
    }

    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.state_dir = dir.into();
        self
    }

    pub fn upload_mode(mut self, mode: UploadMode) -> Self {
        self.config.upload_mode = mode;
        self
    }

    pub fn credentials(mut self, app_id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.config.credentials = Credentials::new(app_id, secret);
        self
    }

    pub fn store(mut self, store: Arc<dyn MediaStore>) -> Self {
        self.config.store = Some(store);
        self
    }

    pub fn backup(mut self, v: bool) -> Self {
        self.config.backup = v;
        self
    }

    pub fn resume(mut self, v: bool) -> Self {
        self.config.resume = v;
        self
    }

    pub fn save_mapping(mut self, v: bool) -> Self {
        self.config.save_mapping = v;
        self
    }

    pub fn recursive(mut self, v: bool) -> Self {
        self.config.recursive = v;
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.output = Some(path.into());
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    pub fn run_timeout_secs(mut self, secs: u64) -> Self {
        self.config.run_timeout_secs = Some(secs);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<RehostConfig, RehostError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(RehostError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.retry.max_attempts == 0 {
            return Err(RehostError::InvalidConfig(
                "Retry attempts must be ≥ 1".into(),
            ));
        }
        if c.fetch_timeout_secs == 0 || c.upload_timeout_secs == 0 {
            return Err(RehostError::InvalidConfig(
                "Timeouts must be at least one second".into(),
            ));
        }
        if c.max_image_bytes == 0 {
            return Err(RehostError::InvalidConfig(
                "Maximum image size must be > 0".into(),
            ));
        }
        if c.download_dir.as_os_str().is_empty() {
            return Err(RehostError::InvalidConfig(
                "Download directory must not be empty".into(),
            ));
        }
        if c.run_timeout_secs == Some(0) {
            return Err(RehostError::InvalidConfig(
                "Run timeout must be at least one second".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn defaults_match_documented_values() {
        let c = RehostConfig::default();
        assert_eq!(c.concurrency, 5);
        assert_eq!(c.fetch_timeout_secs, 30);
        assert_eq!(c.upload_timeout_secs, 60);
        assert_eq!(c.retry.max_attempts, 3);
        assert_eq!(c.max_image_bytes, 10 * 1024 * 1024);
        assert_eq!(c.download_dir, PathBuf::from("downloads"));
        assert_eq!(c.upload_mode, UploadMode::Permanent);
        assert!(c.backup && c.resume && c.save_mapping && c.recursive);
        assert!(c.run_timeout_secs.is_none());
    }

    #[test]
    fn builder_clamps_concurrency_and_attempts() {
        let c = RehostConfig::builder()
            .concurrency(0)
            .max_attempts(0)
            .build()
            .unwrap();
        assert_eq!(c.concurrency, 1);
        assert_eq!(c.retry.max_attempts, 1);
    }

    #[test]
    fn build_rejects_zero_timeout() {
        let err = RehostConfig::builder()
            .fetch_timeout_secs(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, RehostError::InvalidConfig(_)));
    }

    #[test]
    fn build_rejects_zero_size_limit() {
        assert!(RehostConfig::builder().max_image_bytes(0).build().is_err());
    }

    #[test]
    fn backoff_base_keeps_cap() {
        let c = RehostConfig::builder().retry_backoff_ms(250).build().unwrap();
        assert_eq!(
            c.retry.backoff,
            Backoff::Exponential {
                base: Duration::from_millis(250),
                max: Duration::from_secs(30),
            }
        );
    }

    #[test]
    fn debug_redacts_secret_and_names_store() {
        let c = RehostConfig::builder()
            .credentials("wx1", "hunter2")
            .store(Arc::new(InMemoryStore::new()))
            .build()
            .unwrap();
        let dbg = format!("{c:?}");
        assert!(dbg.contains("wx1"));
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("memory"));
    }
}
