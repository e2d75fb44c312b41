//! # img-rehost
//!
//! Find image URLs in text documents, download them, republish them on a
//! media store you control, and rewrite the documents to point at the new
//! copies.
//!
//! Articles copied between platforms keep hot-linking images from the
//! original host. Those links break, get rate-limited, or are refused
//! outright by hosts that check the referrer (WeChat's CDN among them). This
//! crate moves every referenced image onto your own store and rewrites the
//! references in place, keeping a backup of each document.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document(s)
//!  │
//!  ├─ 1. Extract    image URLs from Markdown / HTML / plain text
//!  ├─ 2. Fetch      concurrent downloads with retry, size and format checks
//!  ├─ 3. Upload     concurrent uploads to the media store, one session per run
//!  ├─ 4. Reconcile  original → local → remote into one mapping
//!  └─ 5. Rewrite    exact, boundary-checked substitution + `.backup`
//! ```
//!
//! Every stage persists its state (`extracted_urls.txt`,
//! `download_mapping.json`, `upload_mapping.json`, `url_mapping.json`), so an
//! interrupted run resumes where it stopped and each stage can be rerun on
//! its own.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use img_rehost::{run, RehostConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RehostConfig::builder()
//!         .credentials("wx_app_id", "wx_app_secret")
//!         .build()?;
//!     let output = run("article.md", &config).await?;
//!     eprintln!(
//!         "{} of {} images rehosted",
//!         output.report.mapped, output.report.found
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `img-rehost` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! img-rehost = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod output;
mod persist;
pub mod pipeline;
pub mod progress;
pub mod rehost;
pub mod retry;
pub mod store;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{RehostConfig, RehostConfigBuilder};
pub use error::{ErrorKind, ItemError, RehostError};
pub use output::{
    DocumentReport, FailureRecord, FetchResult, RunOutput, RunReport, Stage, UploadResult,
};
pub use persist::backup_path_for;
pub use pipeline::extract::{extract_urls, DocumentFormat, FormatHint, UrlRecord};
pub use pipeline::mapping::{MappingStage, MappingStore, UploadScope, UrlMap};
pub use pipeline::rewrite::{apply_mapping, restore_from_backup};
pub use progress::{NoopProgressCallback, ProgressCallback, RehostProgressCallback};
pub use rehost::{
    download_urls, extract_source, load_mapping, reconcile_state, replace_source,
    restore_source, run, run_sync, upload_artifacts,
};
pub use retry::{Backoff, RetryPolicy};
pub use store::{Credentials, InMemoryStore, MediaStore, UploadMode, WeChatStore};
pub use stream::{fetch_stream, upload_stream};
