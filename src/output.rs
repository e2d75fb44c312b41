//! Result and report types produced by a rehost run.
//!
//! Per-item outcomes ([`FetchResult`], [`UploadResult`]) carry their own
//! [`ItemError`] instead of failing the run; the orchestrator folds them into
//! a [`RunReport`] at the end.

use crate::error::{ErrorKind, ItemError};
use crate::pipeline::mapping::UrlMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Outcome of fetching one URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    /// The URL exactly as it appears in the document.
    pub original_url: String,
    /// Artifact written to the download directory, on success.
    pub local_path: Option<PathBuf>,
    pub byte_size: Option<u64>,
    /// `(width, height)` when the image header could be read.
    pub dimensions: Option<(u32, u32)>,
    /// Attempts made (0 when skipped or resumed).
    pub attempts: u32,
    /// Taken from a previous run's state instead of fetched again.
    pub resumed: bool,
    pub error: Option<ItemError>,
}

impl FetchResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.local_path.is_some()
    }

    pub(crate) fn failed(original_url: impl Into<String>, error: ItemError, attempts: u32) -> Self {
        Self {
            original_url: original_url.into(),
            local_path: None,
            byte_size: None,
            dimensions: None,
            attempts,
            resumed: false,
            error: Some(error),
        }
    }
}

/// Outcome of uploading one local artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    pub local_path: PathBuf,
    pub remote_url: Option<String>,
    /// Store-specific identifier (WeChat `media_id`).
    pub remote_id: Option<String>,
    pub attempts: u32,
    pub resumed: bool,
    pub error: Option<ItemError>,
}

impl UploadResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.remote_url.is_some()
    }

    pub(crate) fn failed(local_path: &Path, error: ItemError, attempts: u32) -> Self {
        Self {
            local_path: local_path.to_path_buf(),
            remote_url: None,
            remote_id: None,
            attempts,
            resumed: false,
            error: Some(error),
        }
    }
}

/// Pipeline stage, used to attribute failures and progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Extract,
    Fetch,
    Upload,
    Map,
    Rewrite,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Extract => "extract",
            Stage::Fetch => "fetch",
            Stage::Upload => "upload",
            Stage::Map => "map",
            Stage::Rewrite => "rewrite",
        };
        f.write_str(s)
    }
}

/// One failed item, as listed in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Original URL, or the document path for extract/rewrite failures.
    pub url: String,
    pub stage: Stage,
    pub error_kind: ErrorKind,
    pub detail: String,
}

impl FailureRecord {
    pub fn from_item(url: impl Into<String>, stage: Stage, err: &ItemError) -> Self {
        Self {
            url: url.into(),
            stage,
            error_kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

/// What happened to one document during rewriting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentReport {
    pub path: PathBuf,
    /// Where the rewritten text went; `None` when nothing was written.
    pub output_path: Option<PathBuf>,
    pub backup_path: Option<PathBuf>,
    /// Distinct image URLs extracted from this document.
    pub found: usize,
    /// Occurrences substituted.
    pub replacements: usize,
    /// Distinct URLs substituted at least once.
    pub replaced_urls: Vec<String>,
    /// Extracted URLs with no mapping entry, left untouched.
    pub unresolved: Vec<String>,
    pub written: bool,
}

/// Summary of a full run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    /// Distinct URLs extracted across all documents.
    pub found: usize,
    pub fetched: usize,
    pub uploaded: usize,
    /// Entries in the final mapping.
    pub mapped: usize,
    /// Distinct URLs replaced in at least one document.
    pub replaced: usize,
    /// Extracted URLs that did not make it into the mapping, or that some
    /// document still holds unreplaced.
    pub unresolved: usize,
    /// Total substitutions across all documents.
    pub replacement_count: usize,
    pub documents: Vec<DocumentReport>,
    pub failures: Vec<FailureRecord>,
    pub duration_ms: u64,
}

impl RunReport {
    /// Every extracted URL was rehosted and nothing failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.unresolved == 0
    }

    /// Failures of one error kind.
    pub fn failures_of(&self, kind: ErrorKind) -> impl Iterator<Item = &FailureRecord> {
        self.failures.iter().filter(move |f| f.error_kind == kind)
    }
}

/// Everything a full run produces.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub report: RunReport,
    /// Final original → remote mapping.
    pub mapping: UrlMap,
    pub fetches: Vec<FetchResult>,
    pub uploads: Vec<UploadResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_record_carries_kind_and_detail() {
        let rec = FailureRecord::from_item(
            "http://x.com/a.png",
            Stage::Fetch,
            &ItemError::permanent("HTTP 404 Not Found"),
        );
        assert_eq!(rec.error_kind, ErrorKind::NetworkPermanent);
        assert!(rec.detail.contains("404"));
        assert_eq!(rec.stage.to_string(), "fetch");
    }

    #[test]
    fn report_completeness() {
        let mut report = RunReport {
            found: 2,
            mapped: 2,
            ..Default::default()
        };
        assert!(report.is_complete());
        report.unresolved = 1;
        assert!(!report.is_complete());
    }

    #[test]
    fn report_serialises_to_json() {
        let report = RunReport {
            found: 1,
            failures: vec![FailureRecord::from_item(
                "http://x.com/a.png",
                Stage::Upload,
                &ItemError::SizeExceeded { size: 5, limit: 1 },
            )],
            ..Default::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["found"], 1);
        assert_eq!(json["failures"][0]["stage"], "Upload");
        assert_eq!(json["failures"][0]["error_kind"], "SizeExceeded");
        assert_eq!(report.failures_of(ErrorKind::SizeExceeded).count(), 1);
    }
}
