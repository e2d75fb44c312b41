//! Rewrite stage: substitute remote URLs into a document.
//!
//! Substitution is a single left-to-right pass over the original text using
//! exact substring matches of the mapping keys. A match only counts when it
//! stands on its own, i.e. is not the prefix, suffix or middle of a longer
//! URL-like token, so mapping `http://x.com/a.png` never corrupts
//! `http://x.com/a.png?w=2` or `http://cdn.x.com/a.png`. When several keys
//! match at one position the longest wins. Everything between matches is
//! copied unchanged.

use crate::error::RehostError;
use crate::output::DocumentReport;
use crate::persist::{self, backup_path_for};
use crate::pipeline::extract::{DocumentFormat, UrlRecord};
use crate::pipeline::mapping::UrlMap;
use encoding_rs::{Encoding, GBK, UTF_8, WINDOWS_1252};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A source document held in memory.
#[derive(Debug, Clone)]
pub struct Document {
    pub path: PathBuf,
    pub text: String,
    pub format: DocumentFormat,
    /// Encoding the file was decoded from; rewrites are written back in it.
    pub encoding: &'static Encoding,
}

/// Decode document bytes: UTF-8 first, then GBK (a superset of GB2312), then
/// Latin-1, which accepts any byte sequence.
pub fn decode_text(bytes: &[u8]) -> (String, &'static Encoding) {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return (text.to_string(), UTF_8);
    }
    if let Some(text) = GBK.decode_without_bom_handling_and_without_replacement(bytes) {
        return (text.into_owned(), GBK);
    }
    let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
    (text.into_owned(), WINDOWS_1252)
}

/// Encode `text` for writing back. Falls back to UTF-8 when the text holds
/// characters the original encoding cannot represent.
pub fn encode_text(text: &str, encoding: &'static Encoding, path: &Path) -> Vec<u8> {
    if encoding == UTF_8 {
        return text.as_bytes().to_vec();
    }
    let (bytes, _, unmappable) = encoding.encode(text);
    if unmappable {
        warn!(
            "{} cannot hold the rewritten text as {}; writing UTF-8 instead",
            path.display(),
            encoding.name()
        );
        return text.as_bytes().to_vec();
    }
    bytes.into_owned()
}

/// Read a document. Unknown extensions are rejected; content that is not
/// UTF-8 is decoded with [`decode_text`].
pub async fn read_document(path: &Path) -> Result<Document, RehostError> {
    let format = DocumentFormat::from_path(path).ok_or_else(|| RehostError::FormatUnsupported {
        path: path.to_path_buf(),
        reason: "expected .txt, .md, .markdown, .html or .htm".into(),
    })?;
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RehostError::SourceNotFound {
                path: path.to_path_buf(),
            }
        } else {
            RehostError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;
    let (text, encoding) = decode_text(&bytes);
    if encoding != UTF_8 {
        debug!("Decoded {} as {}", path.display(), encoding.name());
    }
    Ok(Document {
        path: path.to_path_buf(),
        text,
        format,
        encoding,
    })
}

/// Result of [`apply_mapping`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub text: String,
    /// Occurrences substituted.
    pub replacements: usize,
    /// Distinct keys substituted, in order of first substitution.
    pub replaced: Vec<String>,
    /// Records with no mapping entry, or whose entry matched nowhere in the
    /// text as a standalone URL.
    pub unresolved: Vec<String>,
}

// ASCII only: URLs in running text are ASCII, and CJK prose may touch them
// directly on either side.
fn is_url_char_before(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | '%' | '+' | '~')
}

fn is_url_char_after(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '?' | '&' | '=' | '%' | '-' | '_' | '~' | '#' | '+')
}

/// Whether `text[start..end]` is a standalone occurrence.
fn is_standalone(text: &str, start: usize, end: usize) -> bool {
    if let Some(prev) = text[..start].chars().next_back() {
        if is_url_char_before(prev) {
            return false;
        }
    }
    let mut after = text[end..].chars();
    match after.next() {
        None => true,
        Some('.') => !after.next().is_some_and(|c| c.is_ascii_alphanumeric()),
        Some(c) => !is_url_char_after(c),
    }
}

/// Substitute every standalone occurrence of each mapping key.
pub fn apply_mapping(text: &str, mapping: &UrlMap, records: &[UrlRecord]) -> Rewrite {
    // (start, len, value)
    let mut hits: Vec<(usize, usize, &str)> = Vec::new();
    for (key, value) in mapping.iter() {
        if key.is_empty() {
            continue;
        }
        for (start, _) in text.match_indices(key) {
            if is_standalone(text, start, start + key.len()) {
                hits.push((start, key.len(), value));
            }
        }
    }
    hits.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;
    let mut replacements = 0usize;
    let mut replaced = Vec::new();
    let mut seen = HashSet::new();

    for (start, len, value) in hits {
        if start < cursor {
            continue;
        }
        out.push_str(&text[cursor..start]);
        out.push_str(value);
        let key = &text[start..start + len];
        if seen.insert(key) {
            replaced.push(key.to_string());
        }
        cursor = start + len;
        replacements += 1;
    }
    out.push_str(&text[cursor..]);

    let unresolved = records
        .iter()
        .filter(|r| !seen.contains(r.original_url.as_str()))
        .map(|r| r.original_url.clone())
        .collect();

    Rewrite {
        text: out,
        replacements,
        replaced,
        unresolved,
    }
}

/// Where and how to write a rewritten document.
#[derive(Debug, Clone, Default)]
pub struct RewriteOptions {
    /// Copy the original to `<file>.backup` before overwriting it.
    pub backup: bool,
    /// Write here instead of over the original.
    pub output_path: Option<PathBuf>,
}

/// Apply `mapping` to `doc` and write the result.
///
/// In-place writes back the original up first; the new text is written to a
/// temporary sibling and renamed over the target, so a failure at any point
/// leaves the original intact. When nothing was replaced and the target is
/// the original, nothing is written at all.
pub async fn rewrite_document(
    doc: &Document,
    mapping: &UrlMap,
    records: &[UrlRecord],
    options: &RewriteOptions,
) -> Result<DocumentReport, RehostError> {
    let rewrite = apply_mapping(&doc.text, mapping, records);
    let target = options
        .output_path
        .clone()
        .unwrap_or_else(|| doc.path.clone());
    let in_place = target == doc.path;

    let mut report = DocumentReport {
        path: doc.path.clone(),
        output_path: None,
        backup_path: None,
        found: records.len(),
        replacements: rewrite.replacements,
        replaced_urls: rewrite.replaced,
        unresolved: rewrite.unresolved,
        written: false,
    };

    if in_place && rewrite.replacements == 0 {
        debug!("No replacements in {}; leaving it untouched", doc.path.display());
        return Ok(report);
    }

    if in_place && options.backup {
        let backup = backup_path_for(&doc.path);
        persist::write_atomic(&backup, encode_text(&doc.text, doc.encoding, &doc.path))
            .await
            .map_err(|e| RehostError::OutputWriteFailed {
                path: backup.clone(),
                source: e,
            })?;
        debug!("Backed up {} to {}", doc.path.display(), backup.display());
        report.backup_path = Some(backup);
    }

    let bytes = encode_text(&rewrite.text, doc.encoding, &doc.path);
    persist::write_atomic(&target, bytes)
        .await
        .map_err(|e| RehostError::OutputWriteFailed {
            path: target.clone(),
            source: e,
        })?;

    info!(
        "Rewrote {} ({} replacement(s)) -> {}",
        doc.path.display(),
        report.replacements,
        target.display()
    );
    report.output_path = Some(target);
    report.written = true;
    Ok(report)
}

/// Copy `<file>.backup` back over `path`. Returns the backup path.
///
/// The backup itself is left in place.
pub async fn restore_from_backup(path: &Path) -> Result<PathBuf, RehostError> {
    let backup = backup_path_for(path);
    let bytes = match tokio::fs::read(&backup).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RehostError::BackupMissing { path: backup })
        }
        Err(e) => {
            return Err(RehostError::ReadFailed {
                path: backup,
                source: e,
            })
        }
    };
    persist::write_atomic(path, bytes)
        .await
        .map_err(|e| RehostError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
    info!("Restored {} from {}", path.display(), backup.display());
    Ok(backup)
}
