//! Orchestration: full runs and single-stage entry points.
//!
//! [`run`] drives every stage in order. Each stage is also exposed on its
//! own ([`extract_source`], [`download_urls`], [`upload_artifacts`],
//! [`replace_source`], [`restore_source`]) so a failed or interrupted run can
//! be resumed stage by stage from the persisted state files.

use crate::config::RehostConfig;
use crate::error::{ErrorKind, ItemError, RehostError};
use crate::output::{
    DocumentReport, FailureRecord, FetchResult, RunOutput, RunReport, Stage, UploadResult,
};
use crate::pipeline::extract::{extract_urls, render_url_list, DocumentFormat, UrlRecord};
use crate::pipeline::mapping::{
    self, reconcile, validate_mapping, MappingStage, MappingStore, Reconciled, UploadScope, UrlMap,
};
use crate::pipeline::rewrite::{
    read_document, restore_from_backup, rewrite_document, Document, RewriteOptions,
};
use crate::pipeline::{fetch, upload};
use crate::persist::backup_path_for;
use crate::store::{MediaStore, Session, WeChatStore};
use crate::stream;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One scanned document and the URLs found in it.
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub document: Document,
    pub records: Vec<UrlRecord>,
}

/// Output of the extract stage.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// The source as given: a file or a directory.
    pub root: PathBuf,
    pub is_dir: bool,
    pub documents: Vec<ExtractedDocument>,
    /// Union of every document's URLs, in first-seen order.
    pub records: Vec<UrlRecord>,
    /// Documents that could not be read (directory sources only).
    pub failures: Vec<FailureRecord>,
}

/// Output of the fetch stage.
#[derive(Debug, Clone)]
pub struct DownloadOutput {
    /// One result per distinct URL, in record order.
    pub results: Vec<FetchResult>,
    /// original_url → local_path, including resumed entries.
    pub local: UrlMap,
}

/// Output of the upload stage.
#[derive(Debug, Clone)]
pub struct UploadOutput {
    /// One result per distinct artifact, in submission order.
    pub results: Vec<UploadResult>,
    /// local_path → remote_url, including resumed entries.
    pub remote: UrlMap,
}

// ── Entry points ─────────────────────────────────────────────────────────

/// Rehost every image referenced by `source` (a document or a directory of
/// documents).
///
/// # Returns
/// `Ok(RunOutput)` even when individual URLs failed; check
/// `output.report.failures`.
///
/// # Errors
/// Returns `Err(RehostError)` only for fatal errors:
/// - source missing or (single file) unreadable
/// - credentials rejected, at exchange or mid-run
/// - state or output files not writable
pub async fn run(
    source: impl AsRef<Path>,
    config: &RehostConfig,
) -> Result<RunOutput, RehostError> {
    let started = Instant::now();
    let source = source.as_ref();
    info!("Starting rehost run: {}", source.display());
    let mappings = MappingStore::new(&config.state_dir);

    // ── Step 1: Extract ──────────────────────────────────────────────────
    let extraction = extract_source(source, config).await?;
    let records = extraction.records.clone();
    let mut failures = extraction.failures.clone();

    let cancel = CancellationToken::new();
    let _timeout = RunTimeout::arm(config.run_timeout_secs, &cancel);

    let (fetches, uploads, mapping) = if records.is_empty() {
        info!("No image URLs found; nothing to rehost");
        (Vec::new(), Vec::new(), UrlMap::new())
    } else {
        // ── Step 2: Authenticate ─────────────────────────────────────────
        let store = resolve_store(config)?;
        let session = upload::authenticate(store.as_ref(), &config.credentials, &config.retry).await?;

        // ── Step 3: Fetch ────────────────────────────────────────────────
        let downloaded = fetch_stage(&records, config, &cancel, &mappings).await?;
        let mut paths = Vec::new();
        let mut path_to_url: HashMap<PathBuf, String> = HashMap::new();
        for r in &downloaded.results {
            match (&r.error, &r.local_path) {
                (Some(e), _) => failures.push(FailureRecord::from_item(&r.original_url, Stage::Fetch, e)),
                (None, Some(p)) => {
                    if !path_to_url.contains_key(p) {
                        path_to_url.insert(p.clone(), r.original_url.clone());
                        paths.push(p.clone());
                    }
                }
                (None, None) => {}
            }
        }

        // ── Step 4: Upload ───────────────────────────────────────────────
        let uploaded = upload_stage(store, session, paths, config, &cancel, &mappings).await?;
        for r in &uploaded.results {
            if let Some(ref e) = r.error {
                let url = path_to_url
                    .get(&r.local_path)
                    .cloned()
                    .unwrap_or_else(|| r.local_path.display().to_string());
                failures.push(FailureRecord::from_item(url, Stage::Upload, e));
            }
        }

        // ── Step 5: Reconcile ────────────────────────────────────────────
        let Reconciled { mapping, unmapped } =
            reconcile(&records, &downloaded.local, &uploaded.remote);
        for u in unmapped.into_iter().filter(|u| u.stage == Stage::Map) {
            warn!("Not mapping {}: {}", u.url, u.reason);
            failures.push(FailureRecord {
                url: u.url,
                stage: Stage::Map,
                error_kind: ErrorKind::NetworkPermanent,
                detail: u.reason,
            });
        }
        if config.save_mapping {
            mappings.save(MappingStage::Final, &mapping).await?;
        }
        info!("Mapped {}/{} URL(s)", mapping.len(), records.len());

        (downloaded.results, uploaded.results, mapping)
    };

    // ── Step 6: Rewrite ──────────────────────────────────────────────────
    let documents = rewrite_stage(&extraction, &mapping, config, &mut failures).await?;

    // ── Step 7: Report ───────────────────────────────────────────────────
    let replaced: HashSet<&str> = documents
        .iter()
        .flat_map(|d| d.replaced_urls.iter().map(String::as_str))
        .collect();
    let report = RunReport {
        found: records.len(),
        fetched: fetches.iter().filter(|f| f.is_ok()).count(),
        uploaded: uploads.iter().filter(|u| u.is_ok()).count(),
        mapped: mapping.len(),
        replaced: replaced.len(),
        unresolved: records
            .iter()
            .map(|r| r.original_url.as_str())
            .filter(|u| !mapping.contains_key(u))
            .chain(
                documents
                    .iter()
                    .flat_map(|d| d.unresolved.iter().map(String::as_str)),
            )
            .collect::<HashSet<_>>()
            .len(),
        replacement_count: documents.iter().map(|d| d.replacements).sum(),
        documents,
        failures,
        duration_ms: started.elapsed().as_millis() as u64,
    };

    info!(
        "Run complete: {} found, {} fetched, {} uploaded, {} replaced, {} failure(s), {}ms",
        report.found,
        report.fetched,
        report.uploaded,
        report.replaced,
        report.failures.len(),
        report.duration_ms
    );

    Ok(RunOutput {
        report,
        mapping,
        fetches,
        uploads,
    })
}

/// Synchronous wrapper around [`run`].
///
/// Creates a temporary tokio runtime internally.
pub fn run_sync(
    source: impl AsRef<Path>,
    config: &RehostConfig,
) -> Result<RunOutput, RehostError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| RehostError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(run(source, config))
}

/// Scan `source` for image URLs and, when `save_mapping` is on, write the
/// URL list to the state directory.
pub async fn extract_source(
    source: impl AsRef<Path>,
    config: &RehostConfig,
) -> Result<Extraction, RehostError> {
    let extraction = scan_source(source.as_ref(), config).await?;
    if config.save_mapping {
        let path = MappingStore::new(&config.state_dir)
            .save_url_list(render_url_list(&extraction.records))
            .await?;
        debug!("Wrote URL list to {}", path.display());
    }
    Ok(extraction)
}

/// Fetch `records` into the download directory and persist the stage map.
pub async fn download_urls(
    records: &[UrlRecord],
    config: &RehostConfig,
) -> Result<DownloadOutput, RehostError> {
    let cancel = CancellationToken::new();
    let _timeout = RunTimeout::arm(config.run_timeout_secs, &cancel);
    let mappings = MappingStore::new(&config.state_dir);
    fetch_stage(records, config, &cancel, &mappings).await
}

/// Authenticate and upload `paths`, persisting the stage map.
///
/// Successful uploads are persisted even when the store rejects the session
/// part-way; the error is returned afterwards.
pub async fn upload_artifacts(
    paths: &[PathBuf],
    config: &RehostConfig,
) -> Result<UploadOutput, RehostError> {
    let store = resolve_store(config)?;
    let session = upload::authenticate(store.as_ref(), &config.credentials, &config.retry).await?;
    let cancel = CancellationToken::new();
    let _timeout = RunTimeout::arm(config.run_timeout_secs, &cancel);
    let mappings = MappingStore::new(&config.state_dir);
    upload_stage(store, session, paths.to_vec(), config, &cancel, &mappings).await
}

/// Rebuild the final mapping from the two persisted stage maps.
///
/// Used after running download and upload as separate steps. The saved
/// stage-1 keys stand in for the extracted records.
pub async fn reconcile_state(config: &RehostConfig) -> Result<Reconciled, RehostError> {
    let mappings = MappingStore::new(&config.state_dir);
    let local = mappings.load(MappingStage::Local).await?;
    let remote = mappings.load(MappingStage::Remote).await?;
    let records: Vec<UrlRecord> = local.keys().map(UrlRecord::new).collect();
    let reconciled = reconcile(&records, &local, &remote);
    if config.save_mapping {
        mappings.save(MappingStage::Final, &reconciled.mapping).await?;
    }
    Ok(reconciled)
}

/// Rewrite every document under `source` with `mapping`.
///
/// The mapping is validated first: blank and self-mapping entries are
/// dropped with a warning.
pub async fn replace_source(
    source: impl AsRef<Path>,
    mapping: &UrlMap,
    config: &RehostConfig,
) -> Result<Vec<DocumentReport>, RehostError> {
    let (mapping, dropped) = validate_mapping(mapping);
    if !dropped.is_empty() {
        warn!("Dropped {} invalid mapping entr(ies)", dropped.len());
    }
    let extraction = scan_source(source.as_ref(), config).await?;
    let mut failures = extraction.failures.clone();
    let reports = rewrite_stage(&extraction, &mapping, config, &mut failures).await?;
    for f in &failures {
        warn!("{} failed for {}: {}", f.stage, f.url, f.detail);
    }
    Ok(reports)
}

/// Load a user-supplied mapping file (missing or malformed is an error).
pub async fn load_mapping(path: impl AsRef<Path>) -> Result<UrlMap, RehostError> {
    let path = path.as_ref();
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Err(RehostError::SourceNotFound {
            path: path.to_path_buf(),
        });
    }
    mapping::load_mapping_file(path).await
}

/// Restore documents under `source` from their `.backup` copies.
///
/// A single file without a backup is an error; in a directory, documents
/// without one are skipped. Returns the restored document paths.
pub async fn restore_source(
    source: impl AsRef<Path>,
    config: &RehostConfig,
) -> Result<Vec<PathBuf>, RehostError> {
    let source = source.as_ref();
    let (is_dir, paths) = collect_paths(source, config).await?;
    if !is_dir {
        restore_from_backup(source).await?;
        return Ok(vec![source.to_path_buf()]);
    }
    let mut restored = Vec::new();
    for path in paths {
        if tokio::fs::try_exists(backup_path_for(&path))
            .await
            .unwrap_or(false)
        {
            restore_from_backup(&path).await?;
            restored.push(path);
        }
    }
    info!("Restored {} document(s)", restored.len());
    Ok(restored)
}

// ── Stages ───────────────────────────────────────────────────────────────

async fn scan_source(source: &Path, config: &RehostConfig) -> Result<Extraction, RehostError> {
    let (is_dir, paths) = collect_paths(source, config).await?;
    let cb = config.progress_callback.as_ref();
    if let Some(cb) = cb {
        cb.on_stage_start(Stage::Extract, paths.len());
    }

    let mut documents = Vec::new();
    let mut failures = Vec::new();
    let mut records = Vec::new();
    let mut seen = HashSet::new();

    for path in paths {
        let label = path.display().to_string();
        match read_document(&path).await {
            Ok(document) => {
                let found = extract_urls(&document.text, document.format);
                debug!("{}: {} image URL(s)", label, found.len());
                for r in &found {
                    if seen.insert(r.original_url.clone()) {
                        records.push(r.clone());
                    }
                }
                if let Some(cb) = cb {
                    cb.on_item_complete(Stage::Extract, &label);
                }
                documents.push(ExtractedDocument {
                    document,
                    records: found,
                });
            }
            Err(e) if !is_dir => return Err(e),
            Err(e) => {
                warn!("Skipping {}: {}", label, e);
                if let Some(cb) = cb {
                    cb.on_item_error(Stage::Extract, &label, &e.to_string());
                }
                let error_kind = match e {
                    RehostError::FormatUnsupported { .. } => ErrorKind::FormatUnsupported,
                    _ => ErrorKind::IoFailure,
                };
                failures.push(FailureRecord {
                    url: label,
                    stage: Stage::Extract,
                    error_kind,
                    detail: e.to_string(),
                });
            }
        }
    }

    if let Some(cb) = cb {
        cb.on_stage_complete(Stage::Extract, documents.len() + failures.len(), documents.len());
    }
    info!(
        "Found {} distinct image URL(s) in {} document(s)",
        records.len(),
        documents.len()
    );

    Ok(Extraction {
        root: source.to_path_buf(),
        is_dir,
        documents,
        records,
        failures,
    })
}

async fn fetch_stage(
    records: &[UrlRecord],
    config: &RehostConfig,
    cancel: &CancellationToken,
    mappings: &MappingStore,
) -> Result<DownloadOutput, RehostError> {
    tokio::fs::create_dir_all(&config.download_dir)
        .await
        .map_err(|e| RehostError::StateWriteFailed {
            path: config.download_dir.clone(),
            source: e,
        })?;

    let previous = if config.resume {
        mappings.load(MappingStage::Local).await?
    } else {
        UrlMap::new()
    };

    let mut order: HashMap<&str, usize> = HashMap::new();
    let mut results = Vec::new();
    let mut pending = Vec::new();
    for record in records {
        let url = record.original_url.as_str();
        if order.contains_key(url) {
            continue;
        }
        order.insert(url, order.len());
        if let Some(p) = previous.get(url) {
            if let Ok(meta) = tokio::fs::metadata(p).await {
                if meta.is_file() {
                    results.push(FetchResult {
                        original_url: record.original_url.clone(),
                        local_path: Some(PathBuf::from(p)),
                        byte_size: Some(meta.len()),
                        dimensions: None,
                        attempts: 0,
                        resumed: true,
                        error: None,
                    });
                    continue;
                }
            }
        }
        pending.push(record.clone());
    }
    if !results.is_empty() {
        info!("Resuming {} previously downloaded image(s)", results.len());
    }

    let total = pending.len();
    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_start(Stage::Fetch, total);
    }
    info!(
        "Fetching {} image(s) with concurrency {}",
        total, config.concurrency
    );

    let client = fetch::build_client(config)?;
    let fetched: Vec<FetchResult> = stream::fetch_stream(client, pending, config, cancel.clone())
        .collect()
        .await;
    let fetched_ok = fetched.iter().filter(|r| r.is_ok()).count();
    results.extend(fetched);
    results.sort_by_key(|r| order.get(r.original_url.as_str()).copied().unwrap_or(usize::MAX));

    let mut local = previous;
    let failed: HashSet<&str> = results
        .iter()
        .filter(|r| !r.is_ok())
        .map(|r| r.original_url.as_str())
        .collect();
    local.retain(|k, _| !failed.contains(k));
    for r in &results {
        if let (None, Some(p)) = (&r.error, &r.local_path) {
            local.insert(r.original_url.as_str(), p.to_string_lossy());
        }
    }
    if config.save_mapping {
        mappings.save(MappingStage::Local, &local).await?;
    }

    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_complete(Stage::Fetch, total, fetched_ok);
    }
    info!("Fetched {}/{} image(s)", fetched_ok, total);

    Ok(DownloadOutput { results, local })
}

async fn upload_stage(
    store: Arc<dyn MediaStore>,
    session: Session,
    paths: Vec<PathBuf>,
    config: &RehostConfig,
    cancel: &CancellationToken,
    mappings: &MappingStore,
) -> Result<UploadOutput, RehostError> {
    let scope = UploadScope {
        store: store.identity(),
        mode: config.upload_mode,
        app_id: config.credentials.app_id.clone(),
    };
    let previous = if config.resume {
        let saved = mappings.load(MappingStage::Remote).await?;
        if saved.is_empty() || mappings.load_scope().await?.as_ref() == Some(&scope) {
            saved
        } else {
            warn!(
                "Not resuming {} saved upload(s): they belong to another store, mode or account",
                saved.len()
            );
            UrlMap::new()
        }
    } else {
        UrlMap::new()
    };

    let mut order: HashMap<PathBuf, usize> = HashMap::new();
    let mut results = Vec::new();
    let mut pending = Vec::new();
    for path in paths {
        if order.contains_key(&path) {
            continue;
        }
        order.insert(path.clone(), order.len());
        let key = path.to_string_lossy();
        match previous.get(&key) {
            Some(remote_url) => results.push(UploadResult {
                local_path: path.clone(),
                remote_url: Some(remote_url.to_string()),
                remote_id: None,
                attempts: 0,
                resumed: true,
                error: None,
            }),
            None => pending.push(path.clone()),
        }
    }
    if !results.is_empty() {
        info!("Resuming {} previously uploaded image(s)", results.len());
    }

    let total = pending.len();
    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_start(Stage::Upload, total);
    }
    info!(
        "Uploading {} image(s) to '{}' ({} mode)",
        total,
        store.name(),
        config.upload_mode
    );

    let store_name = store.name().to_string();
    let uploaded: Vec<UploadResult> =
        stream::upload_stream(store, session, pending, config, cancel.clone())
            .collect()
            .await;
    let uploaded_ok = uploaded.iter().filter(|r| r.is_ok()).count();
    results.extend(uploaded);
    results.sort_by_key(|r| order.get(&r.local_path).copied().unwrap_or(usize::MAX));

    let mut remote = previous;
    for r in &results {
        if let (None, Some(url)) = (&r.error, &r.remote_url) {
            remote.insert(r.local_path.to_string_lossy(), url.as_str());
        }
    }
    if config.save_mapping {
        mappings.save_scope(&scope).await?;
        mappings.save(MappingStage::Remote, &remote).await?;
    }

    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_complete(Stage::Upload, total, uploaded_ok);
    }

    if let Some(e) = results
        .iter()
        .filter_map(|r| r.error.as_ref())
        .find(|e| matches!(e, ItemError::Auth { .. }))
    {
        return Err(RehostError::AuthFailed {
            store: store_name,
            detail: e.to_string(),
        });
    }

    info!("Uploaded {}/{} image(s)", uploaded_ok, total);
    Ok(UploadOutput { results, remote })
}

async fn rewrite_stage(
    extraction: &Extraction,
    mapping: &UrlMap,
    config: &RehostConfig,
    failures: &mut Vec<FailureRecord>,
) -> Result<Vec<DocumentReport>, RehostError> {
    let total = extraction.documents.len();
    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_start(Stage::Rewrite, total);
    }

    let mut reports = Vec::with_capacity(total);
    for ed in &extraction.documents {
        let label = ed.document.path.display().to_string();
        let options = RewriteOptions {
            backup: config.backup,
            output_path: output_path_for(extraction, &ed.document.path, config),
        };
        match rewrite_document(&ed.document, mapping, &ed.records, &options).await {
            Ok(report) => {
                if let Some(ref cb) = config.progress_callback {
                    cb.on_item_complete(Stage::Rewrite, &label);
                }
                reports.push(report);
            }
            Err(e) if !extraction.is_dir => return Err(e),
            Err(e) => {
                warn!("Could not rewrite {}: {}", label, e);
                if let Some(ref cb) = config.progress_callback {
                    cb.on_item_error(Stage::Rewrite, &label, &e.to_string());
                }
                failures.push(FailureRecord {
                    url: label,
                    stage: Stage::Rewrite,
                    error_kind: ErrorKind::IoFailure,
                    detail: e.to_string(),
                });
            }
        }
    }

    if let Some(ref cb) = config.progress_callback {
        cb.on_stage_complete(Stage::Rewrite, total, reports.len());
    }
    Ok(reports)
}

// ── Internal helpers ─────────────────────────────────────────────────────

/// Configured store, or a WeChat store with the upload timeout.
fn resolve_store(config: &RehostConfig) -> Result<Arc<dyn MediaStore>, RehostError> {
    if let Some(ref store) = config.store {
        return Ok(Arc::clone(store));
    }
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.upload_timeout_secs))
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| RehostError::Internal(format!("Failed to build HTTP client: {e}")))?;
    Ok(Arc::new(WeChatStore::new(client)))
}

/// Documents under `source`: the file itself, or every supported document
/// in the directory (sorted, recursive when configured).
async fn collect_paths(
    source: &Path,
    config: &RehostConfig,
) -> Result<(bool, Vec<PathBuf>), RehostError> {
    let meta = tokio::fs::metadata(source)
        .await
        .map_err(|_| RehostError::SourceNotFound {
            path: source.to_path_buf(),
        })?;
    if !meta.is_dir() {
        return Ok((false, vec![source.to_path_buf()]));
    }

    let mut out = Vec::new();
    let mut stack = vec![source.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut rd = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| RehostError::ReadFailed {
                path: dir.clone(),
                source: e,
            })?;
        while let Some(entry) = rd.next_entry().await.map_err(|e| RehostError::ReadFailed {
            path: dir.clone(),
            source: e,
        })? {
            let path = entry.path();
            let Ok(ft) = entry.file_type().await else {
                continue;
            };
            if ft.is_dir() {
                let hidden = path
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with('.'))
                    .unwrap_or(false);
                let is_output = config.output.as_deref() == Some(path.as_path());
                if config.recursive && !hidden && !is_output {
                    stack.push(path);
                }
            } else if DocumentFormat::from_path(&path).is_some() {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok((true, out))
}

/// Where a document's rewritten text goes: in place, the configured file,
/// or the mirrored path under the configured output directory.
fn output_path_for(extraction: &Extraction, doc_path: &Path, config: &RehostConfig) -> Option<PathBuf> {
    let output = config.output.as_ref()?;
    if !extraction.is_dir {
        return Some(output.clone());
    }
    doc_path
        .strip_prefix(&extraction.root)
        .ok()
        .map(|rel| output.join(rel))
}

/// Cancels the run token after a deadline; disarmed on drop.
struct RunTimeout(Option<JoinHandle<()>>);

impl RunTimeout {
    fn arm(secs: Option<u64>, cancel: &CancellationToken) -> Self {
        RunTimeout(secs.map(|secs| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                warn!("Run timeout of {}s reached; no new items will be started", secs);
                cancel.cancel();
            })
        }))
    }
}

impl Drop for RunTimeout {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use tempfile::TempDir;

    fn offline_config(dir: &Path) -> RehostConfig {
        RehostConfig::builder()
            .state_dir(dir.join("state"))
            .download_dir(dir.join("downloads"))
            .store(Arc::new(InMemoryStore::new()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn missing_source_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = run(dir.path().join("nope.md"), &offline_config(dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, RehostError::SourceNotFound { .. }));
    }

    #[tokio::test]
    async fn document_without_images_is_untouched() {
        let dir = TempDir::new().unwrap();
        let doc = dir.path().join("plain.md");
        std::fs::write(&doc, "# Title\n\nNo pictures here.\n").unwrap();

        let store = Arc::new(InMemoryStore::new());
        let config = RehostConfig::builder()
            .state_dir(dir.path().join("state"))
            .download_dir(dir.path().join("downloads"))
            .store(store.clone())
            .build()
            .unwrap();
        let out = run(&doc, &config).await.unwrap();

        assert_eq!(out.report.found, 0);
        assert!(out.report.is_complete());
        assert!(!backup_path_for(&doc).exists());
        assert_eq!(store.auth_calls(), 0);
    }

    #[tokio::test]
    async fn directory_scan_unions_urls_and_records_unreadable_documents() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("a.md"), "![](http://x.com/1.png) ![](http://x.com/2.png)").unwrap();
        std::fs::write(src.join("nested/b.html"), "<img src=\"http://x.com/2.png\"><img src=\"http://x.com/3.gif\">").unwrap();
        let (gbk, _, _) = encoding_rs::GBK.encode("见http://x.com/4.jpg，完");
        std::fs::write(src.join("c.txt"), &gbk).unwrap();
        std::fs::write(src.join("ignored.pdf"), "x").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(dir.path().join("gone.md"), src.join("d.md")).unwrap();

        let config = offline_config(dir.path());
        let extraction = extract_source(&src, &config).await.unwrap();

        assert!(extraction.is_dir);
        assert_eq!(extraction.documents.len(), 3);
        let urls: Vec<&str> = extraction
            .records
            .iter()
            .map(|r| r.original_url.as_str())
            .collect();
        assert_eq!(
            urls,
            vec!["http://x.com/1.png", "http://x.com/2.png", "http://x.com/4.jpg", "http://x.com/3.gif"]
        );
        #[cfg(unix)]
        {
            assert_eq!(extraction.failures.len(), 1);
            assert_eq!(extraction.failures[0].error_kind, ErrorKind::IoFailure);
        }

        let list = std::fs::read_to_string(dir.path().join("state/extracted_urls.txt")).unwrap();
        assert_eq!(list.lines().count(), 4);
    }

    #[tokio::test]
    async fn non_recursive_scan_skips_subdirectories() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("a.md"), "![](http://x.com/1.png)").unwrap();
        std::fs::write(src.join("nested/b.md"), "![](http://x.com/2.png)").unwrap();

        let config = RehostConfig::builder()
            .recursive(false)
            .save_mapping(false)
            .build()
            .unwrap();
        let extraction = extract_source(&src, &config).await.unwrap();
        assert_eq!(extraction.records.len(), 1);
    }

    #[tokio::test]
    async fn replace_source_uses_validated_mapping() {
        let dir = TempDir::new().unwrap();
        let doc = dir.path().join("a.md");
        std::fs::write(&doc, "![](http://x.com/1.png) ![](http://x.com/2.png)").unwrap();

        let mapping: UrlMap = [
            ("http://x.com/1.png", "https://cdn/1"),
            ("http://x.com/2.png", "http://x.com/2.png"),
        ]
        .into_iter()
        .collect();
        let reports = replace_source(&doc, &mapping, &offline_config(dir.path()))
            .await
            .unwrap();

        assert_eq!(reports[0].replacements, 1);
        assert_eq!(reports[0].unresolved, vec!["http://x.com/2.png"]);
        assert_eq!(
            std::fs::read_to_string(&doc).unwrap(),
            "![](https://cdn/1) ![](http://x.com/2.png)"
        );
    }

    #[tokio::test]
    async fn restore_directory_skips_documents_without_backup() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.md"), "new").unwrap();
        std::fs::write(src.join("a.md.backup"), "old").unwrap();
        std::fs::write(src.join("b.md"), "untouched").unwrap();

        let restored = restore_source(&src, &RehostConfig::default()).await.unwrap();
        assert_eq!(restored, vec![src.join("a.md")]);
        assert_eq!(std::fs::read_to_string(src.join("a.md")).unwrap(), "old");
        assert_eq!(std::fs::read_to_string(src.join("b.md")).unwrap(), "untouched");
    }

    #[test]
    fn mirrored_output_path() {
        let extraction = Extraction {
            root: PathBuf::from("docs"),
            is_dir: true,
            documents: vec![],
            records: vec![],
            failures: vec![],
        };
        let config = RehostConfig::builder().output("out").build().unwrap();
        assert_eq!(
            output_path_for(&extraction, Path::new("docs/a/b.md"), &config),
            Some(PathBuf::from("out/a/b.md"))
        );
        let none = RehostConfig::default();
        assert_eq!(output_path_for(&extraction, Path::new("docs/a/b.md"), &none), None);
    }
}
