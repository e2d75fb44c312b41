//! Streaming stage API: emit per-item results as they complete.
//!
//! Both stages run a bounded pool via `buffer_unordered(concurrency)`, so
//! results arrive in completion order, not submission order. Callers that
//! need document order join on the key (`original_url` / `local_path`).
//!
//! Cancellation is cooperative: each item checks the [`CancellationToken`]
//! before it starts. Items already in flight finish under their own timeout;
//! items not yet started come back as [`ItemError::Cancelled`].

use crate::config::RehostConfig;
use crate::error::{ErrorKind, ItemError};
use crate::output::{FetchResult, Stage, UploadResult};
use crate::pipeline::extract::UrlRecord;
use crate::pipeline::{fetch, upload};
use crate::store::{MediaStore, Session};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A boxed stream of fetch results.
pub type FetchStream = Pin<Box<dyn Stream<Item = FetchResult> + Send>>;

/// A boxed stream of upload results.
pub type UploadStream = Pin<Box<dyn Stream<Item = UploadResult> + Send>>;

/// Fetch every record with at most `config.concurrency` requests in flight.
///
/// Records with the same URL are fetched once; the stream yields one result
/// per distinct URL.
pub fn fetch_stream(
    client: reqwest::Client,
    records: Vec<UrlRecord>,
    config: &RehostConfig,
    cancel: CancellationToken,
) -> FetchStream {
    let mut seen = HashSet::new();
    let records: Vec<UrlRecord> = records
        .into_iter()
        .filter(|r| seen.insert(r.original_url.clone()))
        .collect();

    let concurrency = config.concurrency;
    let cfg = config.clone();

    let s = stream::iter(records.into_iter().map(move |record| {
        let client = client.clone();
        let cfg = cfg.clone();
        let cancel = cancel.clone();
        async move {
            if cancel.is_cancelled() {
                return FetchResult::failed(record.original_url, ItemError::Cancelled, 0);
            }
            let result = fetch::fetch_one(&client, &record, &cfg).await;
            if let Some(ref cb) = cfg.progress_callback {
                match &result.error {
                    None => cb.on_item_complete(Stage::Fetch, &result.original_url),
                    Some(e) => cb.on_item_error(Stage::Fetch, &result.original_url, &e.to_string()),
                }
            }
            result
        }
    }))
    .buffer_unordered(concurrency);

    Box::pin(s)
}

/// Upload every artifact with at most `config.concurrency` calls in flight.
///
/// An authentication failure on any item cancels `cancel`: uploads not yet
/// started are skipped, since every one of them would fail the same way.
pub fn upload_stream(
    store: Arc<dyn MediaStore>,
    session: Session,
    paths: Vec<PathBuf>,
    config: &RehostConfig,
    cancel: CancellationToken,
) -> UploadStream {
    let mut seen = HashSet::new();
    let paths: Vec<PathBuf> = paths
        .into_iter()
        .filter(|p| seen.insert(p.clone()))
        .collect();

    let concurrency = config.concurrency;
    let cfg = config.clone();
    let session = Arc::new(session);

    let s = stream::iter(paths.into_iter().map(move |path| {
        let store = Arc::clone(&store);
        let session = Arc::clone(&session);
        let cfg = cfg.clone();
        let cancel = cancel.clone();
        async move {
            if cancel.is_cancelled() {
                return UploadResult::failed(&path, ItemError::Cancelled, 0);
            }
            let result = upload::upload_one(store.as_ref(), &session, &path, &cfg).await;
            let label = path.display().to_string();
            match &result.error {
                Some(e) if e.kind() == ErrorKind::AuthFailure => {
                    warn!("Store rejected the session; stopping further uploads");
                    cancel.cancel();
                    if let Some(ref cb) = cfg.progress_callback {
                        cb.on_item_error(Stage::Upload, &label, &e.to_string());
                    }
                }
                Some(e) => {
                    if let Some(ref cb) = cfg.progress_callback {
                        cb.on_item_error(Stage::Upload, &label, &e.to_string());
                    }
                }
                None => {
                    if let Some(ref cb) = cfg.progress_callback {
                        cb.on_item_complete(Stage::Upload, &label);
                    }
                }
            }
            result
        }
    }))
    .buffer_unordered(concurrency);

    Box::pin(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Credentials, InMemoryStore};
    use tempfile::TempDir;

    #[tokio::test]
    async fn cancelled_fetch_stream_submits_nothing() {
        let config = RehostConfig::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let records = vec![
            UrlRecord::new("http://127.0.0.1:9/a.png"),
            UrlRecord::new("http://127.0.0.1:9/b.png"),
            UrlRecord::new("http://127.0.0.1:9/a.png"),
        ];
        let results: Vec<FetchResult> =
            fetch_stream(reqwest::Client::new(), records, &config, cancel)
                .collect()
                .await;

        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| r.error == Some(ItemError::Cancelled) && r.attempts == 0));
    }

    #[tokio::test]
    async fn auth_failure_stops_remaining_uploads() {
        let dir = TempDir::new().unwrap();
        let mut paths = Vec::new();
        for i in 0..4 {
            let p = dir.path().join(format!("{i}.png"));
            std::fs::write(&p, [i as u8; 8]).unwrap();
            paths.push(p);
        }

        let store = Arc::new(InMemoryStore::new());
        let session = store.authenticate(&Credentials::default()).await.unwrap();
        store.revoke_sessions();

        let config = RehostConfig::builder().concurrency(1).build().unwrap();
        let cancel = CancellationToken::new();
        let results: Vec<UploadResult> =
            upload_stream(store.clone(), session, paths, &config, cancel.clone())
                .collect()
                .await;

        assert!(cancel.is_cancelled());
        assert_eq!(results.len(), 4);
        assert_eq!(store.upload_calls(), 1);
        let cancelled = results
            .iter()
            .filter(|r| r.error == Some(ItemError::Cancelled))
            .count();
        assert_eq!(cancelled, 3);
    }
}
