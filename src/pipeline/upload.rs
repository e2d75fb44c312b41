//! Upload stage: republish one local artifact to the media store.

use crate::config::RehostConfig;
use crate::error::{ItemError, RehostError};
use crate::output::UploadResult;
use crate::retry::RetryPolicy;
use crate::store::{content_type_for, Credentials, MediaPayload, MediaStore, RemoteAsset, Session};
use std::path::Path;
use tracing::{debug, info};

/// Exchange credentials for a session, retrying transient failures.
///
/// Any failure that survives the retry policy is fatal for the run.
pub async fn authenticate(
    store: &dyn MediaStore,
    credentials: &Credentials,
    policy: &RetryPolicy,
) -> Result<Session, RehostError> {
    let (outcome, attempts) = policy
        .run("authenticate", |_| store.authenticate(credentials))
        .await;
    match outcome {
        Ok(session) => {
            info!("Authenticated with '{}' store", store.name());
            Ok(session)
        }
        Err(e) => Err(RehostError::AuthFailed {
            store: store.name().to_string(),
            detail: format!("{e} (after {attempts} attempt(s))"),
        }),
    }
}

/// Upload one artifact under the run's retry policy.
///
/// A file larger than the store accepts fails with
/// [`ItemError::SizeExceeded`] before any network call.
pub async fn upload_one(
    store: &dyn MediaStore,
    session: &Session,
    path: &Path,
    config: &RehostConfig,
) -> UploadResult {
    let label = format!("upload {}", path.display());
    let (outcome, attempts) = config
        .retry
        .run(&label, |_| attempt(store, session, path, config))
        .await;

    match outcome {
        Ok(asset) => {
            debug!("Uploaded {} -> {}", path.display(), asset.remote_url);
            UploadResult {
                local_path: path.to_path_buf(),
                remote_url: Some(asset.remote_url),
                remote_id: Some(asset.remote_id),
                attempts,
                resumed: false,
                error: None,
            }
        }
        Err(e) => UploadResult::failed(path, e, attempts),
    }
}

async fn attempt(
    store: &dyn MediaStore,
    session: &Session,
    path: &Path,
    config: &RehostConfig,
) -> Result<RemoteAsset, ItemError> {
    let limit = store.max_upload_bytes(config.upload_mode);
    let meta = tokio::fs::metadata(path).await.map_err(|e| ItemError::io(&e))?;
    if meta.len() > limit {
        return Err(ItemError::SizeExceeded {
            size: meta.len(),
            limit,
        });
    }

    let bytes = tokio::fs::read(path).await.map_err(|e| ItemError::io(&e))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());

    let payload = MediaPayload {
        file_name,
        content_type: content_type_for(path),
        bytes,
    };
    store.upload(session, payload, config.upload_mode).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::retry::Backoff;
    use crate::store::{InMemoryStore, UploadMode};
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_config() -> RehostConfig {
        RehostConfig::builder()
            .retry_policy(RetryPolicy {
                max_attempts: 3,
                backoff: Backoff::Fixed(Duration::ZERO),
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn uploads_file_and_returns_remote_url() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"pngdata").unwrap();

        let store = InMemoryStore::new();
        let session = store.authenticate(&Credentials::default()).await.unwrap();
        let result = upload_one(&store, &session, &path, &fast_config()).await;

        assert!(result.is_ok());
        assert_eq!(result.attempts, 1);
        let accepted = store.accepted();
        assert_eq!(accepted[0].file_name, "a.png");
        assert_eq!(accepted[0].mode, UploadMode::Permanent);
        assert_eq!(result.remote_url.as_deref(), Some(accepted[0].remote_url.as_str()));
    }

    #[tokio::test]
    async fn transient_store_error_is_retried() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.png");
        std::fs::write(&path, b"pngdata").unwrap();

        let store = InMemoryStore::new();
        store.fail_next("a.png", ItemError::transient("503"));
        store.fail_next("a.png", ItemError::transient("503"));
        let session = store.authenticate(&Credentials::default()).await.unwrap();
        let result = upload_one(&store, &session, &path, &fast_config()).await;

        assert!(result.is_ok());
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn oversized_file_never_reaches_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.png");
        std::fs::write(&path, vec![0u8; 64]).unwrap();

        let store = InMemoryStore::new().with_max_upload_bytes(16);
        let session = store.authenticate(&Credentials::default()).await.unwrap();
        let result = upload_one(&store, &session, &path, &fast_config()).await;

        assert_eq!(result.error.unwrap().kind(), ErrorKind::SizeExceeded);
        assert_eq!(store.upload_calls(), 0);
    }

    #[tokio::test]
    async fn missing_file_is_io_failure() {
        let store = InMemoryStore::new();
        let session = store.authenticate(&Credentials::default()).await.unwrap();
        let result = upload_one(
            &store,
            &session,
            Path::new("/nonexistent/a.png"),
            &fast_config(),
        )
        .await;
        let err = result.error.unwrap();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn rejected_credentials_are_fatal() {
        let store = InMemoryStore::new().with_credentials(Credentials::new("id", "right"));
        let err = authenticate(&store, &Credentials::new("id", "wrong"), &RetryPolicy::none())
            .await
            .unwrap_err();
        assert!(matches!(err, RehostError::AuthFailed { ref store, .. } if store == "memory"));
    }
}
