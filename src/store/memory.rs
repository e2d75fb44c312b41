//! In-process media store.
//!
//! Remote URLs are derived from a SHA-256 of the uploaded bytes, so the same
//! image always lands at the same address. That makes repeated runs
//! reproducible without a network, which is what tests and `--dry-run`
//! need. Failures can be scripted per file name.

use super::{Credentials, MediaPayload, MediaStore, RemoteAsset, Session, UploadMode};
use crate::error::ItemError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// One upload accepted by an [`InMemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpload {
    pub file_name: String,
    pub mode: UploadMode,
    pub byte_size: usize,
    pub remote_url: String,
}

#[derive(Default)]
struct State {
    auth_calls: u32,
    upload_calls: u32,
    accepted: Vec<RecordedUpload>,
    scripted: HashMap<String, VecDeque<ItemError>>,
    revoked: bool,
}

/// Deterministic fake [`MediaStore`].
pub struct InMemoryStore {
    expected: Option<Credentials>,
    max_bytes: u64,
    base_url: String,
    state: Mutex<State>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// A store that accepts any credentials.
    pub fn new() -> Self {
        Self {
            expected: None,
            max_bytes: 10 * 1024 * 1024,
            base_url: "https://media.invalid".to_string(),
            state: Mutex::new(State::default()),
        }
    }

    /// Only accept exactly these credentials.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.expected = Some(credentials);
        self
    }

    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_bytes = bytes;
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Make the next upload of `file_name` fail with `err`. Queued errors are
    /// consumed one per attempt, in order.
    pub fn fail_next(&self, file_name: impl Into<String>, err: ItemError) {
        self.lock()
            .scripted
            .entry(file_name.into())
            .or_default()
            .push_back(err);
    }

    /// Reject every subsequent upload as if the session token expired.
    pub fn revoke_sessions(&self) {
        self.lock().revoked = true;
    }

    pub fn auth_calls(&self) -> u32 {
        self.lock().auth_calls
    }

    /// Upload attempts, including failed ones.
    pub fn upload_calls(&self) -> u32 {
        self.lock().upload_calls
    }

    pub fn accepted(&self) -> Vec<RecordedUpload> {
        self.lock().accepted.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain counters behind; keep going.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl MediaStore for InMemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn identity(&self) -> String {
        format!("memory:{}", self.base_url)
    }

    fn max_upload_bytes(&self, _mode: UploadMode) -> u64 {
        self.max_bytes
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, ItemError> {
        let mut state = self.lock();
        state.auth_calls += 1;
        if let Some(ref expected) = self.expected {
            if expected != credentials {
                return Err(ItemError::Auth {
                    detail: format!("unknown app id '{}'", credentials.app_id),
                });
            }
        }
        Ok(Session {
            token: format!("mem-token-{}", state.auth_calls),
            expires_at: None,
        })
    }

    async fn upload(
        &self,
        _session: &Session,
        payload: MediaPayload,
        mode: UploadMode,
    ) -> Result<RemoteAsset, ItemError> {
        let mut state = self.lock();
        state.upload_calls += 1;

        if state.revoked {
            return Err(ItemError::Auth {
                detail: "session token expired".into(),
            });
        }
        if let Some(err) = state
            .scripted
            .get_mut(&payload.file_name)
            .and_then(|q| q.pop_front())
        {
            return Err(err);
        }
        let size = payload.bytes.len() as u64;
        if size > self.max_bytes {
            return Err(ItemError::SizeExceeded {
                size,
                limit: self.max_bytes,
            });
        }

        let digest = hex::encode(Sha256::digest(&payload.bytes));
        let remote_id = digest[..16].to_string();
        let ext = payload
            .content_type
            .strip_prefix("image/")
            .unwrap_or("bin");
        let remote_url = format!("{}/{}/{}.{}", self.base_url, mode, remote_id, ext);

        state.accepted.push(RecordedUpload {
            file_name: payload.file_name,
            mode,
            byte_size: payload.bytes.len(),
            remote_url: remote_url.clone(),
        });

        Ok(RemoteAsset {
            remote_url,
            remote_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(name: &str, bytes: &[u8]) -> MediaPayload {
        MediaPayload {
            file_name: name.to_string(),
            content_type: "image/png",
            bytes: bytes.to_vec(),
        }
    }

    #[tokio::test]
    async fn same_bytes_same_url() {
        let store = InMemoryStore::new();
        let session = store.authenticate(&Credentials::default()).await.unwrap();
        let a = store
            .upload(&session, payload("a.png", b"abc"), UploadMode::Permanent)
            .await
            .unwrap();
        let b = store
            .upload(&session, payload("b.png", b"abc"), UploadMode::Permanent)
            .await
            .unwrap();
        assert_eq!(a, b);
        assert!(a.remote_url.starts_with("https://media.invalid/permanent/"));
        assert!(a.remote_url.ends_with(".png"));
    }

    #[tokio::test]
    async fn rejects_wrong_credentials() {
        let store = InMemoryStore::new().with_credentials(Credentials::new("id", "s"));
        let err = store
            .authenticate(&Credentials::new("id", "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, ItemError::Auth { .. }));
        assert_eq!(store.auth_calls(), 1);
    }

    #[tokio::test]
    async fn scripted_failure_is_consumed_once() {
        let store = InMemoryStore::new();
        let session = store.authenticate(&Credentials::default()).await.unwrap();
        store.fail_next("a.png", ItemError::transient("503"));

        let first = store
            .upload(&session, payload("a.png", b"x"), UploadMode::Temporary)
            .await;
        assert!(first.is_err());
        let second = store
            .upload(&session, payload("a.png", b"x"), UploadMode::Temporary)
            .await;
        assert!(second.is_ok());
        assert_eq!(store.upload_calls(), 2);
        assert_eq!(store.accepted().len(), 1);
    }

    #[tokio::test]
    async fn oversized_payload_rejected() {
        let store = InMemoryStore::new().with_max_upload_bytes(2);
        let session = store.authenticate(&Credentials::default()).await.unwrap();
        let err = store
            .upload(&session, payload("a.png", b"xyz"), UploadMode::Permanent)
            .await
            .unwrap_err();
        assert_eq!(err, ItemError::SizeExceeded { size: 3, limit: 2 });
    }
}
