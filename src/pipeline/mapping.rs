//! Mapping store: the three persisted maps and their reconciliation.
//!
//! ```text
//! download_mapping.json   original_url → local_path    (after fetch)
//! upload_mapping.json     local_path   → remote_url    (after upload)
//! url_mapping.json        original_url → remote_url    (joined; consumed by rewrite)
//! ```
//!
//! Each file is a flat JSON object whose keys keep insertion order, so the
//! final mapping lists URLs in document order. Stages can be rerun in
//! isolation by editing or deleting a single file.
//!
//! `upload_scope.json` sits next to the upload map and records which store,
//! mode and account its remote URLs belong to.

use crate::error::RehostError;
use crate::output::Stage;
use crate::persist;
use crate::pipeline::extract::UrlRecord;
use crate::store::UploadMode;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Insertion-ordered string map.
///
/// Re-inserting an existing key replaces the value in place; the key keeps
/// its original position.
#[derive(Debug, Clone, Default)]
pub struct UrlMap {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl UrlMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.index.get(key).map(|&i| self.entries[i].1.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Insert or replace; returns the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let value = value.into();
        match self.index.get(&key) {
            Some(&i) => Some(std::mem::replace(&mut self.entries[i].1, value)),
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Insert every entry of `other`, in its order.
    pub fn extend_from(&mut self, other: &UrlMap) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }

    /// Keep only entries for which `f` returns true, preserving order.
    pub fn retain(&mut self, mut f: impl FnMut(&str, &str) -> bool) {
        self.entries.retain(|(k, v)| f(k.as_str(), v.as_str()));
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, (k, _))| (k.clone(), i))
            .collect();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

impl PartialEq for UrlMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for UrlMap {}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for UrlMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = UrlMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl Serialize for UrlMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut m = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            m.serialize_entry(k, v)?;
        }
        m.end()
    }
}

impl<'de> Deserialize<'de> for UrlMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct UrlMapVisitor;

        impl<'de> Visitor<'de> for UrlMapVisitor {
            type Value = UrlMap;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object of string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<UrlMap, A::Error> {
                let mut map = UrlMap::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    map.insert(k, v);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(UrlMapVisitor)
    }
}

/// Which persisted map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingStage {
    /// original_url → local_path
    Local,
    /// local_path → remote_url
    Remote,
    /// original_url → remote_url
    Final,
}

impl MappingStage {
    pub fn file_name(self) -> &'static str {
        match self {
            MappingStage::Local => "download_mapping.json",
            MappingStage::Remote => "upload_mapping.json",
            MappingStage::Final => "url_mapping.json",
        }
    }
}

/// Name of the extracted URL list inside the state directory.
pub const URL_LIST_FILE: &str = "extracted_urls.txt";

/// Name of the upload-scope sidecar inside the state directory.
pub const UPLOAD_SCOPE_FILE: &str = "upload_scope.json";

/// Where the remote URLs in `upload_mapping.json` were uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadScope {
    /// [`MediaStore::identity`](crate::store::MediaStore::identity) of the store.
    pub store: String,
    pub mode: UploadMode,
    #[serde(default)]
    pub app_id: String,
}

/// Reads and writes the mapping files in one state directory.
///
/// Writes are serialised through an async mutex and land atomically, so a
/// crash mid-save leaves the previous file intact.
pub struct MappingStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl MappingStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: state_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self, stage: MappingStage) -> PathBuf {
        self.dir.join(stage.file_name())
    }

    /// Load one map; a missing file is an empty map.
    pub async fn load(&self, stage: MappingStage) -> Result<UrlMap, RehostError> {
        load_mapping_file(&self.path(stage)).await
    }

    pub async fn save(&self, stage: MappingStage, map: &UrlMap) -> Result<(), RehostError> {
        let path = self.path(stage);
        let _guard = self.write_lock.lock().await;
        write_json(&path, map).await?;
        debug!("Saved {} entries to {}", map.len(), path.display());
        Ok(())
    }

    /// Load the upload-scope sidecar. Missing or unreadable → `None`.
    pub async fn load_scope(&self) -> Result<Option<UploadScope>, RehostError> {
        let path = self.dir.join(UPLOAD_SCOPE_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RehostError::ReadFailed { path, source: e }),
        };
        match serde_json::from_slice(&bytes) {
            Ok(scope) => Ok(Some(scope)),
            Err(e) => {
                warn!("Ignoring malformed {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    pub async fn save_scope(&self, scope: &UploadScope) -> Result<(), RehostError> {
        let path = self.dir.join(UPLOAD_SCOPE_FILE);
        let _guard = self.write_lock.lock().await;
        write_json(&path, scope).await
    }

    /// Write the extracted URL list.
    pub async fn save_url_list(&self, contents: String) -> Result<PathBuf, RehostError> {
        let path = self.dir.join(URL_LIST_FILE);
        let _guard = self.write_lock.lock().await;
        persist::write_atomic(&path, contents.into_bytes())
            .await
            .map_err(|e| RehostError::StateWriteFailed {
                path: path.clone(),
                source: e,
            })?;
        Ok(path)
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), RehostError> {
    let mut json = serde_json::to_vec_pretty(value)
        .map_err(|e| RehostError::Internal(format!("mapping serialisation: {e}")))?;
    json.push(b'\n');
    persist::write_atomic(path, json)
        .await
        .map_err(|e| RehostError::StateWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Load a mapping file from any path. Missing → empty; malformed → error.
pub async fn load_mapping_file(path: &Path) -> Result<UrlMap, RehostError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(UrlMap::new()),
        Err(e) => {
            return Err(RehostError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(UrlMap::new());
    }
    serde_json::from_slice(&bytes).map_err(|e| RehostError::CorruptMapping {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// An extracted URL that did not make it into the final mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unmapped {
    pub url: String,
    /// The first stage with no entry for it.
    pub stage: Stage,
    pub reason: String,
}

/// Output of [`reconcile`].
#[derive(Debug, Clone, Default)]
pub struct Reconciled {
    pub mapping: UrlMap,
    pub unmapped: Vec<Unmapped>,
}

/// Join original → local with local → remote, in record order.
///
/// Only records present in both maps are mapped. A remote URL equal to its
/// original is excluded and reported, so the rewriter never sees a no-op
/// entry.
pub fn reconcile(records: &[UrlRecord], local: &UrlMap, remote: &UrlMap) -> Reconciled {
    let mut out = Reconciled::default();
    for record in records {
        let url = record.original_url.as_str();
        if out.mapping.contains_key(url) {
            continue;
        }
        let Some(local_path) = local.get(url) else {
            out.unmapped.push(Unmapped {
                url: url.to_string(),
                stage: Stage::Fetch,
                reason: "no downloaded artifact".into(),
            });
            continue;
        };
        let Some(remote_url) = remote.get(local_path) else {
            out.unmapped.push(Unmapped {
                url: url.to_string(),
                stage: Stage::Upload,
                reason: format!("artifact '{local_path}' was not uploaded"),
            });
            continue;
        };
        if remote_url == url {
            out.unmapped.push(Unmapped {
                url: url.to_string(),
                stage: Stage::Map,
                reason: "remote URL equals the original".into(),
            });
            continue;
        }
        out.mapping.insert(url, remote_url);
    }
    out
}

/// Drop entries that would make replacement unsafe: empty keys or values,
/// and self-maps. Returns the cleaned map and the dropped keys.
pub fn validate_mapping(map: &UrlMap) -> (UrlMap, Vec<String>) {
    let mut clean = UrlMap::new();
    let mut dropped = Vec::new();
    for (k, v) in map.iter() {
        let k_trim = k.trim();
        let v_trim = v.trim();
        if k_trim.is_empty() || v_trim.is_empty() || k_trim == v_trim {
            warn!("Ignoring mapping entry '{}' -> '{}'", k, v);
            dropped.push(k.to_string());
            continue;
        }
        clean.insert(k, v_trim);
    }
    (clean, dropped)
}
