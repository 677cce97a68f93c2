//! Durable state store for loop and checkpoint snapshots
//!
//! The orchestration layer treats storage as a best-effort side effect: every
//! save goes through `fail_open`, so a broken store degrades to in-memory only.

use async_trait::async_trait;
use conclave_core::{ConclaveError, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

/// Collection holding review loop snapshots
pub const REVIEW_LOOPS: &str = "review-loops";

/// Collection holding consensus checkpoints and their audit logs
pub const CHECKPOINTS: &str = "checkpoints";

/// Durable key/value store for orchestration state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Save (overwrite) a record
    async fn save(&self, collection: &str, id: &str, state: &Value) -> Result<()>;

    /// Load a single record
    async fn load(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Load every record in a collection, ordered by id
    async fn load_all(&self, collection: &str) -> Result<Vec<(String, Value)>>;
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, BTreeMap<String, Value>>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose writes always fail
    pub fn failing() -> Self {
        let store = Self::default();
        store.set_failing(true);
        store
    }

    /// Toggle write failures
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of records in a collection
    pub async fn len(&self, collection: &str) -> usize {
        self.records
            .read()
            .await
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save(&self, collection: &str, id: &str, state: &Value) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConclaveError::Storage(format!(
                "memory store rejected write to {}/{}",
                collection, id
            )));
        }
        self.records
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), state.clone());
        Ok(())
    }

    async fn load(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        Ok(self
            .records
            .read()
            .await
            .get(collection)
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn load_all(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .records
            .read()
            .await
            .get(collection)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

/// File-backed store: one pretty-printed JSON document per record at
/// `<root>/<collection>/<id>.json`
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, collection: &str, id: &str) -> Result<PathBuf> {
        validate_segment(collection)?;
        validate_segment(id)?;
        Ok(self.root.join(collection).join(format!("{}.json", id)))
    }
}

/// Ids become file names; refuse anything that could escape the collection
fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty()
        || segment.contains('/')
        || segment.contains('\\')
        || segment.contains("..")
    {
        return Err(ConclaveError::Validation(format!(
            "invalid store key: {:?}",
            segment
        )));
    }
    Ok(())
}

#[async_trait]
impl StateStore for FileStore {
    async fn save(&self, collection: &str, id: &str, state: &Value) -> Result<()> {
        let path = self.record_path(collection, id)?;

        // Ensure directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to a sibling temp file first so readers never see half a record
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        fs::rename(&tmp, &path).await?;

        debug!("Stored {}/{} to {:?}", collection, id, path);
        Ok(())
    }

    async fn load(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let path = self.record_path(collection, id)?;
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read(&path).await?;
        Ok(Some(serde_json::from_slice(&content)?))
    }

    async fn load_all(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        validate_segment(collection)?;
        let dir = self.root.join(collection);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = fs::read(&path).await?;
            records.push((id.to_string(), serde_json::from_slice(&content)?));
        }

        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }
}
