//! Persisted key-value slots backed by one JSON document.
//!
//! Values are opaque strings. Every write rewrites the whole document into a
//! sibling temp file and renames it into place, so a reader never sees a
//! half-written document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;

type Document = BTreeMap<String, String>;

pub struct JsonStore {
    path: PathBuf,
    /// Serialises whole-document read-modify-write cycles.
    doc_lock: Mutex<()>,
}

impl JsonStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            doc_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.doc_lock.lock().await;
        let doc = self.read_document().await?;
        Ok(doc.get(key).cloned())
    }

    pub async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let _guard = self.doc_lock.lock().await;
        let mut doc = self.read_for_update().await?;
        doc.insert(key.to_string(), value);
        self.write_document(&doc).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.doc_lock.lock().await;
        let mut doc = self.read_for_update().await?;
        if doc.remove(key).is_some() {
            self.write_document(&doc).await?;
        }
        Ok(())
    }

    /// A corrupt document is replaced by the next write; an I/O failure is
    /// not, since the other slots may still be intact on disk.
    async fn read_for_update(&self) -> Result<Document, StoreError> {
        match self.read_document().await {
            Err(StoreError::Corrupt(e)) => {
                warn!("store: replacing corrupt document {}: {}", self.path.display(), e);
                Ok(Document::new())
            }
            other => other,
        }
    }

    async fn read_document(&self) -> Result<Document, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Document::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Document::new());
        }
        serde_json::from_str(&content).map_err(StoreError::Corrupt)
    }

    async fn write_document(&self, doc: &Document) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(doc).map_err(StoreError::Serialize)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("store: wrote {} keys to {}", doc.len(), self.path.display());
        Ok(())
    }
}
