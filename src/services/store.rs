use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, MutexGuard};

use crate::models::ChatDocument;

/// Shared handle to the persisted chat document. Every collaborator that
/// touches persisted state goes through `acquire`; the returned guard is
/// the only way to mutate the document, and dropping a guard marked with
/// `save_on_release` writes the document back to disk.
#[derive(Clone)]
pub struct SharedStore {
    state: Arc<Mutex<ChatDocument>>,
    path: Option<PathBuf>,
}

impl SharedStore {
    /// Open the store at `path`, loading the existing document if present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let document = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read store at {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse store at {}", path.display()))?
        } else {
            ChatDocument::default()
        };

        Ok(Self {
            state: Arc::new(Mutex::new(document)),
            path: Some(path),
        })
    }

    /// An ephemeral store that never touches disk (tests, dry runs).
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(Mutex::new(ChatDocument::default())),
            path: None,
        }
    }

    /// Exclusive scoped access to the document. Concurrent acquisitions
    /// serialize; hold the guard only for a single read-modify-write step.
    pub async fn acquire(&self) -> StoreGuard<'_> {
        StoreGuard {
            doc: self.state.lock().await,
            path: self.path.as_deref(),
            save: false,
        }
    }

    /// Persist the current document now.
    pub async fn persist(&self) {
        let mut guard = self.acquire().await;
        guard.save_on_release();
    }
}

pub struct StoreGuard<'a> {
    doc: MutexGuard<'a, ChatDocument>,
    path: Option<&'a Path>,
    save: bool,
}

impl StoreGuard<'_> {
    /// Write the document back to disk when this guard is released.
    pub fn save_on_release(&mut self) {
        self.save = true;
    }
}

impl Deref for StoreGuard<'_> {
    type Target = ChatDocument;

    fn deref(&self) -> &ChatDocument {
        &self.doc
    }
}

impl DerefMut for StoreGuard<'_> {
    fn deref_mut(&mut self) -> &mut ChatDocument {
        &mut self.doc
    }
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        let Some(path) = self.path else { return };
        if !self.save {
            return;
        }
        if let Err(e) = write_document(path, &self.doc) {
            tracing::error!("Failed to persist store at {}: {:#}", path.display(), e);
        }
    }
}

/// Serialize through a sibling temp file so a crash mid-write never leaves
/// a truncated document behind.
fn write_document(path: &Path, document: &ChatDocument) -> Result<()> {
    let json = serde_json::to_string_pretty(document).context("Failed to serialize store")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}
