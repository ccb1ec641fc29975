//! Durable byte storage for raw document files.
//!
//! The [`ContentStore`] trait is the narrow capability contract over blob
//! storage: a backend only needs `put`/`get`/`delete` keyed by document ID.
//! [`FsContentStore`] keeps blobs under a root directory;
//! [`MemoryContentStore`] backs tests and throwaway corpora.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::DocumentType;

/// Abstract blob storage for raw document bytes.
///
/// `put` returns a storage pointer recorded in the catalog row; the pointer
/// is opaque to callers and only meaningful to the store that produced it.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store the raw bytes for a document, returning a storage pointer.
    ///
    /// Overwrites any blob previously stored under the same ID (re-ingestion
    /// of an updated document reuses the document's ID).
    async fn put(&self, id: Uuid, doc_type: DocumentType, bytes: &[u8]) -> Result<String>;

    /// Fetch the raw bytes for a document.
    async fn get(&self, id: Uuid) -> Result<Vec<u8>>;

    /// Delete the blob for a document. No-op if absent.
    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Whether a blob exists for this document (used by the repair sweep).
    async fn exists(&self, id: Uuid) -> Result<bool>;
}

/// Filesystem-backed content store.
///
/// Blobs live at `<root>/<id>.<ext>`; the extension is only a convenience
/// for the user poking around the data directory.
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn blob_path(&self, id: Uuid, doc_type: DocumentType) -> PathBuf {
        self.root.join(format!("{}.{}", id, doc_type.as_str()))
    }

    /// Resolve the stored blob for an ID regardless of extension.
    async fn find(&self, id: Uuid) -> Result<Option<PathBuf>> {
        let prefix = id.to_string();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some((stem, _ext)) = name.rsplit_once('.') {
                if stem == prefix {
                    return Ok(Some(entry.path()));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn put(&self, id: Uuid, doc_type: DocumentType, bytes: &[u8]) -> Result<String> {
        tokio::fs::create_dir_all(&self.root).await?;
        // Drop any stale blob stored under a different extension first.
        if let Some(old) = self.find(id).await? {
            tokio::fs::remove_file(&old).await.ok();
        }
        let path = self.blob_path(id, doc_type);
        tokio::fs::write(&path, bytes).await?;
        Ok(path.to_string_lossy().into_owned())
    }

    async fn get(&self, id: Uuid) -> Result<Vec<u8>> {
        match self.find(id).await? {
            Some(path) => Ok(tokio::fs::read(&path).await?),
            None => Err(Error::NotFound(format!("content blob for {id}"))),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        if let Some(path) = self.find(id).await? {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        Ok(self.find(id).await?.is_some())
    }
}

/// In-memory content store for tests.
#[derive(Default)]
pub struct MemoryContentStore {
    blobs: RwLock<HashMap<Uuid, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, id: Uuid, doc_type: DocumentType, bytes: &[u8]) -> Result<String> {
        self.blobs.write().unwrap().insert(id, bytes.to_vec());
        Ok(format!("mem://{}.{}", id, doc_type.as_str()))
    }

    async fn get(&self, id: Uuid) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("content blob for {id}")))
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.blobs.write().unwrap().remove(&id);
        Ok(())
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        Ok(self.blobs.read().unwrap().contains_key(&id))
    }
}
