//! Storage Abstraction
//!
//! Durable byte storage keyed by path. Backends must tolerate concurrent
//! calls on distinct paths and identical retried writes; the engine never
//! relies on atomicity across several paths.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use attachs_core::ErrorKind;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Suffix of in-flight local writes, never listed
const PARTIAL_SUFFIX: &str = ".partial";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidPath(_) => ErrorKind::Validation,
            Self::Io(_) | Self::Backend(_) => ErrorKind::Io,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Metadata of a stored object
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,
    /// Content type (MIME)
    pub content_type: String,
    /// SHA256 digest
    pub digest: String,
    /// Last modified time
    pub last_modified: Option<DateTime<Utc>>,
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub path: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Options for URL generation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlOptions {
    /// Lifetime for signed URLs; backends without signing ignore it
    pub expires_in: Option<Duration>,
}

impl UrlOptions {
    pub fn expiring(expires_in: Duration) -> Self {
        Self {
            expires_in: Some(expires_in),
        }
    }
}

/// Storage trait - unified interface for storage backends
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store data at a path, replacing what was there
    async fn put(&self, path: &str, data: Bytes, content_type: &str)
        -> StorageResult<FileMetadata>;

    /// Retrieve data by path
    async fn get(&self, path: &str) -> StorageResult<Bytes>;

    /// Delete data by path; deleting a missing path succeeds
    async fn delete(&self, path: &str) -> StorageResult<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> StorageResult<bool>;

    /// Every object whose path starts with `prefix`
    async fn list(&self, prefix: &str) -> StorageResult<Vec<StoredObject>>;

    /// Public URL of a path; pure, never touches storage
    fn url(&self, path: &str, options: &UrlOptions) -> String;

    /// Get storage name for logging
    fn name(&self) -> &str;
}

/// Calculate SHA256 digest
fn calculate_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Local filesystem storage
pub struct LocalStorage {
    /// Root directory for storage
    root: PathBuf,
    /// Base URL for generating URLs
    base_url: String,
}

impl LocalStorage {
    /// Create a new local storage
    pub fn new(root: impl AsRef<Path>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path to a full filesystem path
    fn resolve_path(&self, path: &str) -> StorageResult<PathBuf> {
        // Prevent directory traversal
        if path.is_empty()
            || path.split('/').any(|segment| segment == "..")
            || path.starts_with('/')
            || path.starts_with('\\')
        {
            return Err(StorageError::InvalidPath(path.to_string()));
        }

        Ok(self.root.join(path))
    }

    /// Ensure parent directory exists
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn relative(&self, full: &Path) -> Option<String> {
        let relative = full.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self, data), fields(storage = "local"))]
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<FileMetadata> {
        let full_path = self.resolve_path(path)?;
        self.ensure_parent(&full_path).await?;

        let digest = calculate_digest(&data);
        let size = data.len() as u64;

        // Unique temp file per write; removed on drop unless persisted
        let parent = full_path.parent().unwrap_or(&self.root);
        let (file, partial) = tempfile::Builder::new()
            .prefix(".")
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(parent)?
            .into_parts();
        let mut file = fs::File::from_std(file);
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        partial.persist(&full_path).map_err(|e| e.error)?;

        debug!(path = ?full_path, size = size, "File stored");

        Ok(FileMetadata {
            size,
            content_type: content_type.to_string(),
            digest,
            last_modified: Some(Utc::now()),
        })
    }

    #[instrument(skip(self), fields(storage = "local"))]
    async fn get(&self, path: &str) -> StorageResult<Bytes> {
        let full_path = self.resolve_path(path)?;

        match fs::read(&full_path).await {
            Ok(buffer) => Ok(Bytes::from(buffer)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(storage = "local"))]
    async fn delete(&self, path: &str) -> StorageResult<()> {
        let full_path = self.resolve_path(path)?;

        match fs::remove_file(&full_path).await {
            Ok(()) => {
                debug!(path = ?full_path, "File deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let full_path = self.resolve_path(path)?;
        Ok(fs::try_exists(&full_path).await?)
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<StoredObject>> {
        let mut objects = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                let full = entry.path();
                if meta.is_dir() {
                    pending.push(full);
                    continue;
                }
                let Some(path) = self.relative(&full) else {
                    continue;
                };
                if path.ends_with(PARTIAL_SUFFIX) || !path.starts_with(prefix) {
                    continue;
                }
                let last_modified = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                objects.push(StoredObject {
                    path,
                    size: meta.len(),
                    last_modified,
                });
            }
        }

        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    fn url(&self, path: &str, _options: &UrlOptions) -> String {
        // Local storage uses direct URLs
        format!("{}/{}", self.base_url, path)
    }

    fn name(&self) -> &str {
        "local"
    }
}

struct StoredFile {
    data: Bytes,
    metadata: FileMetadata,
    modified: DateTime<Utc>,
}

/// In-memory storage for testing
pub struct MemoryStorage {
    files: RwLock<HashMap<String, StoredFile>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
        }
    }

    /// All stored paths, sorted
    pub async fn paths(&self) -> Vec<String> {
        let files = self.files.read().await;
        let mut paths: Vec<_> = files.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Content type recorded by `put`
    pub async fn content_type(&self, path: &str) -> Option<String> {
        let files = self.files.read().await;
        files.get(path).map(|f| f.metadata.content_type.clone())
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<FileMetadata> {
        let now = Utc::now();
        let metadata = FileMetadata {
            size: data.len() as u64,
            content_type: content_type.to_string(),
            digest: calculate_digest(&data),
            last_modified: Some(now),
        };

        let mut files = self.files.write().await;
        files.insert(
            path.to_string(),
            StoredFile {
                data,
                metadata: metadata.clone(),
                modified: now,
            },
        );

        Ok(metadata)
    }

    async fn get(&self, path: &str) -> StorageResult<Bytes> {
        let files = self.files.read().await;
        files
            .get(path)
            .map(|f| f.data.clone())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let mut files = self.files.write().await;
        files.remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let files = self.files.read().await;
        Ok(files.contains_key(path))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<StoredObject>> {
        let files = self.files.read().await;
        let mut objects: Vec<_> = files
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, file)| StoredObject {
                path: path.clone(),
                size: file.metadata.size,
                last_modified: file.modified,
            })
            .collect();
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    fn url(&self, path: &str, _options: &UrlOptions) -> String {
        format!("/memory/{}", path)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
