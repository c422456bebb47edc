//! Object-store primitives for the ingest pipeline.
//!
//! The destination is modeled as a flat key/bytes store (the shape the real
//! object storage exposes); `LocalObjectStore` maps keys onto a directory
//! tree and publishes writes atomically via a temp file and rename, so a
//! reader never observes a partially written partition.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "joblake-storage";

/// Stage prefix separating raw archival copies from processed tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Raw,
    Processed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Raw => "raw",
            Stage::Processed => "processed",
        }
    }
}

/// `<stage>/<table>/<ingest_date>/<table>_<ingest_date>.parquet`
pub fn table_object_key(stage: Stage, table: &str, ingest_date: NaiveDate) -> String {
    format!(
        "{}/{}/{}/{}_{}.parquet",
        stage.as_str(),
        table,
        ingest_date,
        table,
        ingest_date
    )
}

/// `raw/pages/<ingest_date>/page_<NNNN>.json`
pub fn raw_page_key(ingest_date: NaiveDate, page: u32) -> String {
    format!("raw/pages/{}/page_{:04}.json", ingest_date, page)
}

#[derive(Debug, Error)]
pub enum StorageError {
    /// The object does not exist. Callers may treat this as empty prior
    /// state; every other failure must propagate.
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("storage i/o failure for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Publish atomically: bytes land in a temp file first and are renamed
    /// into place, replacing any prior object under the same key.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Keys under `prefix`, sorted. Prefix granularity is whole path
    /// segments; in-flight temp files are excluded.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn io_err(key: &str, source: std::io::Error) -> StorageError {
        StorageError::Io {
            key: key.to_string(),
            source,
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.root.join(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(err) => Err(Self::io_err(key, err)),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.root.join(key);
        let parent = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| Self::io_err(key, err))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|err| Self::io_err(key, err))?;
        if let Err(err) = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await
        {
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(Self::io_err(key, err));
        }
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Self::io_err(key, err));
        }

        info!(key, bytes = bytes.len(), "stored object");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        fs::try_exists(self.root.join(key))
            .await
            .map_err(|err| Self::io_err(key, err))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.trim_matches('/');
        let base = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.root.join(prefix)
        };

        let meta = match fs::metadata(&base).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Self::io_err(prefix, err)),
        };
        if meta.is_file() {
            return Ok(vec![prefix.to_string()]);
        }

        let mut keys = Vec::new();
        let mut pending = vec![(base, prefix.to_string())];
        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|err| Self::io_err(&key_prefix, err))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| Self::io_err(&key_prefix, err))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if key_prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{key_prefix}/{name}")
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| Self::io_err(&key, err))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else if !name.starts_with('.') {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
