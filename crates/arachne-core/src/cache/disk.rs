//! Disk tier: one JSON envelope per key under the cache directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::compute_hash;

const ENVELOPE_EXT: &str = "json";
const TEMP_EXT: &str = "tmp";

/// On-disk representation of a cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskEnvelope {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub size_bytes: u64,
    pub value: serde_json::Value,
}

impl DiskEnvelope {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        super::is_expired(self.created_at, self.ttl(), now)
    }
}

/// Result of reading one envelope.
#[derive(Debug)]
pub enum DiskRead {
    Missing,
    /// The file exists but could not be parsed. It has already been deleted.
    Corrupt(String),
    /// The file belongs to a different logical key.
    KeyMismatch(String),
    Found(DiskEnvelope),
}

#[derive(Debug, Clone)]
pub struct DiskTier {
    dir: PathBuf,
}

impl DiskTier {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory and verify it accepts writes.
    pub async fn ensure_writable(&self) -> Result<(), AppError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            AppError::ConfigError(format!(
                "Cannot create cache directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let probe = self.dir.join(format!(".probe-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&probe, b"probe").await.map_err(|e| {
            AppError::ConfigError(format!(
                "Cache directory {} is not writable: {e}",
                self.dir.display()
            ))
        })?;
        let _ = tokio::fs::remove_file(&probe).await;
        Ok(())
    }

    /// File path for a logical key. Names are the SHA-256 of the key.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{ENVELOPE_EXT}", compute_hash(key)))
    }

    pub async fn read(&self, key: &str) -> DiskRead {
        let path = self.path_for(key);
        match self.read_path(&path).await {
            DiskRead::Found(envelope) if envelope.key != key => DiskRead::KeyMismatch(envelope.key),
            other => other,
        }
    }

    async fn read_path(&self, path: &Path) -> DiskRead {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return DiskRead::Missing,
            Err(e) => {
                let _ = tokio::fs::remove_file(path).await;
                return DiskRead::Corrupt(e.to_string());
            }
        };
        match serde_json::from_slice::<DiskEnvelope>(&bytes) {
            Ok(envelope) => DiskRead::Found(envelope),
            Err(e) => {
                let _ = tokio::fs::remove_file(path).await;
                DiskRead::Corrupt(e.to_string())
            }
        }
    }

    /// Write an envelope through a temp file and rename it into place.
    pub async fn write(&self, envelope: &DiskEnvelope) -> Result<(), AppError> {
        let path = self.path_for(&envelope.key);
        let temp = path.with_extension(format!("{}.{TEMP_EXT}", uuid::Uuid::new_v4()));
        let bytes = serde_json::to_vec(envelope)?;

        if let Err(e) = tokio::fs::write(&temp, &bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(AppError::CacheError(format!(
                "Failed to write {}: {e}",
                temp.display()
            )));
        }
        tokio::fs::rename(&temp, &path).await.map_err(|e| {
            AppError::CacheError(format!("Failed to move {} into place: {e}", path.display()))
        })
    }

    pub async fn remove(&self, key: &str) -> bool {
        tokio::fs::remove_file(self.path_for(key)).await.is_ok()
    }

    /// All envelope files currently in the directory.
    pub async fn files(&self) -> Result<Vec<PathBuf>, AppError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| AppError::CacheError(format!("Failed to list cache dir: {e}")))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::CacheError(format!("Failed to list cache dir: {e}")))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == ENVELOPE_EXT) {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Entry count and total bytes on disk.
    pub async fn usage(&self) -> (u64, u64) {
        let Ok(files) = self.files().await else {
            return (0, 0);
        };
        let mut bytes = 0;
        for file in &files {
            if let Ok(meta) = tokio::fs::metadata(file).await {
                bytes += meta.len();
            }
        }
        (files.len() as u64, bytes)
    }

    /// Delete every expired or unreadable envelope, plus leftover temp files.
    ///
    /// Returns `(expired, corrupted)`.
    pub async fn purge(&self, now: DateTime<Utc>) -> Result<(u64, u64), AppError> {
        let mut expired = 0;
        let mut corrupted = 0;
        for path in self.files().await? {
            match self.read_path(&path).await {
                DiskRead::Found(envelope) if envelope.is_expired(now) => {
                    if tokio::fs::remove_file(&path).await.is_ok() {
                        expired += 1;
                    }
                }
                DiskRead::Corrupt(reason) => {
                    tracing::warn!(path = %path.display(), %reason, "Removed corrupt cache file");
                    corrupted += 1;
                }
                _ => {}
            }
        }
        self.remove_temp_files().await;
        Ok((expired, corrupted))
    }

    async fn remove_temp_files(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == TEMP_EXT) {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
    }

    pub async fn clear(&self) -> Result<u64, AppError> {
        let mut removed = 0;
        for path in self.files().await? {
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        self.remove_temp_files().await;
        Ok(removed)
    }
}
