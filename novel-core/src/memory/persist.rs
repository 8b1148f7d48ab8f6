//! Memory archives for save/load.
//!
//! An archive is a versioned JSON file holding every record of an
//! [`InMemoryStore`].

use super::store::{InMemoryStore, ProjectRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::fs;

/// Errors from archive operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Current archive format version.
const ARCHIVE_VERSION: u32 = 1;

/// A saved memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryArchive {
    /// Archive format version for compatibility checking.
    pub version: u32,

    pub saved_at: DateTime<Utc>,

    pub projects: Vec<ProjectRecord>,
}

impl MemoryArchive {
    pub fn new(projects: Vec<ProjectRecord>) -> Self {
        Self {
            version: ARCHIVE_VERSION,
            saved_at: Utc::now(),
            projects,
        }
    }

    /// Capture everything in `store`.
    pub async fn capture(store: &InMemoryStore) -> Self {
        Self::new(store.export_all().await)
    }

    /// Rebuild a store from this archive.
    pub fn into_store(self) -> InMemoryStore {
        InMemoryStore::from_records(self.projects)
    }

    /// Save to a JSON file.
    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<(), ArchiveError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Load from a JSON file.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let content = fs::read_to_string(path).await?;
        let archive: Self = serde_json::from_str(&content)?;

        if archive.version != ARCHIVE_VERSION {
            return Err(ArchiveError::VersionMismatch {
                expected: ARCHIVE_VERSION,
                found: archive.version,
            });
        }

        Ok(archive)
    }
}
