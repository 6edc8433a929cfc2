//! Finished recordings in the recordings directory

use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::capture::ALLOWED_CONTAINERS;
use crate::{Result, TapedeckError};

/// One file in the recordings directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingFile {
    /// File name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub modified: DateTime<Utc>,
}

/// Read/delete access to the recordings directory
#[derive(Debug, Clone)]
pub struct RecordingLibrary {
    dir: PathBuf,
}

impl RecordingLibrary {
    /// Library over `dir`
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Media files, newest first
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read
    pub async fn list(&self) -> Result<Vec<RecordingFile>> {
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_media_file(&path) {
                continue;
            }
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            files.push(RecordingFile {
                name: name.to_string(),
                size: meta.len(),
                modified: meta.modified().map(DateTime::<Utc>::from).unwrap_or_default(),
            });
        }

        files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
        Ok(files)
    }

    /// Path of a recording, after validating the name
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for names that could escape the directory
    pub fn path_of(&self, name: &str) -> Result<PathBuf> {
        validate_file_name(name)?;
        Ok(self.dir.join(name))
    }

    /// Whole contents of a recording
    ///
    /// # Errors
    ///
    /// Returns `FileNotFound` if there is no such recording
    pub async fn read(&self, name: &str) -> Result<Bytes> {
        let path = self.existing(name).await?;
        Ok(Bytes::from(tokio::fs::read(path).await?))
    }

    /// Delete a recording
    ///
    /// # Errors
    ///
    /// Returns `FileNotFound` if there is no such recording
    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.existing(name).await?;
        tokio::fs::remove_file(&path).await?;
        info!("Deleted recording {}", path.display());
        Ok(())
    }

    async fn existing(&self, name: &str) -> Result<PathBuf> {
        let path = self.path_of(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(TapedeckError::FileNotFound(name.to_string())),
        }
    }
}

fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ALLOWED_CONTAINERS.contains(&ext))
}

/// Validate a file name taken from a URL
///
/// # Errors
///
/// Returns error if the name is empty, hidden, or could traverse paths
fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TapedeckError::InvalidRequest(
            "File name cannot be empty".to_string(),
        ));
    }

    if name.len() > 255 {
        return Err(TapedeckError::InvalidRequest(format!(
            "File name too long: {} > 255",
            name.len()
        )));
    }

    if name.contains('/') || name.contains('\\') {
        return Err(TapedeckError::InvalidRequest(
            "File name cannot contain path separators".to_string(),
        ));
    }

    if name.starts_with('.') {
        return Err(TapedeckError::InvalidRequest(
            "File name cannot start with dot".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(TapedeckError::InvalidRequest(
            "File name cannot contain null bytes".to_string(),
        ));
    }

    if name.contains("..") {
        return Err(TapedeckError::InvalidRequest(
            "File name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}
