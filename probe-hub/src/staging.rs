//! Firmware staging.
//!
//! Uploads stream into a directory that is bind-mounted into every toolchain
//! container at the same path, so the staged path is valid on both sides of
//! the container boundary. Each dispatch gets a unique file name; the file
//! is removed when the flash finishes, whatever the outcome.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::StagingSection;

/// Abort an upload that has been stalled this long.
pub const T_UPLOAD_IDLE: Duration = Duration::from_secs(30);

/// Errors while staging uploaded firmware.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum StagingError {
    /// Firmware extension `{extension}` is not allowed.
    ExtensionNotAllowed { extension: String },
    /// The uploaded file has no usable file name.
    MissingFilename,
    /// Upload exceeds the staging limit of {limit} bytes.
    TooLarge { limit: u64 },
    /// Upload stalled and was aborted.
    Stalled,
    /// Staging I/O failed.
    Io(#[from] std::io::Error),
}

/// The staging directory and its policy.
#[derive(Debug, Clone)]
pub struct Staging {
    dir: PathBuf,
    max_upload_size: u64,
    allowed_extensions: Vec<String>,
}

impl Staging {
    pub fn new(section: &StagingSection) -> Self {
        Self {
            dir: section.dir.clone(),
            max_upload_size: section.max_upload_size,
            allowed_extensions: section
                .allowed_extensions
                .iter()
                .map(|e| e.to_lowercase())
                .collect(),
        }
    }

    /// Opens a staging file for an upload named `original_name`. The
    /// extension must be on the allow list; the staged name is unique.
    pub async fn create(&self, original_name: &str) -> Result<StagedWriter, StagingError> {
        let extension = Path::new(original_name)
            .extension()
            .and_then(|e| e.to_str())
            .ok_or(StagingError::MissingFilename)?
            .to_lowercase();

        if !self.allowed_extensions.contains(&extension) {
            return Err(StagingError::ExtensionNotAllowed { extension });
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{}.{extension}", Uuid::new_v4()));
        let file = tokio::fs::File::create(&path).await?;

        tracing::debug!(path = %path.display(), "staging upload");

        Ok(StagedWriter {
            file: Some(file),
            path,
            written: 0,
            limit: self.max_upload_size,
            keep: false,
        })
    }
}

/// An upload in progress. Dropping it before [`StagedWriter::finish`]
/// removes the partial file.
#[derive(Debug)]
pub struct StagedWriter {
    file: Option<tokio::fs::File>,
    path: PathBuf,
    written: u64,
    limit: u64,
    keep: bool,
}

impl StagedWriter {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), StagingError> {
        self.written += chunk.len() as u64;
        if self.written > self.limit {
            self.discard().await;
            return Err(StagingError::TooLarge { limit: self.limit });
        }
        let Some(file) = self.file.as_mut() else {
            return Err(StagingError::Stalled);
        };
        if let Err(error) = file.write_all(chunk).await {
            self.discard().await;
            return Err(error.into());
        }
        Ok(())
    }

    /// Completes the upload and hands ownership to a cleanup guard.
    pub async fn finish(mut self) -> Result<StagedFirmware, StagingError> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
            file.sync_all().await?;
        }
        self.file = None;
        self.keep = true;
        Ok(StagedFirmware {
            path: self.path.clone(),
            removed: false,
        })
    }

    /// Drops the partial upload and its file.
    pub async fn discard(&mut self) {
        self.file = None;
        if let Err(error) = tokio::fs::remove_file(&self.path).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "removing partial upload failed: {error}");
            }
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl Drop for StagedWriter {
    fn drop(&mut self) {
        // Abandoned mid-stream (client went away, dispatch aborted): don't
        // leave the partial file behind.
        if !self.keep {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// A fully staged firmware file. Removed on drop; [`StagedFirmware::remove`]
/// reports errors instead of swallowing them.
#[derive(Debug)]
pub struct StagedFirmware {
    path: PathBuf,
    removed: bool,
}

impl StagedFirmware {
    /// The staged path, identical inside the containers.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) {
        self.removed = true;
        if let Err(error) = tokio::fs::remove_file(&self.path).await {
            tracing::warn!(path = %self.path.display(), "removing staged firmware failed: {error}");
        }
    }
}

impl Drop for StagedFirmware {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
