//! File storage module
//!
//! Maps torrent byte offsets onto the files below the save directory and
//! performs the actual reads and writes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::storage::backend::StorageBackend;
use crate::torrent::TorrentMetadata;

/// File storage for torrent data
#[derive(Debug)]
pub struct FileStorage {
    /// Base download directory
    base_path: PathBuf,
    metadata: Arc<TorrentMetadata>,
}

impl FileStorage {
    /// Create a new file storage rooted at `base_path`
    pub fn new(base_path: PathBuf, metadata: Arc<TorrentMetadata>) -> Self {
        Self { base_path, metadata }
    }

    /// Fail early if `dir` cannot be created or written to
    pub async fn check_writable(dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).await.map_err(|e| {
            error!("Save directory '{}' cannot be created: {}", dir.display(), e);
            TorrentError::config_error_with_field(format!("Cannot create save directory: {}", e), "save_dir")
        })?;

        let scratch = dir.join(format!(".write-check-{}", rand::random::<u32>()));
        fs::write(&scratch, b"check").await.map_err(|e| {
            error!("Save directory '{}' is not writable: {}", dir.display(), e);
            TorrentError::config_error_with_field(format!("Save directory is not writable: {}", e), "save_dir")
        })?;
        let _ = fs::remove_file(&scratch).await;
        Ok(())
    }

    /// Base download directory
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Absolute path of file `index`
    pub fn file_path(&self, index: usize) -> PathBuf {
        self.base_path.join(&self.metadata.files[index].path)
    }

    fn storage_error(&self, message: &str, path: &Path, e: impl ToString) -> TorrentError {
        error!("{} '{}': {}", message, path.display(), e.to_string());
        TorrentError::storage_error_full(message, path.display().to_string(), e.to_string())
    }
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn allocate(&self) -> Result<()> {
        info!("Allocating {} files for torrent: {}", self.metadata.files.len(), self.metadata.name);

        for (index, entry) in self.metadata.files.iter().enumerate() {
            let path = self.file_path(index);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.storage_error("Failed to create directory", parent, e))?;
            }

            let file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .await
                .map_err(|e| self.storage_error("Failed to create file", &path, e))?;

            let current = file
                .metadata()
                .await
                .map_err(|e| self.storage_error("Failed to stat file", &path, e))?
                .len();
            if current < entry.length {
                trace!("Extending {} from {} to {} bytes", path.display(), current, entry.length);
                file.set_len(entry.length)
                    .await
                    .map_err(|e| self.storage_error("Failed to set file length", &path, e))?;
            }
        }

        debug!("File structure ready under {}", self.base_path.display());
        Ok(())
    }

    async fn file_lengths(&self) -> Result<Vec<Option<u64>>> {
        let mut lengths = Vec::with_capacity(self.metadata.files.len());
        for index in 0..self.metadata.files.len() {
            let length = match fs::metadata(self.file_path(index)).await {
                Ok(meta) if meta.is_file() => Some(meta.len()),
                _ => None,
            };
            lengths.push(length);
        }
        Ok(lengths)
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        trace!("Writing {} bytes at offset {}", data.len(), offset);
        let mut written = 0usize;

        for slice in self.metadata.slices_for(offset, data.len() as u64) {
            let path = self.file_path(slice.file_index);
            let mut file = fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|e| self.storage_error("Failed to open file for writing", &path, e))?;

            file.seek(std::io::SeekFrom::Start(slice.offset))
                .await
                .map_err(|e| self.storage_error("Failed to seek in file", &path, e))?;

            let chunk = &data[written..written + slice.length as usize];
            file.write_all(chunk)
                .await
                .map_err(|e| self.storage_error("Failed to write to file", &path, e))?;
            file.flush()
                .await
                .map_err(|e| self.storage_error("Failed to flush file", &path, e))?;

            written += chunk.len();
        }

        Ok(())
    }

    async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        trace!("Reading {} bytes at offset {}", length, offset);
        let mut buffer = Vec::with_capacity(length);

        for slice in self.metadata.slices_for(offset, length as u64) {
            let path = self.file_path(slice.file_index);
            let mut file = fs::File::open(&path)
                .await
                .map_err(|e| self.storage_error("Failed to open file for reading", &path, e))?;

            file.seek(std::io::SeekFrom::Start(slice.offset))
                .await
                .map_err(|e| self.storage_error("Failed to seek in file", &path, e))?;

            let mut chunk = vec![0u8; slice.length as usize];
            file.read_exact(&mut chunk)
                .await
                .map_err(|e| self.storage_error("Failed to read from file", &path, e))?;
            buffer.extend_from_slice(&chunk);
        }

        if buffer.len() != length {
            return Err(TorrentError::storage_error(format!(
                "Read past end of torrent: wanted {} bytes at {}, got {}",
                length,
                offset,
                buffer.len()
            ))
            .into());
        }
        Ok(buffer)
    }
}
