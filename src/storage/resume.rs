//! Resume data module
//!
//! Fast-resume state: the verified-piece bitfield plus the received blocks
//! of partially downloaded pieces, stored as one JSON file per info hash.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::storage::bitfield::Bitfield;
use crate::torrent::InfoHash;

/// Resume data for a torrent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    /// Info hash as hex string
    pub info_hash: String,
    /// Number of pieces in the torrent, guards against reuse across torrents
    pub piece_count: usize,
    /// Which pieces are verified (wire-order bitfield)
    pub downloaded_pieces: Vec<u8>,
    /// Blocks already on disk for unfinished pieces
    pub pieces: Vec<PartialPiece>,
}

/// Received blocks of one unfinished piece
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialPiece {
    /// Piece index
    pub index: u32,
    /// Which blocks are on disk
    pub blocks: Vec<bool>,
}

impl ResumeData {
    /// Snapshot a verified bitfield
    pub fn new(info_hash: &InfoHash, bitfield: &Bitfield) -> Self {
        Self {
            info_hash: info_hash.to_hex(),
            piece_count: bitfield.len(),
            downloaded_pieces: bitfield.as_bytes().to_vec(),
            pieces: Vec::new(),
        }
    }

    /// Decode the persisted bitfield
    pub fn bitfield(&self) -> Result<Bitfield> {
        Bitfield::from_bytes(&self.downloaded_pieces, self.piece_count)
    }

    /// Does this data belong to the given torrent
    pub fn matches(&self, info_hash: &InfoHash, piece_count: usize) -> bool {
        self.info_hash == info_hash.to_hex() && self.piece_count == piece_count
    }

    /// Serialize to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Deserialize from bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Save to file through a temporary file and rename
    pub async fn save(&self, path: &Path) -> Result<()> {
        let data = self.serialize()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("resume.{:08x}.tmp", rand::random::<u32>()));
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Load from file
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(Self::deserialize(&data)?))
    }
}

/// Resume data manager
#[derive(Debug, Clone)]
pub struct ResumeManager {
    resume_dir: PathBuf,
}

impl ResumeManager {
    /// Create a new resume manager
    pub fn new(resume_dir: PathBuf) -> Self {
        Self { resume_dir }
    }

    /// Get the resume file path for a torrent
    pub fn resume_file_path(&self, info_hash: &InfoHash) -> PathBuf {
        self.resume_dir.join(format!("{}.resume", info_hash.to_hex()))
    }

    /// Save resume data for a torrent
    pub async fn save_resume_data(&self, info_hash: &InfoHash, resume_data: &ResumeData) -> Result<()> {
        let resume_path = self.resume_file_path(info_hash);
        resume_data.save(&resume_path).await?;
        info!(
            "Saved resume data for {} ({} pieces verified, {} partial)",
            info_hash,
            resume_data.bitfield().map(|b| b.count_ones()).unwrap_or(0),
            resume_data.pieces.len()
        );
        Ok(())
    }

    /// Load resume data for a torrent
    ///
    /// Unreadable files are treated as absent so a corrupt resume file
    /// costs a re-check instead of blocking the torrent.
    pub async fn load_resume_data(&self, info_hash: &InfoHash) -> Option<ResumeData> {
        let resume_path = self.resume_file_path(info_hash);
        match ResumeData::load(&resume_path).await {
            Ok(data) => {
                debug!("Resume data for {}: {}", info_hash, if data.is_some() { "found" } else { "none" });
                data
            }
            Err(e) => {
                warn!("Ignoring unreadable resume data '{}': {}", resume_path.display(), e);
                None
            }
        }
    }

    /// Delete resume data for a torrent
    pub async fn delete_resume_data(&self, info_hash: &InfoHash) -> Result<()> {
        match fs::remove_file(self.resume_file_path(info_hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ResumeManager::new(dir.path().join("resume"));
        let info_hash = InfoHash::new([7u8; 20]);

        let mut bitfield = Bitfield::new(12);
        bitfield.set(3);
        bitfield.set(11);
        let mut data = ResumeData::new(&info_hash, &bitfield);
        data.pieces.push(PartialPiece { index: 4, blocks: vec![true, false] });

        manager.save_resume_data(&info_hash, &data).await.unwrap();
        let loaded = manager.load_resume_data(&info_hash).await.unwrap();

        assert_eq!(loaded, data);
        assert_eq!(loaded.bitfield().unwrap(), bitfield);
        assert!(loaded.matches(&info_hash, 12));
        assert!(!loaded.matches(&info_hash, 13));
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ResumeManager::new(dir.path().to_path_buf());
        let info_hash = InfoHash::new([8u8; 20]);

        assert!(manager.load_resume_data(&info_hash).await.is_none());

        std::fs::write(manager.resume_file_path(&info_hash), b"{not json").unwrap();
        assert!(manager.load_resume_data(&info_hash).await.is_none());

        manager.delete_resume_data(&info_hash).await.unwrap();
        manager.delete_resume_data(&info_hash).await.unwrap();
        assert!(!manager.resume_file_path(&info_hash).exists());
    }
}
