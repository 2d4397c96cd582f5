//! Torrent metadata
//!
//! The immutable description of a torrent: piece geometry, piece hashes,
//! file layout and tracker tiers. Built once from a parsed descriptor and
//! shared read-only (behind an `Arc`) by every component of the engine.

use std::fmt;
use std::path::{Component, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::error::TorrentError;

/// 20-byte torrent identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Wrap raw bytes
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Raw bytes as sent in the handshake
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex form, used for resume file names and logs
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 40 character hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| TorrentError::parse_error_with_source("Invalid info hash hex", e.to_string()))?;
        let array: [u8; 20] = bytes
            .try_into()
            .map_err(|_| TorrentError::parse_error("Info hash must be 20 bytes"))?;
        Ok(Self(array))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Expected digest of one piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceHash {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl PieceHash {
    /// SHA1 digest of `data`
    pub fn sha1_of(data: &[u8]) -> Self {
        PieceHash::Sha1(Sha1::digest(data).into())
    }

    /// SHA256 digest of `data`
    pub fn sha256_of(data: &[u8]) -> Self {
        PieceHash::Sha256(Sha256::digest(data).into())
    }

    /// Hash `data` with the same algorithm and compare
    pub fn matches(&self, data: &[u8]) -> bool {
        match self {
            PieceHash::Sha1(expected) => {
                let actual: [u8; 20] = Sha1::digest(data).into();
                actual == *expected
            }
            PieceHash::Sha256(expected) => {
                let actual: [u8; 32] = Sha256::digest(data).into();
                actual == *expected
            }
        }
    }
}

/// One file of the torrent and where it sits in the torrent's byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the save directory
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
    /// Byte offset of the first byte of this file within the torrent
    pub offset: u64,
}

/// A contiguous part of a torrent byte range that falls inside a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
    pub file_index: usize,
    /// Offset inside the file
    pub offset: u64,
    pub length: u64,
}

/// Immutable torrent description
#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u64,
    pub pieces: Vec<PieceHash>,
    pub files: Vec<FileEntry>,
    /// Tracker tiers, each tier a list of announce URLs
    pub trackers: Vec<Vec<String>>,
}

impl TorrentMetadata {
    /// Build metadata from its parts, computing file offsets, and validate it
    pub fn new(
        info_hash: InfoHash,
        name: impl Into<String>,
        piece_length: u64,
        pieces: Vec<PieceHash>,
        files: Vec<(PathBuf, u64)>,
        trackers: Vec<Vec<String>>,
    ) -> Result<Self> {
        let mut offset = 0u64;
        let files = files
            .into_iter()
            .map(|(path, length)| {
                let entry = FileEntry { path, length, offset };
                offset += length;
                entry
            })
            .collect();

        let metadata = Self {
            info_hash,
            name: name.into(),
            piece_length,
            pieces,
            files,
            trackers,
        };
        metadata.validate()?;
        Ok(metadata)
    }

    /// Reject descriptors the engine cannot download
    pub fn validate(&self) -> Result<()> {
        if self.piece_length == 0 {
            return Err(TorrentError::config_error_with_field("Piece length must be positive", "piece_length").into());
        }
        if self.pieces.is_empty() {
            return Err(TorrentError::config_error_with_field("Torrent has no pieces", "pieces").into());
        }
        if self.files.is_empty() {
            return Err(TorrentError::config_error_with_field("Torrent has no files", "files").into());
        }

        let total = self.total_size();
        let expected = total.div_ceil(self.piece_length);
        if expected != self.pieces.len() as u64 {
            return Err(TorrentError::config_error_with_field(
                format!("Expected {} pieces for {} bytes, descriptor lists {}", expected, total, self.pieces.len()),
                "pieces",
            )
            .into());
        }

        for file in &self.files {
            let escapes = file.path.as_os_str().is_empty()
                || file
                    .path
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_)));
            if escapes {
                return Err(TorrentError::config_error_with_field(
                    format!("Unsafe file path in torrent: {}", file.path.display()),
                    "files",
                )
                .into());
            }
        }

        Ok(())
    }

    /// Total payload size
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// Number of pieces
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Byte offset of a piece within the torrent
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length
    }

    /// Size of a piece; only the last one may be shorter than `piece_length`
    pub fn piece_size(&self, index: u32) -> u32 {
        let start = self.piece_offset(index);
        let total = self.total_size();
        if start >= total {
            return 0;
        }
        (total - start).min(self.piece_length) as u32
    }

    /// Number of blocks a piece splits into
    pub fn block_count(&self, index: u32, block_size: u32) -> usize {
        self.piece_size(index).div_ceil(block_size) as usize
    }

    /// Length of one block; the last block of a piece may be short
    pub fn block_length(&self, index: u32, block_index: usize, block_size: u32) -> u32 {
        let start = block_index as u32 * block_size;
        self.piece_size(index).saturating_sub(start).min(block_size)
    }

    /// Expected hash of a piece
    pub fn piece_hash(&self, index: u32) -> Option<&PieceHash> {
        self.pieces.get(index as usize)
    }

    /// Split a torrent byte range into per-file slices
    pub fn slices_for(&self, offset: u64, length: u64) -> Vec<FileSlice> {
        let end = offset + length;
        self.files
            .iter()
            .enumerate()
            .filter_map(|(file_index, file)| {
                let file_end = file.offset + file.length;
                let start = offset.max(file.offset);
                let stop = end.min(file_end);
                (start < stop).then(|| FileSlice {
                    file_index,
                    offset: start - file.offset,
                    length: stop - start,
                })
            })
            .collect()
    }

    /// All tracker URLs, tier order preserved
    pub fn tracker_urls(&self) -> impl Iterator<Item = &str> {
        self.trackers.iter().flatten().map(String::as_str)
    }
}
