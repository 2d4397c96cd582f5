//! Piece store
//!
//! The authoritative record of which pieces are verified, and the mapping
//! from pieces to file regions. Also converts that record to and from
//! fast-resume data.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::storage::bitfield::Bitfield;
use crate::storage::resume::{PartialPiece, ResumeData};
use crate::torrent::TorrentMetadata;

/// Standard block size used for requests
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// A block of a piece, as requested on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRequest {
    pub piece: u32,
    /// Byte offset within the piece
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self { piece, offset, length }
    }
}

/// Part of a piece stored in one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRange {
    pub file_index: usize,
    /// Path relative to the save directory
    pub path: PathBuf,
    /// Offset inside the file
    pub offset: u64,
    pub length: u64,
}

/// Result of restoring persisted state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Pieces accepted as verified
    pub restored: usize,
    /// Pieces the resume data claimed but the files on disk cannot hold
    pub rejected: Vec<u32>,
    /// Partial pieces whose blocks may be reused
    pub partial: Vec<PartialPiece>,
}

/// Verified-piece bitfield plus on-disk layout
#[derive(Debug)]
pub struct PieceStore {
    metadata: Arc<TorrentMetadata>,
    bitfield: Bitfield,
    verified_bytes: u64,
}

impl PieceStore {
    /// Empty store: no piece verified
    pub fn new(metadata: Arc<TorrentMetadata>) -> Self {
        let bitfield = Bitfield::new(metadata.piece_count());
        Self {
            metadata,
            bitfield,
            verified_bytes: 0,
        }
    }

    /// Record a hash-verified piece; returns false if it was already complete
    pub fn mark_complete(&mut self, index: u32) -> bool {
        if !self.bitfield.set(index as usize) {
            return false;
        }
        self.verified_bytes += self.metadata.piece_size(index) as u64;
        true
    }

    pub fn is_complete(&self, index: u32) -> bool {
        self.bitfield.get(index as usize)
    }

    /// Verified bytes over total bytes
    pub fn completion_fraction(&self) -> f64 {
        let total = self.metadata.total_size();
        if total == 0 {
            return 1.0;
        }
        self.verified_bytes as f64 / total as f64
    }

    pub fn verified_bytes(&self) -> u64 {
        self.verified_bytes
    }

    pub fn completed_count(&self) -> usize {
        self.bitfield.count_ones()
    }

    /// Every piece verified
    pub fn is_seed(&self) -> bool {
        self.bitfield.all()
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Where the bytes of a piece live on disk
    pub fn file_ranges_for(&self, index: u32) -> Vec<FileRange> {
        let offset = self.metadata.piece_offset(index);
        let length = self.metadata.piece_size(index) as u64;
        self.metadata
            .slices_for(offset, length)
            .into_iter()
            .map(|slice| FileRange {
                file_index: slice.file_index,
                path: self.metadata.files[slice.file_index].path.clone(),
                offset: slice.offset,
                length: slice.length,
            })
            .collect()
    }

    /// Fraction of each file covered by verified pieces
    pub fn file_progress(&self) -> Vec<f64> {
        let mut done = vec![0u64; self.metadata.files.len()];
        for index in self.bitfield.iter_ones() {
            for range in self.file_ranges_for(index as u32) {
                done[range.file_index] += range.length;
            }
        }

        self.metadata
            .files
            .iter()
            .zip(done)
            .map(|(file, bytes)| if file.length == 0 { 1.0 } else { bytes as f64 / file.length as f64 })
            .collect()
    }

    /// Build resume data from the current bitfield and the given partial pieces
    pub fn to_resume(&self, partial: Vec<PartialPiece>) -> ResumeData {
        let mut data = ResumeData::new(&self.metadata.info_hash, &self.bitfield);
        data.pieces = partial;
        data
    }

    /// Trust persisted pieces only where the files on disk can hold them
    ///
    /// `file_lengths` is the current length of every file (`None` if it is
    /// missing). A piece is restored only when each of its file ranges ends
    /// within the file's on-disk length.
    pub fn restore(&mut self, resume: &ResumeData, file_lengths: &[Option<u64>]) -> RestoreReport {
        let mut report = RestoreReport::default();

        if !resume.matches(&self.metadata.info_hash, self.metadata.piece_count()) {
            warn!("Resume data does not belong to {}, ignoring it", self.metadata.info_hash);
            return report;
        }

        let persisted = match resume.bitfield() {
            Ok(bitfield) => bitfield,
            Err(e) => {
                warn!("Resume bitfield is malformed, ignoring it: {}", e);
                return report;
            }
        };

        for index in persisted.iter_ones() {
            let index = index as u32;
            if self.fits_on_disk(index, file_lengths) {
                if self.mark_complete(index) {
                    report.restored += 1;
                }
            } else {
                debug!("Piece {} fails on-disk size validation", index);
                report.rejected.push(index);
            }
        }

        for partial in &resume.pieces {
            let valid = (partial.index as usize) < self.metadata.piece_count()
                && !self.is_complete(partial.index)
                && partial.blocks.iter().any(|b| *b)
                && self.fits_on_disk(partial.index, file_lengths);
            if valid {
                report.partial.push(partial.clone());
            }
        }

        if !report.rejected.is_empty() {
            warn!(
                "{} persisted pieces of {} failed size validation and will be downloaded again",
                report.rejected.len(),
                self.metadata.name
            );
        }
        info!(
            "Restored {} verified pieces and {} partial pieces for {}",
            report.restored,
            report.partial.len(),
            self.metadata.name
        );
        report
    }

    /// Can the files on disk hold every byte of the piece
    pub fn fits_on_disk(&self, index: u32, file_lengths: &[Option<u64>]) -> bool {
        self.file_ranges_for(index).iter().all(|range| {
            matches!(file_lengths.get(range.file_index), Some(Some(len)) if *len >= range.offset + range.length)
        })
    }
}
