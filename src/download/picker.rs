//! Piece picker
//!
//! Decides which blocks to request from which peer. Tracks how many peers
//! have each piece, which blocks of unfinished pieces are missing, requested
//! or received, and who supplied each received block so a failed hash can
//! be blamed on the right peers.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::peer::PeerRecord;
use crate::storage::{Bitfield, BlockRequest, PartialPiece};
use crate::torrent::TorrentMetadata;

/// Piece ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickMode {
    /// Fewest peers first, partially requested pieces break ties
    RarestFirst,
    /// Lowest index first
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockState {
    Missing,
    /// In flight to these peers (several only in end-game)
    Requested(Vec<SocketAddr>),
    /// Buffered or on disk; `None` when restored from resume data
    Received(Option<SocketAddr>),
}

#[derive(Debug)]
struct PieceProgress {
    blocks: Vec<BlockState>,
    /// All blocks received, hash check running
    verifying: bool,
}

/// Result of accepting a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    Accepted {
        /// Every block of the piece is now received
        piece_complete: bool,
        /// Other peers the same block is still requested from
        cancel: Vec<SocketAddr>,
    },
    /// Already received, or the piece is no longer being downloaded
    Duplicate,
}

/// Tracks piece availability and block assignment
#[derive(Debug)]
pub struct PieceManager {
    metadata: Arc<TorrentMetadata>,
    block_size: u32,
    mode: PickMode,
    completed: Bitfield,
    availability: Vec<u32>,
    in_progress: BTreeMap<u32, PieceProgress>,
}

impl PieceManager {
    pub fn new(metadata: Arc<TorrentMetadata>, block_size: u32, mode: PickMode) -> Self {
        let piece_count = metadata.piece_count();
        Self {
            metadata,
            block_size,
            mode,
            completed: Bitfield::new(piece_count),
            availability: vec![0; piece_count],
            in_progress: BTreeMap::new(),
        }
    }

    /// Adopt already verified pieces
    pub fn set_completed(&mut self, completed: &Bitfield) {
        for piece in completed.iter_ones() {
            self.completed.set(piece);
            self.in_progress.remove(&(piece as u32));
        }
    }

    pub fn is_complete(&self, piece: u32) -> bool {
        self.completed.get(piece as usize)
    }

    pub fn availability(&self, piece: u32) -> u32 {
        self.availability.get(piece as usize).copied().unwrap_or(0)
    }

    pub fn peer_bitfield(&mut self, bitfield: &Bitfield) {
        for piece in bitfield.iter_ones() {
            if let Some(count) = self.availability.get_mut(piece) {
                *count += 1;
            }
        }
    }

    /// A peer announced a piece it did not have before
    pub fn peer_have(&mut self, piece: u32) {
        if let Some(count) = self.availability.get_mut(piece as usize) {
            *count += 1;
        }
    }

    /// Does the peer have anything we still need
    pub fn is_interesting(&self, bitfield: &Bitfield) -> bool {
        bitfield.iter_ones().any(|piece| !self.completed.get(piece))
    }

    /// Blocks to request from `peer`, at most filling its window
    ///
    /// Never returns a block already requested from someone else unless
    /// every unfinished piece has all of its blocks requested (end-game).
    pub fn select_requests(&mut self, peer: &PeerRecord, max_outstanding: usize) -> Vec<BlockRequest> {
        let mut window = max_outstanding.saturating_sub(peer.outstanding.len());
        let mut picks = Vec::new();
        if window == 0 {
            return picks;
        }

        let candidates = self.candidate_pieces(&peer.bitfield);

        for &piece in &candidates {
            let block_count = self.metadata.block_count(piece, self.block_size);
            let progress = self.in_progress.entry(piece).or_insert_with(|| PieceProgress {
                blocks: vec![BlockState::Missing; block_count],
                verifying: false,
            });

            for (index, state) in progress.blocks.iter_mut().enumerate() {
                if *state == BlockState::Missing {
                    *state = BlockState::Requested(vec![peer.addr]);
                    picks.push(block_request(&self.metadata, piece, index, self.block_size));
                    window -= 1;
                    if window == 0 {
                        return picks;
                    }
                }
            }
        }

        if !self.in_endgame() {
            return picks;
        }

        for &piece in &candidates {
            let Some(progress) = self.in_progress.get_mut(&piece) else {
                continue;
            };
            for (index, state) in progress.blocks.iter_mut().enumerate() {
                if let BlockState::Requested(holders) = state {
                    let request = block_request(&self.metadata, piece, index, self.block_size);
                    if holders.contains(&peer.addr) || peer.outstanding.contains(&request) {
                        continue;
                    }
                    trace!("End-game: also requesting {}:{} from {}", piece, request.offset, peer.addr);
                    holders.push(peer.addr);
                    picks.push(request);
                    window -= 1;
                    if window == 0 {
                        return picks;
                    }
                }
            }
        }

        picks
    }

    /// Pieces the peer has that we could download, best first
    fn candidate_pieces(&self, bitfield: &Bitfield) -> Vec<u32> {
        let mut pieces: Vec<u32> = bitfield
            .iter_ones()
            .map(|piece| piece as u32)
            .filter(|piece| !self.completed.get(*piece as usize))
            .filter(|piece| !self.in_progress.get(piece).is_some_and(|p| p.verifying))
            .collect();

        match self.mode {
            PickMode::Sequential => pieces.sort_unstable(),
            PickMode::RarestFirst => pieces.sort_by_key(|piece| {
                (self.availability(*piece), !self.in_progress.contains_key(piece), *piece)
            }),
        }
        pieces
    }

    /// Every unfinished piece has all of its blocks requested or received
    pub fn in_endgame(&self) -> bool {
        let mut unfinished = (0..self.metadata.piece_count() as u32)
            .filter(|piece| !self.completed.get(*piece as usize))
            .peekable();
        if unfinished.peek().is_none() {
            return false;
        }
        unfinished.all(|piece| match self.in_progress.get(&piece) {
            Some(progress) => !progress.blocks.contains(&BlockState::Missing),
            None => false,
        })
    }

    /// Record an arrived block
    pub fn on_block_received(&mut self, peer: SocketAddr, block: BlockRequest) -> BlockOutcome {
        let Some(index) = self.block_index(&block) else {
            return BlockOutcome::Duplicate;
        };
        let Some(progress) = self.in_progress.get_mut(&block.piece) else {
            return BlockOutcome::Duplicate;
        };
        if progress.verifying {
            return BlockOutcome::Duplicate;
        }

        let cancel = match &progress.blocks[index] {
            BlockState::Received(_) => return BlockOutcome::Duplicate,
            BlockState::Requested(holders) => holders.iter().copied().filter(|addr| *addr != peer).collect(),
            BlockState::Missing => Vec::new(),
        };
        progress.blocks[index] = BlockState::Received(Some(peer));

        let piece_complete = progress.blocks.iter().all(|b| matches!(b, BlockState::Received(_)));
        if piece_complete {
            progress.verifying = true;
            debug!("All blocks of piece {} received", block.piece);
        }
        BlockOutcome::Accepted { piece_complete, cancel }
    }

    /// Return a request of `peer` to the pool (timeout, choke, rejected)
    pub fn release_block(&mut self, peer: SocketAddr, block: BlockRequest) {
        let Some(index) = self.block_index(&block) else {
            return;
        };
        let Some(progress) = self.in_progress.get_mut(&block.piece) else {
            return;
        };
        if let BlockState::Requested(holders) = &mut progress.blocks[index] {
            holders.retain(|addr| *addr != peer);
            if holders.is_empty() {
                progress.blocks[index] = BlockState::Missing;
            }
        }
    }

    /// Forget a peer: drop its availability and release its requests
    pub fn peer_disconnected(
        &mut self,
        peer: SocketAddr,
        bitfield: &Bitfield,
        outstanding: impl IntoIterator<Item = BlockRequest>,
    ) {
        for piece in bitfield.iter_ones() {
            if let Some(count) = self.availability.get_mut(piece) {
                *count = count.saturating_sub(1);
            }
        }
        for block in outstanding {
            self.release_block(peer, block);
        }
    }

    pub fn on_piece_verified(&mut self, piece: u32) {
        self.completed.set(piece as usize);
        self.in_progress.remove(&piece);
    }

    /// Hash mismatch: every block goes back to Missing. Returns each distinct
    /// peer that supplied a block of the piece.
    pub fn on_piece_failed(&mut self, piece: u32) -> Vec<SocketAddr> {
        let Some(progress) = self.in_progress.remove(&piece) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        progress
            .blocks
            .into_iter()
            .filter_map(|state| match state {
                BlockState::Received(Some(addr)) => Some(addr),
                _ => None,
            })
            .filter(|addr| seen.insert(*addr))
            .collect()
    }

    /// Start a piece over without blaming anyone (disk failure)
    pub fn reset_piece(&mut self, piece: u32) {
        self.in_progress.remove(&piece);
    }

    /// Block requests in flight, counting end-game duplicates
    pub fn outstanding_requests(&self) -> usize {
        self.in_progress
            .values()
            .flat_map(|progress| progress.blocks.iter())
            .map(|state| match state {
                BlockState::Requested(holders) => holders.len(),
                _ => 0,
            })
            .sum()
    }

    /// Reuse blocks already on disk from a previous session
    pub fn restore_partial(&mut self, partial: &[PartialPiece]) {
        for entry in partial {
            if self.completed.get(entry.index as usize) {
                continue;
            }
            let block_count = self.metadata.block_count(entry.index, self.block_size);
            if entry.blocks.len() != block_count {
                debug!("Ignoring partial piece {} with {} blocks", entry.index, entry.blocks.len());
                continue;
            }
            let blocks = entry
                .blocks
                .iter()
                .map(|have| if *have { BlockState::Received(None) } else { BlockState::Missing })
                .collect();
            self.in_progress.insert(
                entry.index,
                PieceProgress {
                    blocks,
                    verifying: false,
                },
            );
        }
    }

    /// Received blocks of unfinished pieces, for resume data
    pub fn partial_pieces(&self) -> Vec<PartialPiece> {
        self.in_progress
            .iter()
            .filter(|(_, progress)| progress.blocks.iter().any(|b| matches!(b, BlockState::Received(_))))
            .map(|(piece, progress)| PartialPiece {
                index: *piece,
                blocks: progress
                    .blocks
                    .iter()
                    .map(|b| matches!(b, BlockState::Received(_)))
                    .collect(),
            })
            .collect()
    }

    /// Restored pieces whose blocks are all present and only need hashing
    pub fn take_ready_pieces(&mut self) -> Vec<u32> {
        let mut ready = Vec::new();
        for (piece, progress) in self.in_progress.iter_mut() {
            if !progress.verifying && progress.blocks.iter().all(|b| matches!(b, BlockState::Received(_))) {
                progress.verifying = true;
                ready.push(*piece);
            }
        }
        ready
    }

    fn block_index(&self, block: &BlockRequest) -> Option<usize> {
        if block.piece as usize >= self.metadata.piece_count() || block.offset % self.block_size != 0 {
            return None;
        }
        let index = (block.offset / self.block_size) as usize;
        if index >= self.metadata.block_count(block.piece, self.block_size)
            || block.length != self.metadata.block_length(block.piece, index, self.block_size)
        {
            return None;
        }
        Some(index)
    }
}

fn block_request(metadata: &TorrentMetadata, piece: u32, index: usize, block_size: u32) -> BlockRequest {
    BlockRequest::new(piece, index as u32 * block_size, metadata.block_length(piece, index, block_size))
}
