//! Disk cache
//!
//! Write-back block cache shared by every connection of a torrent. Blocks
//! are buffered in memory as they arrive and only hit the disk when their
//! piece is flushed or when memory runs short. Reads are served from memory
//! when possible.
//!
//! The cache state sits behind one short-held mutex; disk I/O and hashing
//! always happen with the lock released.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

use crate::config::EngineConfig;
use crate::stats::{CacheSnapshot, RateMeter};
use crate::storage::backend::StorageBackend;
use crate::torrent::TorrentMetadata;

/// How long a writer waits for space before re-checking
const SPACE_WAIT: Duration = Duration::from_millis(50);

type BlockKey = (u32, u32);

/// Cache tuning
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Memory budget for cached blocks
    pub capacity: usize,
    pub block_size: u32,
    /// Attempts per disk operation before giving up
    pub retry_attempts: u32,
    /// Delay before the first retry, doubled for each further retry
    pub retry_backoff: Duration,
}

impl CacheConfig {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            capacity: config.cache_capacity,
            block_size: config.block_size,
            retry_attempts: config.disk_retry_attempts,
            retry_backoff: config.disk_retry_backoff(),
        }
    }
}

/// Result of flushing a completed piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Written and hash-verified; the piece is now sealed
    Verified,
    /// Written but the hash did not match; cached blocks were discarded
    HashMismatch,
    /// Disk I/O kept failing after all retries
    Failed(String),
}

#[derive(Debug)]
struct CacheEntry {
    data: Bytes,
    dirty: bool,
    generation: u64,
    last_access: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: BTreeMap<BlockKey, CacheEntry>,
    used: usize,
    dirty_bytes: usize,
    /// Verified pieces: further writes are dropped
    sealed: HashSet<u32>,
    /// Pieces being flushed and hashed
    verifying: HashSet<u32>,
    /// Blocks accepted for unfinished pieces; the first write of a block wins
    received: HashSet<BlockKey>,
    generation: u64,
    clock: u64,
    spilling: bool,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, key: BlockKey, data: Bytes, dirty: bool) {
        self.remove(&key);
        self.generation += 1;
        let last_access = self.tick();
        self.used += data.len();
        if dirty {
            self.dirty_bytes += data.len();
        }
        self.entries.insert(
            key,
            CacheEntry {
                data,
                dirty,
                generation: self.generation,
                last_access,
            },
        );
    }

    fn remove(&mut self, key: &BlockKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.used -= entry.data.len();
        if entry.dirty {
            self.dirty_bytes -= entry.data.len();
        }
        Some(entry)
    }

    fn remove_piece(&mut self, piece: u32) {
        let keys: Vec<BlockKey> = self.entries.range((piece, 0)..=(piece, u32::MAX)).map(|(k, _)| *k).collect();
        for key in keys {
            self.remove(&key);
        }
        self.received.retain(|(p, _)| *p != piece);
    }

    fn mark_clean(&mut self, key: BlockKey, generation: u64) {
        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.dirty && entry.generation == generation {
                entry.dirty = false;
                self.dirty_bytes -= entry.data.len();
            }
        }
    }

    fn dirty_of_piece(&self, piece: u32) -> Vec<(BlockKey, Bytes, u64)> {
        self.entries
            .range((piece, 0)..=(piece, u32::MAX))
            .filter(|(_, e)| e.dirty)
            .map(|(k, e)| (*k, e.data.clone(), e.generation))
            .collect()
    }

    fn fits(&self, len: usize, capacity: usize) -> bool {
        self.entries.is_empty() || self.used + len <= capacity
    }

    /// Drop least recently used clean entries until `len` more bytes fit
    fn evict_clean(&mut self, len: usize, capacity: usize) {
        let mut clean: Vec<(u64, BlockKey)> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.dirty)
            .map(|(k, e)| (e.last_access, *k))
            .collect();
        clean.sort_unstable();

        for (_, key) in clean {
            if self.fits(len, capacity) {
                break;
            }
            self.remove(&key);
        }
    }

    /// Oldest dirty entries whose write-out would make room for `len` bytes
    fn spill_candidates(&self, len: usize, capacity: usize) -> Vec<(BlockKey, Bytes, u64)> {
        let mut dirty: Vec<(u64, BlockKey)> = self
            .entries
            .iter()
            .filter(|(k, e)| e.dirty && !self.verifying.contains(&k.0))
            .map(|(k, e)| (e.last_access, *k))
            .collect();
        dirty.sort_unstable();

        let needed = (self.used + len).saturating_sub(capacity);
        let mut freed = 0usize;
        let mut victims = Vec::new();
        for (_, key) in dirty {
            if freed >= needed {
                break;
            }
            if let Some(entry) = self.entries.get(&key) {
                freed += entry.data.len();
                victims.push((key, entry.data.clone(), entry.generation));
            }
        }
        victims
    }
}

/// Write-back block cache over a [`StorageBackend`]
#[derive(Debug)]
pub struct DiskCache {
    backend: Arc<dyn StorageBackend>,
    metadata: Arc<TorrentMetadata>,
    config: CacheConfig,
    state: Mutex<CacheState>,
    space: Notify,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    read_meter: Mutex<RateMeter>,
    write_meter: Mutex<RateMeter>,
}

impl DiskCache {
    pub fn new(backend: Arc<dyn StorageBackend>, metadata: Arc<TorrentMetadata>, config: CacheConfig) -> Self {
        debug!("Creating disk cache for {} with {} bytes", metadata.name, config.capacity);
        Self {
            backend,
            metadata,
            config,
            state: Mutex::new(CacheState::default()),
            space: Notify::new(),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            read_meter: Mutex::new(RateMeter::default()),
            write_meter: Mutex::new(RateMeter::default()),
        }
    }

    pub fn metadata(&self) -> &Arc<TorrentMetadata> {
        &self.metadata
    }

    /// Buffer a received block
    ///
    /// Returns `Ok(false)` when the block was dropped: the piece is already
    /// verified or being verified, or another copy of the block was accepted
    /// earlier. When the cache is full the call waits until clean entries can
    /// be evicted or dirty ones written out.
    pub async fn write_block(&self, piece: u32, offset: u32, data: Bytes) -> Result<bool> {
        let key = (piece, offset);
        let capacity = self.config.capacity;

        loop {
            let victims = {
                let mut state = self.state.lock();
                if state.sealed.contains(&piece) || state.verifying.contains(&piece) {
                    trace!("Dropping block {}:{} for finished piece", piece, offset);
                    return Ok(false);
                }
                if state.received.contains(&key) {
                    trace!("Dropping second copy of block {}:{}", piece, offset);
                    return Ok(false);
                }

                if !state.fits(data.len(), capacity) {
                    state.evict_clean(data.len(), capacity);
                }
                if state.fits(data.len(), capacity) {
                    state.insert(key, data.clone(), true);
                    state.received.insert(key);
                    return Ok(true);
                }

                if state.spilling {
                    Vec::new()
                } else {
                    let victims = state.spill_candidates(data.len(), capacity);
                    state.spilling = !victims.is_empty();
                    victims
                }
            };

            if victims.is_empty() {
                trace!("Cache full, waiting for space for block {}:{}", piece, offset);
                let _ = tokio::time::timeout(SPACE_WAIT, self.space.notified()).await;
                continue;
            }

            debug!("Cache full, spilling {} dirty blocks to disk", victims.len());
            let result = self.spill(victims).await;
            self.state.lock().spilling = false;
            self.space.notify_waiters();
            result?;
        }
    }

    async fn spill(&self, victims: Vec<(BlockKey, Bytes, u64)>) -> Result<()> {
        for (key, data, generation) in victims {
            self.write_to_disk(key, &data).await?;
            self.state.lock().mark_clean(key, generation);
        }
        Ok(())
    }

    /// Read a block, from memory when cached
    pub async fn read_block(&self, piece: u32, offset: u32, length: u32) -> Result<Bytes> {
        let key = (piece, offset);
        let length = length as usize;

        {
            let mut state = self.state.lock();
            let clock = state.tick();
            if let Some(entry) = state.entries.get_mut(&key) {
                if entry.data.len() >= length {
                    entry.last_access = clock;
                    return Ok(entry.data.slice(..length));
                }
            }
        }

        let torrent_offset = self.metadata.piece_offset(piece) + offset as u64;
        let data = Bytes::from(self.read_from_disk(torrent_offset, length).await?);

        let mut state = self.state.lock();
        if state.sealed.contains(&piece) && !state.entries.contains_key(&key) && state.used + length <= self.config.capacity {
            state.insert(key, data.clone(), false);
        }
        Ok(data)
    }

    /// Write all dirty blocks of a piece, then verify its hash
    pub async fn flush(&self, piece: u32) -> FlushOutcome {
        let dirty = {
            let mut state = self.state.lock();
            if state.sealed.contains(&piece) {
                return FlushOutcome::Verified;
            }
            state.verifying.insert(piece);
            state.dirty_of_piece(piece)
        };

        for (key, data, generation) in dirty {
            if let Err(e) = self.write_to_disk(key, &data).await {
                self.state.lock().verifying.remove(&piece);
                self.space.notify_waiters();
                return FlushOutcome::Failed(e.to_string());
            }
            self.state.lock().mark_clean(key, generation);
        }
        self.space.notify_waiters();

        let data = match self.assemble_piece(piece).await {
            Ok(data) => data,
            Err(e) => {
                self.state.lock().verifying.remove(&piece);
                return FlushOutcome::Failed(e.to_string());
            }
        };

        let matches = self.hash_matches(piece, data).await;

        let outcome = {
            let mut state = self.state.lock();
            state.verifying.remove(&piece);
            if matches {
                state.sealed.insert(piece);
                state.received.retain(|(p, _)| *p != piece);
                FlushOutcome::Verified
            } else {
                state.remove_piece(piece);
                FlushOutcome::HashMismatch
            }
        };
        self.space.notify_waiters();
        outcome
    }

    /// Hash a piece straight from disk; seals it on success
    pub async fn verify_from_disk(&self, piece: u32) -> Result<bool> {
        let offset = self.metadata.piece_offset(piece);
        let length = self.metadata.piece_size(piece) as usize;
        let data = self.read_from_disk(offset, length).await?;

        let matches = self.hash_matches(piece, data).await;
        if matches {
            self.seal(piece);
        }
        Ok(matches)
    }

    /// Mark a piece verified without hashing (restored from resume data)
    pub fn seal(&self, piece: u32) {
        let mut state = self.state.lock();
        state.sealed.insert(piece);
        state.received.retain(|(p, _)| *p != piece);
    }

    /// Has the piece been verified
    pub fn is_sealed(&self, piece: u32) -> bool {
        self.state.lock().sealed.contains(&piece)
    }

    /// Drop every cached block of a piece so it can be downloaded again
    pub fn discard(&self, piece: u32) {
        self.state.lock().remove_piece(piece);
        self.space.notify_waiters();
    }

    /// Drop one block that arrived for a piece the picker had already reset
    pub fn discard_block(&self, piece: u32, offset: u32) {
        let mut state = self.state.lock();
        if state.verifying.contains(&piece) || state.sealed.contains(&piece) {
            return;
        }
        state.remove(&(piece, offset));
        state.received.remove(&(piece, offset));
        drop(state);
        self.space.notify_waiters();
    }

    /// Write every dirty block to disk without verifying; used on stop
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty: Vec<(BlockKey, Bytes, u64)> = {
            let state = self.state.lock();
            state
                .entries
                .iter()
                .filter(|(_, e)| e.dirty)
                .map(|(k, e)| (*k, e.data.clone(), e.generation))
                .collect()
        };

        let count = dirty.len();
        self.spill(dirty).await?;
        self.space.notify_waiters();
        debug!("Flushed {} dirty blocks for {}", count, self.metadata.name);
        Ok(count)
    }

    /// Current counters
    pub fn stats(&self) -> CacheSnapshot {
        let state = self.state.lock();
        CacheSnapshot {
            used_bytes: state.used,
            capacity: self.config.capacity,
            dirty_bytes: state.dirty_bytes,
            entries: state.entries.len(),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            read_rate: self.read_meter.lock().rate(),
            write_rate: self.write_meter.lock().rate(),
        }
    }

    async fn assemble_piece(&self, piece: u32) -> Result<Vec<u8>> {
        let block_size = self.config.block_size;
        let piece_size = self.metadata.piece_size(piece) as usize;
        let mut data = Vec::with_capacity(piece_size);

        for block in 0..self.metadata.block_count(piece, block_size) {
            let offset = block as u32 * block_size;
            let length = self.metadata.block_length(piece, block, block_size) as usize;
            let cached = {
                let state = self.state.lock();
                state
                    .entries
                    .get(&(piece, offset))
                    .filter(|e| e.data.len() == length)
                    .map(|e| e.data.clone())
            };
            match cached {
                Some(bytes) => data.extend_from_slice(&bytes),
                None => {
                    let torrent_offset = self.metadata.piece_offset(piece) + offset as u64;
                    data.extend_from_slice(&self.read_from_disk(torrent_offset, length).await?);
                }
            }
        }

        Ok(data)
    }

    async fn hash_matches(&self, piece: u32, data: Vec<u8>) -> bool {
        let Some(expected) = self.metadata.piece_hash(piece).copied() else {
            return false;
        };
        match tokio::task::spawn_blocking(move || expected.matches(&data)).await {
            Ok(matches) => matches,
            Err(e) => {
                error!("Hashing task for piece {} failed: {}", piece, e);
                false
            }
        }
    }

    async fn write_to_disk(&self, key: BlockKey, data: &[u8]) -> Result<()> {
        let offset = self.metadata.piece_offset(key.0) + key.1 as u64;
        self.with_retry("write", || self.backend.write_at(offset, data)).await?;
        self.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.write_meter.lock().record(data.len() as u64);
        Ok(())
    }

    async fn read_from_disk(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let data = self.with_retry("read", || self.backend.read_at(offset, length)).await?;
        self.bytes_read.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.read_meter.lock().record(data.len() as u64);
        Ok(data)
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.retry_attempts.max(1);
        let mut delay = self.config.retry_backoff;
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => {
                    error!("Disk {} failed after {} attempts: {}", what, attempts, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Disk {} failed (attempt {}/{}), retrying in {:?}: {}", what, attempt, attempts, delay, e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{BlockOutcome, PickMode, PieceManager};
    use crate::peer::{ConnectionState, Direction, PeerRecord};
    use crate::storage::file::FileStorage;
    use crate::storage::BlockRequest;
    use crate::testing::{FailingBackend, GatedBackend};
    use std::net::SocketAddr;
    use crate::torrent::TorrentParser;

    fn torrent(piece_length: u64, len: usize) -> (Arc<TorrentMetadata>, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let bytes = TorrentParser::build_single_file("cache.bin", piece_length, &data, None).unwrap();
        (Arc::new(TorrentParser::parse_bytes(&bytes).unwrap()), data)
    }

    fn config(capacity: usize, block_size: u32) -> CacheConfig {
        CacheConfig {
            capacity,
            block_size,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(1),
        }
    }

    async fn file_cache(dir: &std::path::Path, metadata: Arc<TorrentMetadata>, capacity: usize, block_size: u32) -> DiskCache {
        let storage = FileStorage::new(dir.to_path_buf(), metadata.clone());
        storage.allocate().await.unwrap();
        DiskCache::new(Arc::new(storage), metadata, config(capacity, block_size))
    }

    #[tokio::test]
    async fn test_write_then_read_from_memory() {
        let dir = tempfile::tempdir().unwrap();
        let (metadata, data) = torrent(1024, 2048);
        let cache = file_cache(dir.path(), metadata, 1 << 20, 512).await;

        assert!(cache.write_block(0, 512, Bytes::copy_from_slice(&data[512..1024])).await.unwrap());
        let block = cache.read_block(0, 512, 512).await.unwrap();
        assert_eq!(block.as_ref(), &data[512..1024]);

        let stats = cache.stats();
        assert_eq!(stats.dirty_bytes, 512);
        assert_eq!(stats.bytes_written, 0);
    }

    #[tokio::test]
    async fn test_flush_verifies_and_seals() {
        let dir = tempfile::tempdir().unwrap();
        let (metadata, data) = torrent(1024, 2048);
        let cache = file_cache(dir.path(), metadata, 1 << 20, 512).await;

        cache.write_block(1, 0, Bytes::copy_from_slice(&data[1024..1536])).await.unwrap();
        cache.write_block(1, 512, Bytes::copy_from_slice(&data[1536..2048])).await.unwrap();

        assert_eq!(cache.flush(1).await, FlushOutcome::Verified);
        assert!(!cache.write_block(1, 0, Bytes::from_static(b"late")).await.unwrap());

        let on_disk = std::fs::read(dir.path().join("cache.bin")).unwrap();
        assert_eq!(&on_disk[1024..2048], &data[1024..2048]);
        assert_eq!(cache.stats().dirty_bytes, 0);
        assert_eq!(cache.stats().bytes_written, 1024);
    }

    #[tokio::test]
    async fn test_flush_mismatch_discards_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let (metadata, data) = torrent(1024, 2048);
        let cache = file_cache(dir.path(), metadata, 1 << 20, 512).await;

        cache.write_block(0, 0, Bytes::copy_from_slice(&data[..512])).await.unwrap();
        cache.write_block(0, 512, Bytes::from(vec![0xee; 512])).await.unwrap();

        assert_eq!(cache.flush(0).await, FlushOutcome::HashMismatch);
        assert_eq!(cache.stats().entries, 0);
        assert!(cache.write_block(0, 0, Bytes::copy_from_slice(&data[..512])).await.unwrap());
    }

    #[tokio::test]
    async fn test_full_cache_spills_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (metadata, data) = torrent(1024, 4096);
        let cache = file_cache(dir.path(), metadata, 1024, 512).await;

        for (piece, offset) in [(0u32, 0u32), (0, 512), (1, 0), (1, 512)] {
            let start = piece as usize * 1024 + offset as usize;
            cache.write_block(piece, offset, Bytes::copy_from_slice(&data[start..start + 512])).await.unwrap();
        }

        let stats = cache.stats();
        assert!(stats.used_bytes <= 1024);
        assert!(stats.bytes_written >= 1024);

        // piece 0 was spilled; flush still verifies it from disk
        assert_eq!(cache.flush(0).await, FlushOutcome::Verified);
        assert_eq!(cache.flush(1).await, FlushOutcome::Verified);
    }

    #[tokio::test]
    async fn test_writers_wait_for_space_while_disk_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (metadata, data) = torrent(1024, 4096);
        let storage = FileStorage::new(dir.path().to_path_buf(), metadata.clone());
        storage.allocate().await.unwrap();
        let backend = Arc::new(GatedBackend::new(storage));
        let cache = Arc::new(DiskCache::new(backend.clone(), metadata, config(1024, 512)));

        cache.write_block(0, 0, Bytes::copy_from_slice(&data[..512])).await.unwrap();
        cache.write_block(0, 512, Bytes::copy_from_slice(&data[512..1024])).await.unwrap();

        // full of dirty blocks: one writer spills, the other waits on it
        let writers: Vec<_> = [0u32, 512]
            .into_iter()
            .map(|offset| {
                let cache = cache.clone();
                let block = Bytes::copy_from_slice(&data[1024 + offset as usize..1536 + offset as usize]);
                tokio::spawn(async move { cache.write_block(1, offset, block).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(writers.iter().all(|writer| !writer.is_finished()));
        assert_eq!(cache.stats().bytes_written, 0);

        backend.open();
        for writer in writers {
            let stored = tokio::time::timeout(Duration::from_secs(5), writer).await.unwrap().unwrap();
            assert!(stored.unwrap());
        }
        let stats = cache.stats();
        assert!(stats.used_bytes <= 1024);
        assert!(stats.bytes_written >= 1024);
        assert_eq!(cache.flush(0).await, FlushOutcome::Verified);
        assert_eq!(cache.flush(1).await, FlushOutcome::Verified);
    }

    fn supplier(port: u16) -> PeerRecord {
        let mut record = PeerRecord::new(SocketAddr::from(([10, 0, 0, 1], port)), Direction::Outgoing, 1);
        record.state = ConnectionState::Active;
        record.bitfield.set(0);
        record
    }

    /// One piece of two blocks, requested from both peers in end-game
    async fn endgame(dir: &std::path::Path) -> (DiskCache, PieceManager, Vec<u8>, Vec<BlockRequest>, PeerRecord, PeerRecord) {
        let (metadata, data) = torrent(1024, 1024);
        let cache = file_cache(dir, metadata.clone(), 1 << 20, 512).await;
        let mut picker = PieceManager::new(metadata, 512, PickMode::RarestFirst);
        let mut honest = supplier(1);
        let corrupt = supplier(2);
        picker.peer_bitfield(&honest.bitfield);
        picker.peer_bitfield(&corrupt.bitfield);

        let blocks = picker.select_requests(&honest, 4);
        honest.track_requests(&blocks);
        assert_eq!(picker.select_requests(&corrupt, 4), blocks);
        assert!(picker.in_endgame());
        (cache, picker, data, blocks, honest, corrupt)
    }

    #[tokio::test]
    async fn test_endgame_copy_cannot_replace_accepted_block() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, mut picker, data, blocks, honest, corrupt) = endgame(dir.path()).await;

        assert!(cache.write_block(0, 0, Bytes::copy_from_slice(&data[..512])).await.unwrap());
        assert_eq!(
            picker.on_block_received(honest.addr, blocks[0]),
            BlockOutcome::Accepted { piece_complete: false, cancel: vec![corrupt.addr] }
        );

        // the corrupt copy lands before the cancel reaches its sender
        assert!(!cache.write_block(0, 0, Bytes::from(vec![0xee; 512])).await.unwrap());
        picker.release_block(corrupt.addr, blocks[0]);

        assert!(cache.write_block(0, 512, Bytes::copy_from_slice(&data[512..])).await.unwrap());
        assert_eq!(
            picker.on_block_received(honest.addr, blocks[1]),
            BlockOutcome::Accepted { piece_complete: true, cancel: vec![corrupt.addr] }
        );
        assert_eq!(cache.flush(0).await, FlushOutcome::Verified);
    }

    #[tokio::test]
    async fn test_endgame_mismatch_blames_the_supplier_whose_bytes_were_kept() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, mut picker, data, blocks, honest, corrupt) = endgame(dir.path()).await;

        for block in &blocks {
            assert!(cache.write_block(0, block.offset, Bytes::from(vec![0xee; 512])).await.unwrap());
            assert!(matches!(picker.on_block_received(corrupt.addr, *block), BlockOutcome::Accepted { .. }));

            let start = block.offset as usize;
            let good = Bytes::copy_from_slice(&data[start..start + 512]);
            assert!(!cache.write_block(0, block.offset, good).await.unwrap());
        }

        assert_eq!(cache.flush(0).await, FlushOutcome::HashMismatch);
        assert_eq!(picker.on_piece_failed(0), vec![corrupt.addr]);

        // the piece starts over and the honest copy is accepted now
        assert!(cache.write_block(0, 0, Bytes::copy_from_slice(&data[..512])).await.unwrap());
        assert!(honest.outstanding.contains(&blocks[0]));
    }

    #[tokio::test]
    async fn test_discard_block_forgets_a_stale_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (metadata, data) = torrent(1024, 1024);
        let cache = file_cache(dir.path(), metadata, 1 << 20, 512).await;

        assert!(cache.write_block(0, 0, Bytes::from(vec![0xee; 512])).await.unwrap());
        cache.discard_block(0, 0);
        assert_eq!(cache.stats().entries, 0);
        assert!(cache.write_block(0, 0, Bytes::copy_from_slice(&data[..512])).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (metadata, data) = torrent(1024, 2048);
        std::fs::write(dir.path().join("cache.bin"), &data).unwrap();
        let cache = file_cache(dir.path(), metadata, 1 << 20, 512).await;

        assert!(cache.verify_from_disk(0).await.unwrap());
        assert!(!cache.write_block(0, 0, Bytes::from_static(b"x")).await.unwrap());
    }

    #[tokio::test]
    async fn test_flush_failure_after_retries() {
        let (metadata, data) = torrent(1024, 1024);
        let backend = Arc::new(FailingBackend::default());
        let cache = DiskCache::new(backend.clone(), metadata, config(1 << 20, 1024));

        cache.write_block(0, 0, Bytes::copy_from_slice(&data)).await.unwrap();
        match cache.flush(0).await {
            FlushOutcome::Failed(reason) => assert!(reason.contains("disk unplugged")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(backend.writes(), 3);

        // the block stays accepted until the piece is discarded
        assert!(!cache.write_block(0, 0, Bytes::copy_from_slice(&data)).await.unwrap());
        cache.discard(0);
        assert_eq!(cache.stats().entries, 0);
        assert!(cache.write_block(0, 0, Bytes::copy_from_slice(&data)).await.unwrap());
    }
}
