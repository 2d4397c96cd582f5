//! Storage backend abstraction
//!
//! The disk cache talks to its backing store through this trait so the
//! write path can be exercised against something other than the local
//! filesystem.

use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;

/// Byte-addressed store for one torrent's payload
///
/// Offsets are positions in the torrent's concatenated byte stream; the
/// backend maps them onto files.
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug {
    /// Create directories and size files so every offset is addressable
    async fn allocate(&self) -> Result<()>;

    /// Current on-disk length of each file, `None` when it does not exist
    async fn file_lengths(&self) -> Result<Vec<Option<u64>>>;

    /// Write `data` at torrent offset `offset`
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Read `length` bytes at torrent offset `offset`
    async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>>;
}
