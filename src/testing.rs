//! Shared test fixtures
//!
//! Generated torrents and in-process fake peers listening on loopback.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::error::TorrentError;
use crate::protocol::{max_frame_len, read_message, write_message, Handshake, Message};
use crate::storage::{Bitfield, CacheConfig, DiskCache, FileStorage, StorageBackend};
use crate::torrent::{InfoHash, TorrentMetadata, TorrentParser};

/// A generated single-file torrent and its payload
#[derive(Debug, Clone)]
pub struct TestTorrent {
    pub metadata: Arc<TorrentMetadata>,
    pub data: Vec<u8>,
}

impl TestTorrent {
    pub fn new(name: &str, piece_length: u64, len: usize) -> Self {
        let data: Vec<u8> = (0..len).map(|i| ((i * 7 + i / 251) % 256) as u8).collect();
        let bytes = TorrentParser::build_single_file(name, piece_length, &data, None).unwrap();
        let metadata = Arc::new(TorrentParser::parse_bytes(&bytes).unwrap());
        Self { metadata, data }
    }

    pub fn piece(&self, index: u32) -> &[u8] {
        let start = self.metadata.piece_offset(index) as usize;
        let end = start + self.metadata.piece_size(index) as usize;
        &self.data[start..end]
    }

    /// Write the whole payload where a download into `dir` would put it
    pub fn write_to(&self, dir: &Path) {
        std::fs::write(dir.join(&self.metadata.files[0].path), &self.data).unwrap();
    }
}

/// A file-backed cache with allocated files below `dir`
pub async fn file_cache(dir: &Path, metadata: Arc<TorrentMetadata>) -> Arc<DiskCache> {
    let storage = FileStorage::new(dir.to_path_buf(), metadata.clone());
    storage.allocate().await.unwrap();
    let config = CacheConfig {
        capacity: 4 * 1024 * 1024,
        block_size: 16 * 1024,
        retry_attempts: 2,
        retry_backoff: Duration::from_millis(1),
    };
    Arc::new(DiskCache::new(Arc::new(storage), metadata, config))
}

/// Engine configuration with short timers for tests
pub fn test_config(resume_dir: &Path) -> EngineConfig {
    EngineConfig {
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        connect_timeout_ms: 2_000,
        handshake_timeout_ms: 2_000,
        tick_interval_ms: 50,
        choke_ticks: 4,
        stop_timeout_ms: 2_000,
        disk_retry_backoff_ms: 1,
        resume_dir: Some(resume_dir.to_path_buf()),
        ..Default::default()
    }
}

/// A backend whose disk is gone: every read and write fails
#[derive(Debug, Default)]
pub struct FailingBackend {
    writes: AtomicU32,
}

impl FailingBackend {
    /// Write attempts so far
    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for FailingBackend {
    async fn allocate(&self) -> Result<()> {
        Ok(())
    }

    async fn file_lengths(&self) -> Result<Vec<Option<u64>>> {
        Ok(vec![None])
    }

    async fn write_at(&self, _offset: u64, _data: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(TorrentError::storage_error("disk unplugged").into())
    }

    async fn read_at(&self, _offset: u64, _length: usize) -> Result<Vec<u8>> {
        Err(TorrentError::storage_error("disk unplugged").into())
    }
}

/// File storage whose reads each take `delay`
#[derive(Debug)]
pub struct SlowBackend {
    inner: FileStorage,
    delay: Duration,
}

impl SlowBackend {
    pub fn new(inner: FileStorage, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl StorageBackend for SlowBackend {
    async fn allocate(&self) -> Result<()> {
        self.inner.allocate().await
    }

    async fn file_lengths(&self) -> Result<Vec<Option<u64>>> {
        self.inner.file_lengths().await
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.inner.write_at(offset, data).await
    }

    async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        tokio::time::sleep(self.delay).await;
        self.inner.read_at(offset, length).await
    }
}

/// File storage whose writes hold until [`GatedBackend::open`] is called
#[derive(Debug)]
pub struct GatedBackend {
    inner: FileStorage,
    gate: Semaphore,
}

impl GatedBackend {
    pub fn new(inner: FileStorage) -> Self {
        Self {
            inner,
            gate: Semaphore::new(0),
        }
    }

    /// Let every pending and future write through
    pub fn open(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl StorageBackend for GatedBackend {
    async fn allocate(&self) -> Result<()> {
        self.inner.allocate().await
    }

    async fn file_lengths(&self) -> Result<Vec<Option<u64>>> {
        self.inner.file_lengths().await
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let _open = self
            .gate
            .acquire()
            .await
            .map_err(|e| TorrentError::storage_error(format!("gate closed: {}", e)))?;
        self.inner.write_at(offset, data).await
    }

    async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.inner.read_at(offset, length).await
    }
}

/// How a fake seeder behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeederMode {
    Honest,
    /// Serves blocks with every byte flipped
    Corrupt,
    /// Answers the handshake with a different info hash
    WrongInfoHash,
    /// Unchokes but never answers a request
    Silent,
}

/// A fake peer that owns some pieces and serves them to anyone
pub struct FakeSeeder {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Drop for FakeSeeder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FakeSeeder {
    pub async fn spawn(torrent: &TestTorrent, pieces: &[u32], mode: SeederMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let torrent = torrent.clone();
        let pieces: HashSet<u32> = pieces.iter().copied().collect();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let torrent = torrent.clone();
                let pieces = pieces.clone();
                tokio::spawn(async move {
                    let _ = serve_peer(stream, torrent, pieces, mode).await;
                });
            }
        });

        Self { addr, task }
    }
}

async fn serve_peer(
    mut stream: TcpStream,
    torrent: TestTorrent,
    pieces: HashSet<u32>,
    mode: SeederMode,
) -> Result<()> {
    let metadata = &torrent.metadata;
    Handshake::read_from(&mut stream).await?;

    let info_hash = match mode {
        SeederMode::WrongInfoHash => InfoHash::new([0xab; 20]),
        _ => metadata.info_hash,
    };
    Handshake::new(info_hash, Handshake::generate_peer_id())
        .write_to(&mut stream)
        .await?;
    if mode == SeederMode::WrongInfoHash {
        // hold the socket open until the other side gives up
        tokio::time::sleep(Duration::from_secs(5)).await;
        return Ok(());
    }

    let mut have = Bitfield::new(metadata.piece_count());
    for piece in &pieces {
        have.set(*piece as usize);
    }
    write_message(&mut stream, &Message::Bitfield { bitfield: have.to_bytes() }).await?;

    let max_len = max_frame_len(metadata.piece_count());
    loop {
        match read_message(&mut stream, max_len).await? {
            Message::Interested => write_message(&mut stream, &Message::Unchoke).await?,
            Message::Request { .. } if mode == SeederMode::Silent => {}
            Message::Request { index, begin, length } if pieces.contains(&index) => {
                let start = metadata.piece_offset(index) as usize + begin as usize;
                let mut block = torrent.data[start..start + length as usize].to_vec();
                if mode == SeederMode::Corrupt {
                    block.iter_mut().for_each(|b| *b = !*b);
                }
                let message = Message::Piece {
                    index,
                    begin,
                    block: block.into(),
                };
                write_message(&mut stream, &message).await?;
            }
            _ => {}
        }
    }
}
