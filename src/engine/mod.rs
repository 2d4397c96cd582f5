//! Engine module
//!
//! The composition root. The engine owns every torrent actor, the global
//! bandwidth limiters, the connection budget shared by all torrents and the
//! listening socket. Incoming connections are routed to their torrent by
//! the info hash in the handshake.

pub mod rate;
pub mod source;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::download::{TorrentHandle, TorrentManager, TorrentParams};
use crate::error::TorrentError;
use crate::protocol::Handshake;
use crate::stats::{AnnounceOutcome, EngineSnapshot, PortMappingStatus, TorrentSnapshot};
use crate::storage::{FileStorage, StorageBackend};
use crate::torrent::{InfoHash, TorrentMetadata};

pub use rate::{BandwidthLimiter, RateLimiter};
pub use source::{PeerSource, StaticPeers};

struct TorrentEntry {
    handle: TorrentHandle,
    task: JoinHandle<()>,
}

type TorrentMap = Arc<RwLock<HashMap<InfoHash, TorrentEntry>>>;

/// Multi-torrent BitTorrent engine
pub struct Engine {
    config: Arc<EngineConfig>,
    peer_id: [u8; 20],
    limiter: BandwidthLimiter,
    permits: Arc<Semaphore>,
    torrents: TorrentMap,
    listen_addr: Mutex<Option<SocketAddr>>,
    port_mapping: Mutex<PortMappingStatus>,
    /// Listener and peer-source tasks, aborted on shutdown
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine; an invalid configuration is rejected here
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let peer_id = Handshake::generate_peer_id();
        info!(
            "Starting engine (peer id {}, {} connections max)",
            String::from_utf8_lossy(&peer_id[..8]),
            config.max_connections
        );

        Ok(Self {
            limiter: BandwidthLimiter::new(config.download_limit, config.upload_limit),
            permits: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
            peer_id,
            torrents: Arc::new(RwLock::new(HashMap::new())),
            listen_addr: Mutex::new(None),
            port_mapping: Mutex::new(PortMappingStatus::default()),
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Bind the listening socket and start accepting peers
    ///
    /// Port 0 binds an ephemeral port; the bound address is returned and
    /// reported in snapshots. Calling this twice returns the existing address.
    pub async fn listen(&self) -> Result<SocketAddr> {
        if let Some(addr) = *self.listen_addr.lock() {
            return Ok(addr);
        }

        let bind = self.config.listen_addr();
        let listener = TcpListener::bind(&bind).await.map_err(|e| {
            TorrentError::network_error_full("Failed to bind listener", bind.clone(), e.to_string())
        })?;
        let addr = listener.local_addr()?;
        info!("Listening for peers on {}", addr);

        let task = tokio::spawn(accept_loop(
            listener,
            self.torrents.clone(),
            self.permits.clone(),
            self.config.handshake_timeout(),
        ));
        *self.listen_addr.lock() = Some(addr);
        self.background.lock().push(task);
        Ok(addr)
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.listen_addr.lock().map(|addr| addr.port())
    }

    /// Add a torrent stored below `save_dir`; it stays Stopped until started
    pub async fn add_torrent(&self, metadata: TorrentMetadata, save_dir: impl Into<PathBuf>) -> Result<InfoHash> {
        let save_dir = save_dir.into();
        let metadata = Arc::new(metadata);
        let backend = Arc::new(FileStorage::new(save_dir.clone(), metadata.clone()));
        self.add_torrent_with_backend(metadata, save_dir, backend).await
    }

    /// Add a torrent on a custom storage backend
    pub async fn add_torrent_with_backend(
        &self,
        metadata: Arc<TorrentMetadata>,
        save_dir: PathBuf,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<InfoHash> {
        metadata.validate()?;
        FileStorage::check_writable(&save_dir).await?;

        let info_hash = metadata.info_hash;
        let mut torrents = self.torrents.write().await;
        if torrents.contains_key(&info_hash) {
            return Err(TorrentError::duplicate_torrent(info_hash).into());
        }

        let (handle, task) = TorrentManager::spawn(TorrentParams {
            metadata: metadata.clone(),
            save_dir,
            backend,
            config: self.config.clone(),
            limiter: self.limiter.clone(),
            permits: self.permits.clone(),
            peer_id: self.peer_id,
        });
        torrents.insert(info_hash, TorrentEntry { handle, task });
        info!("Added torrent {} ({})", metadata.name, info_hash);
        Ok(info_hash)
    }

    async fn handle(&self, info_hash: &InfoHash) -> Result<TorrentHandle> {
        self.torrents
            .read()
            .await
            .get(info_hash)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| TorrentError::torrent_not_found(info_hash).into())
    }

    async fn handles(&self) -> Vec<TorrentHandle> {
        self.torrents.read().await.values().map(|entry| entry.handle.clone()).collect()
    }

    pub async fn start(&self, info_hash: &InfoHash) -> Result<()> {
        self.handle(info_hash).await?.start().await
    }

    /// Start every torrent; all of them run concurrently
    pub async fn start_all(&self) -> Result<()> {
        for handle in self.handles().await {
            handle.start().await?;
        }
        Ok(())
    }

    pub async fn stop(&self, info_hash: &InfoHash) -> Result<()> {
        self.handle(info_hash).await?.stop().await
    }

    /// Leave the Error state by starting again
    pub async fn retry(&self, info_hash: &InfoHash) -> Result<()> {
        self.handle(info_hash).await?.retry().await
    }

    /// Stop a torrent and forget it
    pub async fn remove(&self, info_hash: &InfoHash) -> Result<()> {
        let entry = self
            .torrents
            .write()
            .await
            .remove(info_hash)
            .ok_or_else(|| TorrentError::torrent_not_found(info_hash))?;

        let result = entry.handle.shutdown().await;
        if let Err(e) = entry.task.await {
            warn!("Torrent task for {} ended abnormally: {}", info_hash, e);
        }
        info!("Removed torrent {}", info_hash);
        result
    }

    pub async fn add_peers(&self, info_hash: &InfoHash, addrs: Vec<SocketAddr>) -> Result<()> {
        self.handle(info_hash).await?.add_peers(addrs).await
    }

    /// Feed a torrent from a discovery source until the source or the torrent ends
    pub async fn attach_peer_source<S>(&self, info_hash: &InfoHash, mut source: S) -> Result<()>
    where
        S: PeerSource + 'static,
    {
        let handle = self.handle(info_hash).await?;
        let task = tokio::spawn(async move {
            while let Some(batch) = source.next_batch().await {
                debug!("Peer source delivered {} addresses for {}", batch.len(), handle.info_hash());
                if handle.add_peers(batch).await.is_err() {
                    break;
                }
            }
            debug!("Peer source for {} finished", handle.info_hash());
        });
        self.background.lock().push(task);
        Ok(())
    }

    /// Bytes per second, 0 for unlimited
    pub fn set_download_limit(&self, bytes_per_sec: u64) {
        self.limiter.set_download_limit(bytes_per_sec);
    }

    /// Bytes per second, 0 for unlimited
    pub fn set_upload_limit(&self, bytes_per_sec: u64) {
        self.limiter.set_upload_limit(bytes_per_sec);
    }

    /// Record the NAT layer's latest port-mapping result
    pub fn report_port_mapping(&self, status: PortMappingStatus) {
        info!("Port mapping: {:?}", status);
        *self.port_mapping.lock() = status;
    }

    /// Record a tracker tier's announce or scrape result
    pub async fn report_announce(&self, info_hash: &InfoHash, tier: usize, outcome: AnnounceOutcome) -> Result<()> {
        self.handle(info_hash).await?.report_announce(tier, outcome).await
    }

    pub async fn torrent_snapshot(&self, info_hash: &InfoHash) -> Result<TorrentSnapshot> {
        self.handle(info_hash).await?.snapshot().await
    }

    /// Engine-wide statistics with every torrent's snapshot
    pub async fn snapshot(&self) -> EngineSnapshot {
        let mut torrents = Vec::new();
        for handle in self.handles().await {
            match handle.snapshot().await {
                Ok(snapshot) => torrents.push(snapshot),
                Err(e) => debug!("No snapshot for {}: {}", handle.info_hash(), e),
            }
        }
        torrents.sort_by(|a, b| a.name.cmp(&b.name));

        EngineSnapshot {
            download_rate: torrents.iter().map(|t| t.download_rate).sum(),
            upload_rate: torrents.iter().map(|t| t.upload_rate).sum(),
            listen_port: self.listen_port(),
            port_mapping: self.port_mapping.lock().clone(),
            open_connections: self.config.max_connections - self.permits.available_permits(),
            max_connections: self.config.max_connections,
            disk_read_rate: torrents.iter().map(|t| t.cache.read_rate).sum(),
            disk_write_rate: torrents.iter().map(|t| t.cache.write_rate).sum(),
            disk_bytes_read: torrents.iter().map(|t| t.cache.bytes_read).sum(),
            disk_bytes_written: torrents.iter().map(|t| t.cache.bytes_written).sum(),
            cache_used: torrents.iter().map(|t| t.cache.used_bytes).sum(),
            cache_capacity: torrents.iter().map(|t| t.cache.capacity).sum(),
            torrents,
        }
    }

    /// Stop every torrent, persisting its state, and close the listener
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down engine");
        for task in self.background.lock().drain(..) {
            task.abort();
        }
        *self.listen_addr.lock() = None;

        let entries: Vec<(InfoHash, TorrentEntry)> = self.torrents.write().await.drain().collect();
        let mut stopping = JoinSet::new();
        for (info_hash, entry) in entries {
            stopping.spawn(async move {
                let result = entry.handle.shutdown().await;
                let _ = entry.task.await;
                (info_hash, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = stopping.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((info_hash, Err(e))) => {
                    warn!("Torrent {} did not stop cleanly: {}", info_hash, e);
                    first_error.get_or_insert(e);
                }
                Err(e) => warn!("Torrent shutdown task failed: {}", e),
            }
        }

        info!("Engine stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Accept peers and route each one to the torrent named in its handshake
async fn accept_loop(listener: TcpListener, torrents: TorrentMap, permits: Arc<Semaphore>, handshake_timeout: Duration) {
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let permit = match permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Dropping incoming connection from {}: connection limit reached", addr);
                continue;
            }
        };

        let torrents = torrents.clone();
        tokio::spawn(async move {
            let handshake = match timeout(handshake_timeout, Handshake::read_from(&mut stream)).await {
                Ok(Ok(handshake)) => handshake,
                Ok(Err(e)) => {
                    debug!("Bad handshake from {}: {}", addr, e);
                    return;
                }
                Err(_) => {
                    debug!("Handshake timeout from {}", addr);
                    return;
                }
            };

            let handle = torrents
                .read()
                .await
                .get(&handshake.info_hash)
                .map(|entry| entry.handle.clone());
            match handle {
                Some(handle) => {
                    if let Err(e) = handle.incoming(stream, handshake, permit).await {
                        debug!("Torrent for {} is gone: {}", addr, e);
                    }
                }
                None => debug!("Peer {} asked for unknown torrent {}", addr, handshake.info_hash),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::TorrentState;
    use crate::error::ErrorCategory;
    use crate::testing::{test_config, TestTorrent};
    use crate::torrent::TorrentParser;
    use std::time::Instant;

    fn category(e: &anyhow::Error) -> ErrorCategory {
        e.downcast_ref::<TorrentError>().unwrap().category()
    }

    async fn wait_for(engine: &Engine, info_hash: &InfoHash, state: TorrentState) -> TorrentSnapshot {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let snapshot = engine.torrent_snapshot(info_hash).await.unwrap();
            if snapshot.state == state {
                return snapshot;
            }
            assert!(Instant::now() < deadline, "still {:?}", snapshot.state);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let config = EngineConfig {
            max_connections: 0,
            ..Default::default()
        };
        let err = Engine::new(config).err().unwrap();
        assert_eq!(category(&err), ErrorCategory::FatalConfig);
    }

    #[tokio::test]
    async fn test_add_torrent_rejections() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(&dir.path().join("resume"))).unwrap();
        let torrent = TestTorrent::new("dup.bin", 16384, 20000);

        let info_hash = engine
            .add_torrent((*torrent.metadata).clone(), dir.path().join("data"))
            .await
            .unwrap();
        assert_eq!(info_hash, torrent.metadata.info_hash);

        let err = engine
            .add_torrent((*torrent.metadata).clone(), dir.path().join("data"))
            .await
            .unwrap_err();
        assert_eq!(category(&err), ErrorCategory::FatalConfig);

        // a save path below a regular file cannot be created
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let other = TestTorrent::new("other.bin", 16384, 100);
        let err = engine
            .add_torrent((*other.metadata).clone(), blocker.join("sub"))
            .await
            .unwrap_err();
        assert_eq!(category(&err), ErrorCategory::FatalConfig);

        let missing = InfoHash::new([9u8; 20]);
        assert_eq!(category(&engine.start(&missing).await.unwrap_err()), ErrorCategory::FatalConfig);

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_download_from_another_engine() {
        let seed_dir = tempfile::tempdir().unwrap();
        let leech_dir = tempfile::tempdir().unwrap();
        let torrent = TestTorrent::new("shared.bin", 16384, 3 * 16384 + 5000);

        let seed_data = seed_dir.path().join("data");
        std::fs::create_dir_all(&seed_data).unwrap();
        torrent.write_to(&seed_data);

        let seeder = Engine::new(test_config(&seed_dir.path().join("resume"))).unwrap();
        let seed_addr = seeder.listen().await.unwrap();
        assert_eq!(seeder.listen_port(), Some(seed_addr.port()));
        let info_hash = seeder.add_torrent((*torrent.metadata).clone(), &seed_data).await.unwrap();
        seeder.start(&info_hash).await.unwrap();
        wait_for(&seeder, &info_hash, TorrentState::Seeding).await;

        let leecher = Engine::new(test_config(&leech_dir.path().join("resume"))).unwrap();
        leecher
            .add_torrent((*torrent.metadata).clone(), leech_dir.path().join("data"))
            .await
            .unwrap();
        leecher.start_all().await.unwrap();
        leecher
            .attach_peer_source(&info_hash, StaticPeers::new(vec![seed_addr]))
            .await
            .unwrap();

        let done = wait_for(&leecher, &info_hash, TorrentState::Seeding).await;
        assert_eq!(done.progress, 1.0);
        let saved = std::fs::read(leech_dir.path().join("data").join("shared.bin")).unwrap();
        assert_eq!(saved, torrent.data);

        let seed_view = seeder.snapshot().await;
        assert_eq!(seed_view.torrents.len(), 1);
        assert!(seed_view.torrents[0].uploaded >= torrent.data.len() as u64);
        assert!(seed_view.open_connections >= 1);

        leecher.shutdown().await.unwrap();
        seeder.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reports_show_up_in_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(&dir.path().join("resume"))).unwrap();

        let data = vec![7u8; 40000];
        let bytes = TorrentParser::build_single_file("tracked.bin", 16384, &data, Some("http://tracker.test/announce"))
            .unwrap();
        let metadata = TorrentParser::parse_bytes(&bytes).unwrap();
        let info_hash = engine.add_torrent(metadata, dir.path().join("data")).await.unwrap();

        engine.report_port_mapping(PortMappingStatus::Succeeded { external_port: 6881 });
        engine
            .report_announce(&info_hash, 0, AnnounceOutcome::Announced)
            .await
            .unwrap();

        let snapshot = engine.snapshot().await;
        assert_eq!(snapshot.port_mapping, PortMappingStatus::Succeeded { external_port: 6881 });
        assert_eq!(snapshot.listen_port, None);
        assert_eq!(snapshot.open_connections, 0);
        let tiers = &snapshot.torrents[0].trackers;
        assert_eq!(tiers[0].urls, vec!["http://tracker.test/announce".to_string()]);
        assert!(tiers[0].announce_succeeded);

        engine.remove(&info_hash).await.unwrap();
        assert!(engine.snapshot().await.torrents.is_empty());
        assert!(engine.torrent_snapshot(&info_hash).await.is_err());
        engine.shutdown().await.unwrap();
    }
}
