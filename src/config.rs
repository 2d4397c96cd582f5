//! Engine configuration module
//!
//! Tunables for the engine, loadable from a JSON file. Every field has a
//! default so a partial file only overrides what it names.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::TorrentError;
use crate::protocol::MAX_BLOCK_LEN;
use crate::storage::BLOCK_SIZE;

/// Configuration for the torrent engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interface to listen on for incoming peers
    pub listen_host: String,
    /// Listening port (0 picks an ephemeral port)
    pub listen_port: u16,
    /// Connections across all torrents
    pub max_connections: usize,
    /// Connections per torrent
    pub max_connections_per_torrent: usize,
    /// Requests in flight per peer
    pub max_outstanding_requests: usize,
    pub block_size: u32,
    /// Download limit in bytes per second (0 = unlimited)
    pub download_limit: u64,
    /// Upload limit in bytes per second (0 = unlimited)
    pub upload_limit: u64,
    /// Disk cache size per torrent in bytes
    pub cache_capacity: usize,
    pub disk_retry_attempts: u32,
    pub disk_retry_backoff_ms: u64,
    /// Unrecoverable piece failures before the torrent enters Error
    pub max_failed_pieces: u32,
    /// A peer is dropped once its bad-data counter exceeds this
    pub bad_data_threshold: u32,
    pub blacklist_cooldown_secs: u64,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub stop_timeout_ms: u64,
    /// Period of the torrent maintenance tick
    pub tick_interval_ms: u64,
    /// Rechoke every this many ticks
    pub choke_ticks: u32,
    /// Regular unchoke slots, one optimistic slot comes on top
    pub upload_slots: usize,
    /// Download pieces in index order instead of rarest-first
    pub sequential: bool,
    /// Trust resume data instead of re-hashing existing files
    pub fast_resume: bool,
    /// Where resume files live; defaults to `.resume` below each save dir
    pub resume_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 55123,
            max_connections: 200,
            max_connections_per_torrent: 60,
            max_outstanding_requests: 16,
            block_size: BLOCK_SIZE,
            download_limit: 0,
            upload_limit: 0,
            cache_capacity: 16 * 1024 * 1024,
            disk_retry_attempts: 3,
            disk_retry_backoff_ms: 100,
            max_failed_pieces: 1,
            bad_data_threshold: 3,
            blacklist_cooldown_secs: 600,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            inactivity_timeout_ms: 120_000,
            request_timeout_ms: 60_000,
            keepalive_interval_ms: 90_000,
            stop_timeout_ms: 10_000,
            tick_interval_ms: 500,
            choke_ticks: 20,
            upload_slots: 4,
            sequential: false,
            fast_resume: true,
            resume_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from {}", path.display());
        let data = std::fs::read(path).map_err(|e| {
            TorrentError::config_error(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_slice(&data).map_err(|e| {
            TorrentError::config_error(format!("Invalid config file '{}': {}", path.display(), e))
        })?;
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let fail = |field: &str, message: &str| -> Result<()> {
            Err(TorrentError::config_error_with_field(message, field).into())
        };

        if self.max_connections == 0 {
            return fail("max_connections", "max_connections must be at least 1");
        }
        if self.max_connections_per_torrent == 0 {
            return fail("max_connections_per_torrent", "max_connections_per_torrent must be at least 1");
        }
        if self.max_outstanding_requests == 0 {
            return fail("max_outstanding_requests", "max_outstanding_requests must be at least 1");
        }
        if self.block_size == 0 || self.block_size > MAX_BLOCK_LEN {
            return fail("block_size", "block_size must be between 1 byte and 128 KiB");
        }
        if self.cache_capacity < self.block_size as usize {
            return fail("cache_capacity", "cache_capacity must hold at least one block");
        }
        if self.disk_retry_attempts == 0 {
            return fail("disk_retry_attempts", "disk_retry_attempts must be at least 1");
        }
        if self.max_failed_pieces == 0 {
            return fail("max_failed_pieces", "max_failed_pieces must be at least 1");
        }
        if self.upload_slots == 0 {
            return fail("upload_slots", "upload_slots must be at least 1");
        }
        if self.tick_interval_ms == 0 || self.choke_ticks == 0 {
            return fail("tick_interval_ms", "tick interval and choke ticks must be positive");
        }
        if self.connect_timeout_ms == 0 || self.handshake_timeout_ms == 0 || self.inactivity_timeout_ms == 0 {
            return fail("timeouts", "connection timeouts must be positive");
        }
        if self.keepalive_interval_ms == 0 || self.request_timeout_ms == 0 {
            return fail("timeouts", "keep-alive interval and request timeout must be positive");
        }

        Ok(())
    }

    /// Get the listen address for incoming connections
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    /// Resume directory for a torrent saved under `save_dir`
    pub fn resume_dir_for(&self, save_dir: &Path) -> PathBuf {
        self.resume_dir.clone().unwrap_or_else(|| save_dir.join(".resume"))
    }

    pub fn disk_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.disk_retry_backoff_ms)
    }

    pub fn blacklist_cooldown(&self) -> Duration {
        Duration::from_secs(self.blacklist_cooldown_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
