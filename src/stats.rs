//! Statistics and snapshots
//!
//! Rolling rate meters used across the engine, and the read-only snapshot
//! types handed to reporting layers. Snapshots are plain data; the engine
//! never formats them for display.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::download::TorrentState;
use crate::peer::{Direction, EncryptionMode};
use crate::torrent::InfoHash;

/// Window over which rates are averaged
pub const RATE_WINDOW: Duration = Duration::from_secs(5);

/// Samples closer together than this are merged
const SAMPLE_GRANULARITY: Duration = Duration::from_millis(100);

/// Lines an [`EventLog`] keeps by default
pub const RECENT_EVENTS: usize = 10;

/// Rolling byte-rate meter with a running total
#[derive(Debug, Clone)]
pub struct RateMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(RATE_WINDOW)
    }
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            total: 0,
        }
    }

    /// Count `bytes` transferred now
    pub fn record(&mut self, bytes: u64) {
        let now = Instant::now();
        self.total += bytes;

        match self.samples.back_mut() {
            Some((at, amount)) if now.duration_since(*at) < SAMPLE_GRANULARITY => *amount += bytes,
            _ => self.samples.push_back((now, bytes)),
        }

        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second over the window
    pub fn rate(&self) -> f64 {
        let now = Instant::now();
        let recent: u64 = self
            .samples
            .iter()
            .filter(|(at, _)| now.duration_since(*at) <= self.window)
            .map(|(_, amount)| amount)
            .sum();
        recent as f64 / self.window.as_secs_f64()
    }

    /// Bytes recorded since creation
    pub fn total(&self) -> u64 {
        self.total
    }
}

/// The latest notable events of a torrent, oldest first
#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<String>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(RECENT_EVENTS)
    }
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a line, dropping the oldest once full
    pub fn push(&mut self, entry: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }
}

/// Per-peer view
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub addr: SocketAddr,
    pub direction: Direction,
    pub encryption: EncryptionMode,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub outstanding_requests: usize,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    /// Pieces the peer claims to have
    pub pieces: usize,
    pub bad_data: u32,
}

/// Per-file completion
#[derive(Debug, Clone, Serialize)]
pub struct FileSnapshot {
    pub path: PathBuf,
    pub length: u64,
    /// 0.0 ..= 1.0
    pub progress: f64,
}

/// Result of talking to a tracker, reported by the discovery layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AnnounceOutcome {
    Announced,
    Scraped,
    Failed(String),
}

/// Status of one tracker tier
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerTierSnapshot {
    pub tier: usize,
    pub urls: Vec<String>,
    pub announce_succeeded: bool,
    pub scrape_succeeded: bool,
    pub last_error: Option<String>,
}

impl TrackerTierSnapshot {
    /// Fold an outcome into this tier's status
    pub fn apply(&mut self, outcome: AnnounceOutcome) {
        match outcome {
            AnnounceOutcome::Announced => {
                self.announce_succeeded = true;
                self.last_error = None;
            }
            AnnounceOutcome::Scraped => {
                self.scrape_succeeded = true;
                self.last_error = None;
            }
            AnnounceOutcome::Failed(reason) => {
                self.announce_succeeded = false;
                self.last_error = Some(reason);
            }
        }
    }
}

/// Disk cache and disk I/O counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheSnapshot {
    pub used_bytes: usize,
    pub capacity: usize,
    pub dirty_bytes: usize,
    pub entries: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub read_rate: f64,
    pub write_rate: f64,
}

/// Per-torrent view
#[derive(Debug, Clone, Serialize)]
pub struct TorrentSnapshot {
    pub info_hash: InfoHash,
    pub name: String,
    pub state: TorrentState,
    /// Reason string while in the Error state
    pub error: Option<String>,
    /// Verified fraction, 0.0 ..= 1.0
    pub progress: f64,
    pub total_size: u64,
    pub verified_bytes: u64,
    pub pieces_complete: usize,
    pub piece_count: usize,
    /// Payload bytes received from peers
    pub downloaded: u64,
    /// Payload bytes sent to peers
    pub uploaded: u64,
    pub download_rate: f64,
    pub upload_rate: f64,
    /// Block requests currently in flight
    pub current_requests: usize,
    pub endgame: bool,
    pub peers: Vec<PeerSnapshot>,
    pub trackers: Vec<TrackerTierSnapshot>,
    pub files: Vec<FileSnapshot>,
    pub cache: CacheSnapshot,
    /// Latest connection, piece, state and tracker events, oldest first
    pub recent_events: Vec<String>,
}

/// Port-mapping result reported by the NAT layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub enum PortMappingStatus {
    #[default]
    Disabled,
    Pending,
    Succeeded { external_port: u16 },
    Failed { reason: String },
}

/// Whole-engine view
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub download_rate: f64,
    pub upload_rate: f64,
    pub listen_port: Option<u16>,
    pub port_mapping: PortMappingStatus,
    pub open_connections: usize,
    pub max_connections: usize,
    pub disk_read_rate: f64,
    pub disk_write_rate: f64,
    pub disk_bytes_read: u64,
    pub disk_bytes_written: u64,
    pub cache_used: usize,
    pub cache_capacity: usize,
    pub torrents: Vec<TorrentSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_meter_totals() {
        let mut meter = RateMeter::new(Duration::from_secs(1));
        meter.record(500);
        meter.record(500);
        assert_eq!(meter.total(), 1000);
        assert!((meter.rate() - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_rate_meter_forgets_old_samples() {
        let mut meter = RateMeter::new(Duration::from_millis(20));
        meter.record(100);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(meter.rate(), 0.0);
        assert_eq!(meter.total(), 100);
    }

    #[test]
    fn test_event_log_keeps_the_latest() {
        let mut log = EventLog::new(3);
        for i in 0..5 {
            log.push(format!("event {}", i));
        }
        assert_eq!(log.entries(), vec!["event 2", "event 3", "event 4"]);

        let mut default = EventLog::default();
        for i in 0..25 {
            default.push(format!("piece {}", i));
        }
        assert_eq!(default.entries().len(), RECENT_EVENTS);
        assert_eq!(default.entries()[0], "piece 15");
    }

    #[test]
    fn test_tracker_tier_apply() {
        let mut tier = TrackerTierSnapshot::default();
        tier.apply(AnnounceOutcome::Announced);
        tier.apply(AnnounceOutcome::Scraped);
        assert!(tier.announce_succeeded && tier.scrape_succeeded);
        tier.apply(AnnounceOutcome::Failed("timeout".into()));
        assert!(!tier.announce_succeeded);
        assert_eq!(tier.last_error.as_deref(), Some("timeout"));
    }
}
