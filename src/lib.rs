//! rust-torrent-engine
//!
//! A multi-torrent BitTorrent engine: rarest-first piece selection with
//! endgame, a write-back disk cache, bandwidth limiting and fast-resume.
//! Discovery layers feed it peer addresses; it reports its state through
//! snapshots.

pub mod cli;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod stats;
pub mod storage;
pub mod torrent;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use error::{ErrorCategory, TorrentError};

pub use download::{PickMode, TorrentHandle, TorrentState};
pub use engine::{BandwidthLimiter, Engine, PeerSource, StaticPeers};
pub use protocol::{Handshake, Message, MessageId};
pub use stats::{
    AnnounceOutcome, CacheSnapshot, EngineSnapshot, FileSnapshot, PeerSnapshot, PortMappingStatus,
    TorrentSnapshot, TrackerTierSnapshot,
};
pub use storage::{DiskCache, FileStorage, PieceStore, ResumeData, ResumeManager, StorageBackend};
pub use torrent::{InfoHash, TorrentMetadata, TorrentParser};
