//! Peer state module
//!
//! Connection lifecycle, close reasons and the per-peer record kept by the
//! torrent actor.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::stats::{PeerSnapshot, RateMeter};
use crate::storage::{Bitfield, BlockRequest};

/// Lifecycle of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// TCP connect in progress
    Connecting,
    /// Exchanging the 68-byte handshake
    Handshaking,
    /// Handshake done, messages flowing
    Active,
    /// Shutting down the socket
    Closing,
    Closed,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Connecting
    }
}

/// Who opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Transport encryption in use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EncryptionMode {
    PlainText,
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ConnectionFailed,
    HandshakeMismatch,
    Timeout,
    ProtocolViolation(String),
    BadData,
    Shutdown,
    RemoteClosed,
    SelfConnection,
    Blacklisted,
    Io(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ConnectionFailed => write!(f, "connection failed"),
            CloseReason::HandshakeMismatch => write!(f, "handshake mismatch"),
            CloseReason::Timeout => write!(f, "timeout"),
            CloseReason::ProtocolViolation(detail) => write!(f, "protocol violation: {}", detail),
            CloseReason::BadData => write!(f, "bad data"),
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::RemoteClosed => write!(f, "remote closed"),
            CloseReason::SelfConnection => write!(f, "self connection"),
            CloseReason::Blacklisted => write!(f, "blacklisted"),
            CloseReason::Io(detail) => write!(f, "io error: {}", detail),
        }
    }
}

/// Everything the torrent actor knows about one peer
#[derive(Debug)]
pub struct PeerRecord {
    pub addr: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
    pub direction: Direction,
    pub state: ConnectionState,
    /// Pieces the peer has
    pub bitfield: Bitfield,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    /// Our requests to this peer, with the time each was sent
    pub outstanding: HashSet<BlockRequest>,
    pub requested_at: HashMap<BlockRequest, Instant>,
    pub download: RateMeter,
    pub upload: RateMeter,
    /// Pieces this peer contributed to that failed verification
    pub bad_data: u32,
    pub last_block_at: Option<Instant>,
}

impl PeerRecord {
    pub fn new(addr: SocketAddr, direction: Direction, piece_count: usize) -> Self {
        Self {
            addr,
            peer_id: None,
            direction,
            state: ConnectionState::Connecting,
            bitfield: Bitfield::new(piece_count),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            outstanding: HashSet::new(),
            requested_at: HashMap::new(),
            download: RateMeter::default(),
            upload: RateMeter::default(),
            bad_data: 0,
            last_block_at: None,
        }
    }

    /// May we send requests to this peer
    pub fn can_request(&self) -> bool {
        self.state == ConnectionState::Active && !self.peer_choking && self.am_interested
    }

    /// Record requests handed to the connection
    pub fn track_requests(&mut self, blocks: &[BlockRequest]) {
        let now = Instant::now();
        for block in blocks {
            self.outstanding.insert(*block);
            self.requested_at.insert(*block, now);
        }
    }

    /// Forget a request; returns whether it was outstanding
    pub fn untrack(&mut self, block: &BlockRequest) -> bool {
        self.requested_at.remove(block);
        self.outstanding.remove(block)
    }

    /// Requests older than `timeout`
    pub fn expired_requests(&self, timeout: Duration) -> Vec<BlockRequest> {
        let now = Instant::now();
        self.requested_at
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= timeout)
            .map(|(block, _)| *block)
            .collect()
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            addr: self.addr,
            direction: self.direction,
            encryption: EncryptionMode::PlainText,
            download_rate: self.download.rate(),
            upload_rate: self.upload.rate(),
            downloaded: self.download.total(),
            uploaded: self.upload.total(),
            outstanding_requests: self.outstanding.len(),
            am_choking: self.am_choking,
            am_interested: self.am_interested,
            peer_choking: self.peer_choking,
            peer_interested: self.peer_interested,
            pieces: self.bitfield.count_ones(),
            bad_data: self.bad_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> PeerRecord {
        PeerRecord::new("127.0.0.1:6881".parse().unwrap(), Direction::Outgoing, 8)
    }

    #[test]
    fn test_new_record_is_choked() {
        let peer = record();
        assert!(peer.am_choking && peer.peer_choking);
        assert!(!peer.can_request());
    }

    #[test]
    fn test_can_request_needs_unchoke_and_interest() {
        let mut peer = record();
        peer.state = ConnectionState::Active;
        peer.am_interested = true;
        assert!(!peer.can_request());
        peer.peer_choking = false;
        assert!(peer.can_request());
    }

    #[test]
    fn test_request_tracking() {
        let mut peer = record();
        let block = BlockRequest::new(1, 0, 16384);
        peer.track_requests(&[block]);
        assert_eq!(peer.snapshot().outstanding_requests, 1);
        assert_eq!(peer.expired_requests(Duration::ZERO), vec![block]);
        assert!(peer.expired_requests(Duration::from_secs(60)).is_empty());

        assert!(peer.untrack(&block));
        assert!(!peer.untrack(&block));
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::HandshakeMismatch.to_string(), "handshake mismatch");
        assert_eq!(
            CloseReason::ProtocolViolation("bitfield after first message".into()).to_string(),
            "protocol violation: bitfield after first message"
        );
    }
}
