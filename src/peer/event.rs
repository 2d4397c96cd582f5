//! Peer events and commands
//!
//! The channel vocabulary between a peer connection task and the torrent
//! actor that owns it.

use std::net::SocketAddr;

use tokio::sync::mpsc;

use crate::peer::state::{CloseReason, ConnectionState, Direction};
use crate::storage::{Bitfield, BlockRequest};

/// Something a connection reports to its torrent
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake succeeded; the connection is Active
    Connected {
        addr: SocketAddr,
        peer_id: [u8; 20],
        direction: Direction,
    },
    Bitfield {
        addr: SocketAddr,
        bitfield: Bitfield,
    },
    Have {
        addr: SocketAddr,
        piece: u32,
    },
    /// The remote choked (`true`) or unchoked (`false`) us
    Choke {
        addr: SocketAddr,
        choked: bool,
    },
    Interest {
        addr: SocketAddr,
        interested: bool,
    },
    /// A requested block arrived; `stored` is false when the cache dropped it
    BlockReceived {
        addr: SocketAddr,
        block: BlockRequest,
        stored: bool,
    },
    /// Requests that could not be sent, or were rejected by the remote
    RequestsFailed {
        addr: SocketAddr,
        blocks: Vec<BlockRequest>,
    },
    BlockUploaded {
        addr: SocketAddr,
        bytes: u64,
    },
    Closed {
        addr: SocketAddr,
        reason: CloseReason,
        from: ConnectionState,
    },
}

impl PeerEvent {
    /// The peer this event is about
    pub fn addr(&self) -> SocketAddr {
        match self {
            PeerEvent::Connected { addr, .. }
            | PeerEvent::Bitfield { addr, .. }
            | PeerEvent::Have { addr, .. }
            | PeerEvent::Choke { addr, .. }
            | PeerEvent::Interest { addr, .. }
            | PeerEvent::BlockReceived { addr, .. }
            | PeerEvent::RequestsFailed { addr, .. }
            | PeerEvent::BlockUploaded { addr, .. }
            | PeerEvent::Closed { addr, .. } => *addr,
        }
    }
}

/// Something the torrent asks a connection to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    Request(Vec<BlockRequest>),
    Cancel(BlockRequest),
    /// Announce a newly verified piece
    Have(u32),
    Choke,
    Unchoke,
    Interested(bool),
    Close(CloseReason),
}

pub type EventSender = mpsc::UnboundedSender<PeerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<PeerEvent>;
pub type CommandSender = mpsc::UnboundedSender<PeerCommand>;
pub type CommandReceiver = mpsc::UnboundedReceiver<PeerCommand>;
