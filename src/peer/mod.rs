//! Peer management module
//!
//! Peer connection tasks, their channel vocabulary and the per-torrent
//! peer registry.

pub mod connection;
pub mod event;
pub mod manager;
pub mod state;

pub use connection::{ConnectionContext, ConnectionTimeouts, PeerConnection};
pub use event::{PeerCommand, PeerEvent};
pub use manager::{PeerManager, PeerSlot};
pub use state::{CloseReason, ConnectionState, Direction, EncryptionMode, PeerRecord};
