//! BitTorrent protocol module
//!
//! Implements the BitTorrent peer wire protocol.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{Handshake, HANDSHAKE_LEN, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{max_frame_len, read_message, write_message, MAX_BLOCK_LEN};
