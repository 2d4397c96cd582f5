//! Download module
//!
//! Piece selection, choking and the per-torrent actor that ties them to
//! storage and peers.

pub mod choker;
pub mod handle;
pub mod manager;
pub mod picker;

pub use choker::{ChokeCandidate, ChokeDecision, Choker};
pub use handle::{TorrentCommand, TorrentHandle};
pub use manager::{TorrentManager, TorrentParams, TorrentState};
pub use picker::{BlockOutcome, PickMode, PieceManager};
