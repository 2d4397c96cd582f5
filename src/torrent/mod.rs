//! Torrent descriptor module
//!
//! Immutable torrent metadata and the `.torrent` parser that produces it.

pub mod metadata;
pub mod parser;

pub use metadata::{FileEntry, FileSlice, InfoHash, PieceHash, TorrentMetadata};
pub use parser::TorrentParser;
