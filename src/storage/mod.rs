//! Storage module
//!
//! Verified-piece bookkeeping, the write-back block cache, file I/O and
//! fast-resume persistence.

pub mod backend;
pub mod bitfield;
pub mod cache;
pub mod file;
pub mod piece;
pub mod resume;

pub use backend::StorageBackend;
pub use bitfield::Bitfield;
pub use cache::{CacheConfig, DiskCache, FlushOutcome};
pub use file::FileStorage;
pub use piece::{BlockRequest, FileRange, PieceStore, RestoreReport, BLOCK_SIZE};
pub use resume::{PartialPiece, ResumeData, ResumeManager};
