//! Piece bitfield
//!
//! MSB-first bit set in the same layout as the wire `bitfield` message.

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::TorrentError;

/// Set of piece indices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
}

impl Bitfield {
    /// Empty bitfield for `len` pieces
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0u8; len.div_ceil(8)],
            len,
        }
    }

    /// Decode a wire bitfield; trailing spare bits must be zero
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        if bytes.len() != len.div_ceil(8) {
            return Err(TorrentError::protocol_error_with_source(
                "Bitfield has wrong length",
                format!("expected {} bytes, got {}", len.div_ceil(8), bytes.len()),
            )
            .into());
        }

        let bitfield = Self {
            bits: bytes.to_vec(),
            len,
        };
        if (len..bytes.len() * 8).any(|i| bitfield.raw_get(i)) {
            return Err(TorrentError::protocol_error("Bitfield has spare bits set").into());
        }
        Ok(bitfield)
    }

    fn raw_get(&self, index: usize) -> bool {
        self.bits[index / 8] & (1 << (7 - (index % 8))) != 0
    }

    /// Is piece `index` set
    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.raw_get(index)
    }

    /// Set piece `index`, returning true if it was previously unset
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.len || self.raw_get(index) {
            return false;
        }
        self.bits[index / 8] |= 1 << (7 - (index % 8));
        true
    }

    /// Number of pieces tracked
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of pieces set
    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// True when every piece is set
    pub fn all(&self) -> bool {
        self.count_ones() == self.len
    }

    /// True when no piece is set
    pub fn none(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    /// Indices of set pieces, ascending
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |i| self.raw_get(*i))
    }

    /// Raw bytes in wire order
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Wire payload for a `bitfield` message
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }
}
