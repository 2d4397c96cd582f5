//! BitTorrent handshake protocol
//!
//! The fixed 68-byte greeting exchanged before any other message:
//! `<19><"BitTorrent protocol"><8 reserved><info hash><peer id>`.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;
use crate::torrent::InfoHash;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Size of an encoded handshake
pub const HANDSHAKE_LEN: usize = 68;

/// Peer id prefix, Azureus style
const PEER_ID_PREFIX: &[u8; 8] = b"-RE0100-";

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved extension bits; always zero on our side
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: InfoHash,
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake with info_hash and peer_id
    pub fn new(info_hash: InfoHash, peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Generate a random peer ID with the engine's client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        info!("Generated new peer ID: {}", String::from_utf8_lossy(&peer_id[..8]));
        peer_id
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&self.reserved);
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Deserialize a handshake from exactly 68 bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() != HANDSHAKE_LEN {
            return Err(TorrentError::protocol_error_with_source(
                "Invalid handshake length",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            )
            .into());
        }

        if data[0] != PROTOCOL_LENGTH || &data[1..20] != PROTOCOL_STRING.as_bytes() {
            warn!("Handshake with unknown protocol identifier");
            return Err(TorrentError::protocol_error("Invalid protocol string").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        trace!("Handshake reserved bits: {}", hex::encode(reserved));
        Ok(Self {
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id,
        })
    }

    /// Read a handshake from the stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).await?;
        Self::deserialize(&buf)
    }

    /// Write the handshake to the stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Check the remote handshake names the torrent we expect
    pub fn validate(&self, expected_info_hash: &InfoHash) -> bool {
        if self.info_hash != *expected_info_hash {
            debug!("Handshake info hash mismatch: expected {}, got {}", expected_info_hash, self.info_hash);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let handshake = Handshake::new(InfoHash::new([1u8; 20]), [2u8; 20]);
        let bytes = handshake.serialize();

        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL_STRING.as_bytes());
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(Handshake::deserialize(&bytes).unwrap(), handshake);
    }

    #[test]
    fn test_rejects_other_protocols() {
        let mut bytes = Handshake::new(InfoHash::new([1u8; 20]), [2u8; 20]).serialize();
        bytes[5] = b'X';
        assert!(Handshake::deserialize(&bytes).is_err());
        assert!(Handshake::deserialize(&bytes[..60]).is_err());
    }

    #[test]
    fn test_validate_info_hash() {
        let handshake = Handshake::new(InfoHash::new([1u8; 20]), [2u8; 20]);
        assert!(handshake.validate(&InfoHash::new([1u8; 20])));
        assert!(!handshake.validate(&InfoHash::new([9u8; 20])));
    }

    #[test]
    fn test_generate_peer_id() {
        let a = Handshake::generate_peer_id();
        let b = Handshake::generate_peer_id();
        assert_eq!(&a[..8], PEER_ID_PREFIX);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_read_write_stream() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let handshake = Handshake::new(InfoHash::new([3u8; 20]), [4u8; 20]);
        handshake.write_to(&mut client).await.unwrap();
        let received = Handshake::read_from(&mut server).await.unwrap();
        assert_eq!(received, handshake);
    }
}
