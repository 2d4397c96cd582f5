//! BitTorrent protocol messages
//!
//! Length-prefixed peer wire messages. Payloads are carried as [`Bytes`] so
//! blocks flow from the socket into the disk cache without copying.

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::TorrentError;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            _ => Err(TorrentError::protocol_error_with_source("Invalid message ID", format!("value: {}", value)).into()),
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Bytes },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port { listen_port: u16 },
    /// Extension messages we never negotiated; skipped by the connection
    Unknown { id: u8 },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive and unknown ids)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::Port { .. } => Some(MessageId::Port),
            Message::KeepAlive | Message::Unknown { .. } => None,
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Port { .. } => 3,
            Message::Unknown { .. } => 1,
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());

        if let Some(id) = self.message_id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::Have { piece_index } => buf.put_u32(*piece_index),
            Message::Bitfield { bitfield } => buf.put_slice(bitfield),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port { listen_port } => buf.put_u16(*listen_port),
            Message::Unknown { id } => buf.put_u8(*id),
            _ => {}
        }

        buf.freeze()
    }

    /// Decode a message body (the bytes after the length prefix)
    pub fn deserialize(mut payload: Bytes) -> Result<Self> {
        if payload.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let raw_id = payload.get_u8();
        let id = match MessageId::try_from(raw_id) {
            Ok(id) => id,
            Err(_) => {
                trace!("Skipping message with unknown id {}", raw_id);
                return Ok(Message::Unknown { id: raw_id });
            }
        };

        let expect = |len: usize, payload: &Bytes| -> Result<()> {
            if payload.len() != len {
                return Err(TorrentError::protocol_error_with_source(
                    format!("Malformed {:?} message", id),
                    format!("expected {} payload bytes, got {}", len, payload.len()),
                )
                .into());
            }
            Ok(())
        };

        let message = match id {
            MessageId::Choke => {
                expect(0, &payload)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect(0, &payload)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect(0, &payload)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect(0, &payload)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect(4, &payload)?;
                Message::Have { piece_index: payload.get_u32() }
            }
            MessageId::Bitfield => Message::Bitfield { bitfield: payload },
            MessageId::Request | MessageId::Cancel => {
                expect(12, &payload)?;
                let index = payload.get_u32();
                let begin = payload.get_u32();
                let length = payload.get_u32();
                if id == MessageId::Request {
                    Message::Request { index, begin, length }
                } else {
                    Message::Cancel { index, begin, length }
                }
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(TorrentError::protocol_error("Piece message too short").into());
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece { index, begin, block: payload }
            }
            MessageId::Port => {
                expect(2, &payload)?;
                Message::Port { listen_port: payload.get_u16() }
            }
        };

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(message: &Message) -> Bytes {
        message.serialize().slice(4..)
    }

    #[test]
    fn test_keepalive_is_four_zero_bytes() {
        assert_eq!(Message::KeepAlive.serialize().as_ref(), &[0, 0, 0, 0]);
        assert_eq!(Message::deserialize(Bytes::new()).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn test_request_layout() {
        let message = Message::Request { index: 1, begin: 16384, length: 16384 };
        let bytes = message.serialize();
        assert_eq!(&bytes[..5], &[0, 0, 0, 13, 6]);
        assert_eq!(Message::deserialize(body(&message)).unwrap(), message);
    }

    #[test]
    fn test_piece_keeps_block() {
        let message = Message::Piece { index: 3, begin: 0, block: Bytes::from_static(b"abcdef") };
        match Message::deserialize(body(&message)).unwrap() {
            Message::Piece { index, begin, block } => {
                assert_eq!(index, 3);
                assert_eq!(begin, 0);
                assert_eq!(block.as_ref(), b"abcdef");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_malformed_have_rejected() {
        let payload = Bytes::from_static(&[4, 0, 0]);
        assert!(Message::deserialize(payload).is_err());
    }

    #[test]
    fn test_unknown_id_is_skipped() {
        let payload = Bytes::from_static(&[20, 0, 1, 2]);
        assert_eq!(Message::deserialize(payload).unwrap(), Message::Unknown { id: 20 });
    }
}
