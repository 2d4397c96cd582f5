//! Wire protocol framing
//!
//! Reads and writes length-prefixed messages on an async byte stream.

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Message;
use crate::error::TorrentError;

/// Largest block a peer may request or send
pub const MAX_BLOCK_LEN: u32 = 128 * 1024;

/// Upper bound on a frame for a torrent with `piece_count` pieces
pub fn max_frame_len(piece_count: usize) -> usize {
    let bitfield = 1 + piece_count.div_ceil(8);
    bitfield.max(9 + MAX_BLOCK_LEN as usize)
}

/// Read one framed message, rejecting frames longer than `max_len`
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize) -> Result<Message> {
    let length = reader.read_u32().await? as usize;

    if length == 0 {
        return Ok(Message::KeepAlive);
    }
    if length > max_len {
        return Err(TorrentError::protocol_error_with_source(
            "Message too large",
            format!("{} bytes, limit {}", length, max_len),
        )
        .into());
    }

    let mut payload = BytesMut::zeroed(length);
    reader.read_exact(&mut payload).await?;
    Message::deserialize(Bytes::from(payload))
}

/// Write one framed message and flush
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    writer.write_all(&message.serialize()).await?;
    writer.flush().await?;
    Ok(())
}
