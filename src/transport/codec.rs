/// Length-prefixed JSON frames used by the TCP shard transport
///
/// Frame layout: 4-byte big-endian body length, then a JSON body.
use super::{FindReply, FindRequest, InsertRequest, WriteStatus};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame body accepted from a peer
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Router-to-shard messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Find(FindRequest),
    /// Carries no reply; outcome is fetched with `LastWrite`
    Insert(InsertRequest),
    LastWrite,
}

/// Shard-to-router messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Find(FindReply),
    WriteStatus(WriteStatus),
    Error { message: String },
}

/// Frame codec
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a message into a complete frame
    pub fn encode<T: Serialize>(message: &T) -> io::Result<Bytes> {
        let body = serde_json::to_vec(message)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if body.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds limit", body.len()),
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from `buf` only when a whole frame is present.
    pub fn decode<T: DeserializeOwned>(buf: &mut BytesMut) -> io::Result<Option<T>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }
        if buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let body = buf.split_to(len);
        let message = serde_json::from_slice(&body)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(message))
    }

    /// Write one message to a stream
    pub async fn write_message<W, T>(stream: &mut W, message: &T) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let frame = Self::encode(message)?;
        stream.write_all(&frame).await?;
        stream.flush().await
    }

    /// Read one message from a stream. `Ok(None)` means the peer closed cleanly
    /// between frames.
    pub async fn read_message<R, T>(stream: &mut R, buf: &mut BytesMut) -> io::Result<Option<T>>
    where
        R: AsyncRead + Unpin,
        T: DeserializeOwned,
    {
        loop {
            if let Some(message) = Self::decode(buf)? {
                return Ok(Some(message));
            }

            let n = stream.read_buf(buf).await?;
            if n == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ));
            }
        }
    }
}
