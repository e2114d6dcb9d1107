//! Length-prefixed message framing over a connected bytestream.
//!
//! Wire format: a 4-byte big-endian length `N`, followed by exactly `N`
//! bytes of opaque payload. The codec never interprets the payload; callers
//! are responsible for serializing/parsing the inference request/response
//! wire form carried inside it.

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Default upper bound on a single frame's payload size, guarding against
/// unbounded allocation from a misbehaving peer.
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("short read while framing a message")]
    ShortRead,
    #[error("short write while framing a message")]
    ShortWrite,
    #[error("frame of {actual} bytes exceeds the configured maximum of {limit} bytes")]
    FrameTooLarge { actual: u32, limit: u32 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    /// A short read/write or malformed length is always a transport
    /// failure: the connection must not be returned to the pool.
    pub fn is_transport_failure(&self) -> bool {
        true
    }
}

/// Writes one framed message: the 4-byte big-endian length, then the
/// payload, with no interleaving against other writers of the same stream.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| FramingError::FrameTooLarge {
            actual: u32::MAX,
            limit: u32::MAX,
        })?;

    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);

    writer
        .write_all(&buf)
        .await
        .map_err(|_| FramingError::ShortWrite)?;
    Ok(())
}

/// Reads exactly one framed message: 4 bytes of length, then exactly that
/// many bytes of payload. `max_frame_bytes` bounds the accepted length.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: u32) -> Result<Vec<u8>, FramingError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|_| FramingError::ShortRead)?;
    let len = u32::from_be_bytes(len_buf);

    if len > max_frame_bytes {
        return Err(FramingError::FrameTooLarge {
            actual: len,
            limit: max_frame_bytes,
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|_| FramingError::ShortRead)?;
    Ok(payload)
}
