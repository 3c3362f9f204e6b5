//! Native-messaging framing
//!
//! Each message is a 4-byte little-endian length followed by that many bytes
//! of UTF-8 JSON, the framing browsers use to talk to native hosts over
//! stdin/stdout.
//!
//! A frame whose body is not valid JSON still consumes exactly its declared
//! length, so the stream stays in sync and the reader may carry on. I/O
//! failures and oversized frames leave the stream unusable.

use std::io;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame the host accepts from the browser (1 MB, the browser's own
/// limit for host-bound messages)
pub const MAX_INBOUND_FRAME: usize = 1024 * 1024;

/// Largest frame the host may send back
pub const MAX_OUTBOUND_FRAME: usize = 1024 * 1024;

/// Failure to read one inbound frame
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("frame of {0} bytes exceeds limit")]
    Oversized(usize),

    /// The body was read in full but did not parse
    #[error("malformed frame body: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl FrameError {
    /// Whether the stream can no longer be read
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Malformed(_))
    }
}

/// Read one frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    // Read length prefix (4 bytes, little-endian)
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    if len > MAX_INBOUND_FRAME {
        return Err(FrameError::Oversized(len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    Ok(Some(serde_json::from_slice(&buf)?))
}

/// Write one frame and flush
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data =
        serde_json::to_vec(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if data.len() > MAX_OUTBOUND_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", data.len()),
        ));
    }

    writer.write_all(&(data.len() as u32).to_le_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await
}
