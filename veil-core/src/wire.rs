//! Framing: length-prefix (4 bytes LE) + JSON payload.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LEN_SIZE: usize = 4;
/// Payload buffer reserved up front; larger frames grow as bytes arrive.
const READ_RESERVE: usize = 64 * 1024;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a value into a single frame: 4 bytes LE length + JSON payload.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = serde_json::to_vec(value)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the value and the number of bytes consumed.
/// Call with a partial buffer; `NeedMore` means try again after more data.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let value = serde_json::from_slice(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((value, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Stream-level framing failure.
#[derive(Debug, thiserror::Error)]
pub enum FrameIoError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the stream")]
    Closed,
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error(transparent)]
    Decode(#[from] FrameDecodeError),
}

/// Write one frame and flush.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FrameIoError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame. A clean EOF before the length prefix is `Closed`.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameIoError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameIoError::Closed)
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge.into());
    }
    let mut payload = Vec::with_capacity((len as usize).min(READ_RESERVE));
    (&mut *reader).take(u64::from(len)).read_to_end(&mut payload).await?;
    if payload.len() != len as usize {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }
    let value = serde_json::from_slice(&payload).map_err(FrameDecodeError::Decode)?;
    Ok(value)
}
