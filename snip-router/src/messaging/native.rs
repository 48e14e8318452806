//! Chrome native messaging framing: a 4-byte native-endian length prefix
//! followed by a UTF-8 JSON payload.

use std::io::{self, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::MessagingError;

/// Chrome refuses host-to-extension messages above 1 MiB
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Read one frame. `None` on a clean end of stream or an empty frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, MessagingError>
where
    R: AsyncRead + Unpin,
{
    let mut length_bytes = [0u8; 4];
    match reader.read_exact(&mut length_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = checked_length(length_bytes)?;
    if length == 0 {
        return Ok(None);
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), MessagingError>
where
    W: AsyncWrite + Unpin,
{
    let length_bytes = frame_header(payload)?;
    writer.write_all(&length_bytes).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Blocking [`read_frame`] for the stdin side of the native host
pub fn read_frame_sync<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, MessagingError> {
    let mut length_bytes = [0u8; 4];
    match reader.read_exact(&mut length_bytes) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = checked_length(length_bytes)?;
    if length == 0 {
        return Ok(None);
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

pub fn write_frame_sync<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), MessagingError> {
    let length_bytes = frame_header(payload)?;
    writer.write_all(&length_bytes)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

fn checked_length(length_bytes: [u8; 4]) -> Result<usize, MessagingError> {
    let length = u32::from_ne_bytes(length_bytes) as usize;
    if length > MAX_FRAME_LEN {
        return Err(MessagingError::FrameTooLarge(length));
    }
    Ok(length)
}

fn frame_header(payload: &[u8]) -> Result<[u8; 4], MessagingError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(MessagingError::FrameTooLarge(payload.len()));
    }
    Ok((payload.len() as u32).to_ne_bytes())
}
