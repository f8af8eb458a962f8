//! Wire framing: `[2-byte BCD length][payload]`, length excluding itself
//!
//! The assembler already emits the length prefix, so writes pass through
//! whole; reads pull the prefix, bound the payload, and hand the full
//! frame (prefix included) back to the parser.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use fep_types::{FepError, Result};

/// Largest frame the BCD length prefix can declare
pub const MAX_FRAME_BYTES: usize = 9999;

fn bcd_to_len(prefix: [u8; 2]) -> Result<usize> {
    let mut value = 0usize;
    for nibble in [
        prefix[0] >> 4,
        prefix[0] & 0x0F,
        prefix[1] >> 4,
        prefix[1] & 0x0F,
    ] {
        if nibble > 9 {
            return Err(FepError::connection(format!(
                "non-BCD length prefix nibble {:X}",
                nibble
            )));
        }
        value = value * 10 + nibble as usize;
    }
    Ok(value)
}

/// Read one complete frame. Returns the full bytes including the length
/// prefix, ready for the schema parser.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncReadExt + Unpin,
{
    let mut prefix = [0u8; 2];
    reader
        .read_exact(&mut prefix)
        .await
        .map_err(|e| FepError::connection(format!("read length prefix: {}", e)))?;
    let len = bcd_to_len(prefix)?;
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(FepError::connection(format!("frame length {}", len)));
    }
    let mut payload = BytesMut::zeroed(len);
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| FepError::connection(format!("read frame body: {}", e)))?;
    let mut frame = Vec::with_capacity(2 + len);
    frame.extend_from_slice(&prefix);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one already-framed message
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    writer
        .write_all(frame)
        .await
        .map_err(|e| FepError::connection(format!("write frame: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| FepError::connection(format!("flush frame: {}", e)))?;
    Ok(())
}
