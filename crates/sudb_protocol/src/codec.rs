//! Encode/decode for the SuDB wire protocol.
//!
//! All header integers are big-endian. Readers must consume exactly
//! `length` payload bytes and no more.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;
use crate::types::{Message, MessageKind, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};

/// Encode a `Message` into a framed byte buffer (header + payload).
pub fn encode_message(msg: &Message) -> BytesMut {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + msg.payload.len());
    frame.put_u32(msg.payload.len() as u32);
    frame.put_u32(msg.kind as u32);
    frame.put_slice(&msg.payload);
    frame
}

/// Decode a `Message` from a framed byte buffer.
///
/// The input must contain the full frame (header + payload).
/// Returns `(message, bytes_consumed)`; `Truncated` means more bytes are
/// needed, any other error means the frame is malformed.
pub fn decode_message(input: &[u8]) -> Result<(Message, usize), WireError> {
    if input.len() < FRAME_HEADER_SIZE {
        return Err(WireError::Truncated {
            expected: FRAME_HEADER_SIZE,
            actual: input.len(),
        });
    }

    let length = u32::from_be_bytes([input[0], input[1], input[2], input[3]]);
    let kind_raw = u32::from_be_bytes([input[4], input[5], input[6], input[7]]);

    if length > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }
    let kind = MessageKind::from_u32(kind_raw)?;

    let total = FRAME_HEADER_SIZE + length as usize;
    if input.len() < total {
        return Err(WireError::Truncated {
            expected: total,
            actual: input.len(),
        });
    }

    let payload = input[FRAME_HEADER_SIZE..total].to_vec();
    Ok((Message { kind, payload }, total))
}

/// Read one full frame from an async stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let kind_raw = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

    if length > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }
    let kind = MessageKind::from_u32(kind_raw)?;

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Message { kind, payload })
}

/// Write one full frame to an async stream.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_message(msg);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
