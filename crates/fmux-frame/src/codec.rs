use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Bytes in a frame header: a channel id followed by a payload length.
pub const HEADER_SIZE: usize = 8;

/// Largest payload a reader accepts unless told otherwise (16 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// One multiplexed unit: a chunk of bytes for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The channel this chunk belongs to.
    pub channel: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(channel: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }
}

/// Build the 8-byte header for a frame.
pub fn encode_header(channel: u32, len: u32) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&channel.to_be_bytes());
    header[4..].copy_from_slice(&len.to_be_bytes());
    header
}

/// Split an 8-byte header into `(channel, length)`.
///
/// No validation beyond integer conversion: truncated input is detected by the
/// caller's short reads, oversized lengths by the caller's payload limit.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> (u32, u32) {
    let channel = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    (channel, len)
}

/// Append one frame to `dst`.
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────┐
/// │ Channel      │ Length       │ Payload         │
/// │ (4B BE)      │ (4B BE)      │ (Length bytes)  │
/// └──────────────┴──────────────┴─────────────────┘
/// ```
///
/// The length field counts payload bytes only.
pub fn encode_frame(channel: u32, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&encode_header(channel, len));
    dst.put_slice(payload);
    Ok(())
}

/// Take one frame off the front of `src`.
///
/// `Ok(None)` means more bytes are needed; `src` is left untouched apart from
/// reserving room for the rest of the frame.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    let Some(head) = src.get(..HEADER_SIZE) else {
        return Ok(None);
    };
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(head);
    let (channel, len) = decode_header(&header);

    let len = len as usize;
    if len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: max_payload,
        });
    }

    let needed = HEADER_SIZE + len;
    if let Some(short) = needed.checked_sub(src.len()).filter(|n| *n > 0) {
        src.reserve(short);
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some(Frame::new(channel, src.split_to(len).freeze())))
}

/// Limits applied by the async codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}
