use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use tracing::trace;

use crate::codec::{decode_header, Frame, HEADER_SIZE};
use crate::error::{FrameError, Result};

/// Read exactly one frame from `reader` (blocking).
///
/// Reads the 8-byte header, then exactly `length` payload bytes, looping over
/// short reads. Nothing past the end of the frame is consumed, so a readiness
/// check on the underlying descriptor still reflects whether another frame
/// is waiting.
///
/// Returns `Ok(None)` on a clean EOF before the first header byte and
/// `Err(FrameError::ConnectionClosed)` on EOF inside a frame.
pub fn read_frame<R: Read + ?Sized>(
    reader: &mut R,
    max_payload: usize,
) -> Result<Option<Frame>> {
    let mut header = [0u8; HEADER_SIZE];
    match read_full(reader, &mut header)? {
        0 => return Ok(None),
        HEADER_SIZE => {}
        _ => return Err(FrameError::ConnectionClosed),
    }

    let (channel, len) = decode_header(&header);
    let payload_len = len as usize;
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let mut payload = BytesMut::zeroed(payload_len);
    if read_full(reader, &mut payload)? != payload_len {
        return Err(FrameError::ConnectionClosed);
    }

    trace!(channel, len = payload_len, "read frame");
    Ok(Some(Frame::new(channel, payload.freeze())))
}

// Fill `buf` unless EOF comes first; returns how many bytes landed.
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(filled)
}
