use std::io::{self, ErrorKind, Write};

use bytes::BytesMut;
use tracing::trace;

use crate::codec::{encode_frame, HEADER_SIZE};
use crate::error::{FrameError, Result};

/// Encode and write one complete frame (blocking).
///
/// Header and payload go out as one contiguous buffer, looping over short
/// writes until the whole frame is on the wire, then the stream is flushed.
pub fn write_frame<W: Write + ?Sized>(
    writer: &mut W,
    channel: u32,
    payload: &[u8],
) -> Result<()> {
    let mut wire = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    encode_frame(channel, payload, &mut wire)?;

    let mut rest = &wire[..];
    while !rest.is_empty() {
        match retrying(|| writer.write(rest))? {
            0 => return Err(FrameError::ConnectionClosed),
            n => rest = &rest[n..],
        }
    }
    retrying(|| writer.flush())?;

    trace!(channel, len = payload.len(), "wrote frame");
    Ok(())
}

/// Repeat `op` while it reports a transient condition.
fn retrying<T>(mut op: impl FnMut() -> io::Result<T>) -> Result<T> {
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if matches!(err.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {}
            Err(err) => return Err(err.into()),
        }
    }
}
