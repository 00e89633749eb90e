//! Write side: frame buffered channel output onto the transport.

use fmux_frame::{write_frame, Frame};
use tracing::trace;

use crate::connection::Connection;
use crate::error::{MuxError, Result};

impl Connection {
    /// One multiplex pass.
    ///
    /// Visits open channels in id order and writes at most one frame of up to
    /// `chunk_size` bytes from each channel that has pending output. Bytes
    /// leave the channel buffer only once their frame is fully written. The
    /// first transport failure ends the pass. Returns the number of frames
    /// written.
    pub fn flush_writes(&self) -> Result<usize> {
        let chunk_size = self.config().chunk_size;

        let state = self.lock();
        let transport = state
            .transport
            .clone()
            .ok_or(MuxError::ConnectionClosed)?;

        let mut written = 0usize;
        for (id, slot) in state.open_slots() {
            let Some(chunk) = slot.buffers.outbound.peek_chunk(chunk_size) else {
                continue;
            };
            write_frame(&mut &*transport, id, &chunk)?;
            slot.buffers.outbound.consume(chunk.len());
            trace!(conn = self.id(), channel = id, len = chunk.len(), "wrote chunk");
            written += 1;
        }
        Ok(written)
    }

    /// Write one caller-built frame straight to the transport.
    ///
    /// The frame bypasses the channel table: the channel id need not be open
    /// or even within capacity. It is written whole under the connection
    /// lock, so it never interleaves with frames from a multiplex pass.
    pub fn push(&self, frame: &Frame) -> Result<()> {
        let state = self.lock();
        let transport = state
            .transport
            .clone()
            .ok_or(MuxError::ConnectionClosed)?;
        write_frame(&mut &*transport, frame.channel, &frame.payload)?;
        trace!(
            conn = self.id(),
            channel = frame.channel,
            len = frame.payload.len(),
            "pushed frame"
        );
        Ok(())
    }

    /// Run multiplex passes until no channel has pending output.
    ///
    /// Returns the total number of frames written.
    pub fn drain_writes(&self) -> Result<usize> {
        let mut total = 0usize;
        loop {
            match self.flush_writes()? {
                0 => return Ok(total),
                n => total += n,
            }
        }
    }
}
