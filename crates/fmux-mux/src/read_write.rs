//! Channel-level read and write.

use std::time::Duration;

use crate::channel::Channel;
use crate::connection::{deadline, remaining, Connection, Service};
use crate::error::{MuxError, Result};

impl Connection {
    /// Read from a channel, blocking until at least one byte is available.
    ///
    /// Returns `Ok(0)` once the channel can deliver nothing more: the
    /// transport reached end of stream, or the channel (or connection) was
    /// closed while waiting, and no buffered bytes remain.
    pub fn read(&self, channel: &Channel, buf: &mut [u8]) -> Result<usize> {
        self.read_timeout(channel, buf, None)
    }

    /// Like [`read`](Self::read), giving up with [`MuxError::TimedOut`]
    /// after `timeout`. `None` waits forever.
    pub fn read_timeout(
        &self,
        channel: &Channel,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let buffers = self.buffers(channel)?;
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = deadline(timeout);
        loop {
            let seen = self.arrivals().current();
            self.service_reads()?;

            let n = buffers.inbound.pop_into(buf);
            if n > 0 {
                return Ok(n);
            }
            if buffers.inbound.is_closed() {
                return Ok(0);
            }

            let left = remaining(deadline)
                .map_err(|()| MuxError::TimedOut(timeout.unwrap_or_default()))?;
            self.wait_for_arrivals(seen, left)?;
        }
    }

    /// Read whatever is available right now.
    ///
    /// `Ok(None)` means nothing is buffered yet; `Ok(Some(0))` means end of
    /// stream, as for [`read`](Self::read).
    pub fn try_read(&self, channel: &Channel, buf: &mut [u8]) -> Result<Option<usize>> {
        let buffers = self.buffers(channel)?;
        self.service_reads()?;

        let n = buffers.inbound.pop_into(buf);
        if n > 0 || buffers.inbound.is_closed() {
            return Ok(Some(n));
        }
        Ok(None)
    }

    /// Queue bytes on a channel and run one multiplex pass.
    ///
    /// Accepts as many bytes as fit in the channel's outbound buffer
    /// (`outbound_capacity`); if it is full, one multiplex pass runs first to
    /// make room. Returns the number of bytes accepted, which may be fewer
    /// than `buf.len()`.
    ///
    /// If a pass fails, the error is [`MuxError::Flush`] carrying how many
    /// bytes were accepted before the failure. Those bytes stay queued.
    pub fn write(&self, channel: &Channel, buf: &[u8]) -> Result<usize> {
        let buffers = self.buffers(channel)?;
        let capacity = self.config().outbound_capacity;

        let mut accepted = buffers.outbound.push_bounded(buf, capacity);
        if accepted == 0 && !buf.is_empty() {
            if buffers.outbound.is_closed() {
                return Err(MuxError::InvalidChannel { id: channel.id });
            }
            self.flush_writes().map_err(|err| flush_failed(0, err))?;
            accepted = buffers.outbound.push_bounded(buf, capacity);
        }

        self.flush_writes()
            .map_err(|err| flush_failed(accepted, err))?;
        Ok(accepted)
    }

    /// Demultiplex on behalf of a synchronous caller.
    ///
    /// A pump owns the transport in pumped mode, and a closed connection has
    /// already closed every buffer, so neither is an error here.
    fn service_reads(&self) -> Result<()> {
        match self.demux(Service::Synchronous) {
            Ok(_) | Err(MuxError::Pumped) | Err(MuxError::ConnectionClosed) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn flush_failed(accepted: usize, source: MuxError) -> MuxError {
    MuxError::Flush {
        accepted,
        source: Box::new(source),
    }
}
