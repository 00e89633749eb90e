use std::time::Duration;

use crate::channel::Channel;
use crate::connection::{deadline, remaining, Connection, Service};
use crate::error::{MuxError, Result};

impl Connection {
    /// Wait until at least one open channel is readable.
    ///
    /// A channel is readable when its inbound buffer holds data or has reached
    /// end of stream. Ready channels are returned in id order. `timeout` of
    /// `Some(Duration::ZERO)` polls, `None` waits forever; an expired wait
    /// returns an empty vector.
    pub fn select(&self, timeout: Option<Duration>) -> Result<Vec<Channel>> {
        let deadline = deadline(timeout);
        loop {
            let seen = self.arrivals().current();
            match self.demux(Service::Synchronous) {
                Ok(_) | Err(MuxError::Pumped) => {}
                Err(err) => return Err(err),
            }

            let ready = self.ready_channels();
            if !ready.is_empty() {
                return Ok(ready);
            }

            let Ok(left) = remaining(deadline) else {
                return Ok(Vec::new());
            };
            self.wait_for_arrivals(seen, left)?;
        }
    }

    /// [`select`](Self::select) into a caller-provided slice.
    ///
    /// Fills at most `out.len()` entries and returns how many were written.
    pub fn select_into(&self, out: &mut [Channel], timeout: Option<Duration>) -> Result<usize> {
        let ready = self.select(timeout)?;
        let n = ready.len().min(out.len());
        out[..n].copy_from_slice(&ready[..n]);
        Ok(n)
    }

    fn ready_channels(&self) -> Vec<Channel> {
        let state = self.lock();
        state
            .open_slots()
            .filter(|(_, slot)| slot.buffers.inbound.is_ready())
            .map(|(id, slot)| self.handle(id, slot.generation))
            .collect()
    }
}
