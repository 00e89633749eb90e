//! Read side: move frames from the transport into channel buffers.

use std::io::{ErrorKind, Read};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use fmux_frame::{decode_frame, Frame, FrameError};
use fmux_transport::{wait_readable, IpcStream};
use tracing::{debug, trace};

use crate::connection::{Connection, Mode, Service, State};
use crate::error::{MuxError, Result};

/// Bytes requested from the transport per read.
const READ_CHUNK: usize = 16 * 1024;

/// Outcome of asking the transport for one more frame.
pub(crate) enum Pulled {
    Frame(Frame),
    /// No complete frame yet; any partial frame stays buffered.
    Idle,
    Eof,
}

impl Connection {
    /// Drain every frame the transport can deliver without blocking.
    ///
    /// Each frame is routed to its channel's inbound buffer, or dropped if the
    /// channel is not open. Draining stops early once any channel's inbound
    /// buffer reaches the high-water mark; the remaining frames stay queued
    /// until the application catches up. Returns the number of
    /// frames delivered to an open channel.
    ///
    /// A frame whose bytes have only partly arrived is kept until the rest
    /// shows up; this call never waits for it.
    ///
    /// Fails with [`MuxError::Pumped`] while a pump services the connection.
    pub fn flush_reads(&self) -> Result<usize> {
        self.demux(Service::Synchronous)
    }

    /// Take the next complete frame off the transport without routing it.
    ///
    /// Returns `Ok(None)` when no whole frame is available right now, or once
    /// the transport has reached end of stream. Fails with
    /// [`MuxError::Pumped`] while a pump services the connection.
    pub fn pop(&self) -> Result<Option<Frame>> {
        let max_payload = self.config().max_payload_size;
        let mut state = self.lock();
        let transport = self.serviceable(&state, Service::Synchronous)?;

        let pulled = match pull(&mut state, &transport, max_payload) {
            Ok(pulled) => pulled,
            Err(err) => {
                self.fail(&mut state, &err);
                drop(state);
                self.arrivals().notify();
                return Err(err);
            }
        };
        match pulled {
            Pulled::Frame(frame) => {
                trace!(conn = self.id(), channel = frame.channel, "popped frame");
                Ok(Some(frame))
            }
            Pulled::Idle => Ok(None),
            Pulled::Eof => {
                self.mark_eof(&mut state);
                drop(state);
                self.arrivals().notify();
                Ok(None)
            }
        }
    }

    pub(crate) fn demux(&self, service: Service) -> Result<usize> {
        let high_water = self.config().inbound_high_water;
        let max_payload = self.config().max_payload_size;

        let mut routed = 0usize;
        let mut changed = false;
        let result = loop {
            let mut state = self.lock();
            let transport = match self.serviceable(&state, service) {
                Ok(transport) => transport,
                // Removed from this pump since its last snapshot.
                Err(MuxError::Pumped) if service != Service::Synchronous => break Ok(routed),
                Err(err) => break Err(err),
            };
            if state.saturated(high_water) {
                break Ok(routed);
            }

            // Only whole frames leave the reassembly buffer, so the lock is
            // never held across a wait for the rest of a frame.
            match pull(&mut state, &transport, max_payload) {
                Ok(Pulled::Frame(frame)) => {
                    changed = true;
                    if route(&state, frame) {
                        routed += 1;
                    }
                }
                Ok(Pulled::Idle) => break Ok(routed),
                Ok(Pulled::Eof) => {
                    self.mark_eof(&mut state);
                    changed = true;
                    break Ok(routed);
                }
                Err(err) => {
                    self.fail(&mut state, &err);
                    changed = true;
                    break Err(err);
                }
            }
        };

        if changed {
            self.arrivals().notify();
        }
        result
    }

    /// The transport, if `service` may demultiplex this connection now.
    fn serviceable(&self, state: &State, service: Service) -> Result<Arc<IpcStream>> {
        let transport = state.transport.clone().ok_or(MuxError::ConnectionClosed)?;
        if state.failed {
            return Err(MuxError::TransportFailed);
        }
        match (service, state.mode) {
            (Service::Synchronous, Mode::Synchronous) => Ok(transport),
            (Service::Pump(pump), Mode::Pumped { pump: owner }) if pump == owner => Ok(transport),
            _ => Err(MuxError::Pumped),
        }
    }

    fn mark_eof(&self, state: &mut State) {
        state.eof = true;
        for (_, slot) in state.open_slots() {
            slot.buffers.inbound.close();
        }
        debug!(conn = self.id(), "transport reached end of stream");
    }

    fn fail(&self, state: &mut State, err: &MuxError) {
        state.failed = true;
        debug!(conn = self.id(), error = %err, "transport read failed");
    }
}

/// Next complete frame, reading from the transport only while it is
/// readable right now.
pub(crate) fn pull(state: &mut State, transport: &IpcStream, max_payload: usize) -> Result<Pulled> {
    loop {
        if let Some(frame) = decode_frame(&mut state.pending, max_payload)? {
            return Ok(Pulled::Frame(frame));
        }
        if state.eof || !wait_readable(transport.as_raw_fd(), Some(Duration::ZERO))? {
            return Ok(Pulled::Idle);
        }
        match fill(&mut state.pending, transport) {
            Ok(0) if state.pending.is_empty() => return Ok(Pulled::Eof),
            Ok(0) => return Err(FrameError::ConnectionClosed.into()),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(Pulled::Idle),
            Err(err) => return Err(FrameError::Io(err).into()),
        }
    }
}

/// One read from the transport, appended to `pending`.
fn fill(pending: &mut BytesMut, mut transport: &IpcStream) -> std::io::Result<usize> {
    let start = pending.len();
    pending.resize(start + READ_CHUNK, 0);
    let result = loop {
        match transport.read(&mut pending[start..]) {
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            other => break other,
        }
    };
    pending.truncate(start + result.as_ref().map_or(0, |n| *n));
    result
}

fn route(state: &State, frame: Frame) -> bool {
    let len = frame.payload.len();
    match state.slot(frame.channel) {
        Some(slot) if slot.buffers.inbound.push(&frame.payload).is_some() => {
            trace!(channel = frame.channel, len, "routed frame");
            true
        }
        _ => {
            trace!(channel = frame.channel, len, "dropped frame for unopened channel");
            false
        }
    }
}
