//! Per-channel byte buffers.
//!
//! Each channel owns two one-way pipes. `inbound` is written by the
//! demultiplexer and read by the application; `outbound` is written by the
//! application and drained by the multiplexer. Both are internally locked,
//! so either end can be used without holding the connection lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Buf, Bytes, BytesMut};
use fmux_transport::WakePipe;
use tracing::debug;

#[derive(Debug, Default)]
struct PipeState {
    buf: BytesMut,
    closed: bool,
    /// Readable exactly while the pipe is ready, once someone asked for it.
    signal: Option<Arc<WakePipe>>,
}

impl PipeState {
    fn is_ready(&self) -> bool {
        !self.buf.is_empty() || self.closed
    }

    fn raise(&self) {
        if let Some(signal) = &self.signal {
            if let Err(err) = signal.wake() {
                debug!(error = %err, "failed to raise channel readiness");
            }
        }
    }

    fn lower(&self) {
        if let Some(signal) = &self.signal {
            if let Err(err) = signal.drain() {
                debug!(error = %err, "failed to lower channel readiness");
            }
        }
    }
}

/// One-way in-memory byte pipe.
#[derive(Debug, Default)]
pub(crate) struct BytePipe {
    state: Mutex<PipeState>,
}

impl BytePipe {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append all of `data`. Returns the buffered length afterwards, or
    /// `None` if the pipe is closed.
    pub(crate) fn push(&self, data: &[u8]) -> Option<usize> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let was_empty = state.buf.is_empty();
        state.buf.extend_from_slice(data);
        if was_empty && !data.is_empty() {
            state.raise();
        }
        Some(state.buf.len())
    }

    /// Append as much of `data` as fits under `capacity`.
    pub(crate) fn push_bounded(&self, data: &[u8], capacity: usize) -> usize {
        let mut state = self.lock();
        if state.closed {
            return 0;
        }
        let room = capacity.saturating_sub(state.buf.len());
        let n = room.min(data.len());
        state.buf.extend_from_slice(&data[..n]);
        n
    }

    /// Move up to `out.len()` bytes into `out`.
    pub(crate) fn pop_into(&self, out: &mut [u8]) -> usize {
        let mut state = self.lock();
        let n = state.buf.len().min(out.len());
        out[..n].copy_from_slice(&state.buf[..n]);
        state.buf.advance(n);
        if n > 0 && !state.is_ready() {
            state.lower();
        }
        n
    }

    /// Copy of the first `max` buffered bytes, left in place until
    /// [`consume`](Self::consume) confirms they were sent.
    pub(crate) fn peek_chunk(&self, max: usize) -> Option<Bytes> {
        let state = self.lock();
        if state.buf.is_empty() {
            return None;
        }
        let n = state.buf.len().min(max);
        Some(Bytes::copy_from_slice(&state.buf[..n]))
    }

    pub(crate) fn consume(&self, n: usize) {
        let mut state = self.lock();
        let n = n.min(state.buf.len());
        state.buf.advance(n);
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().buf.len()
    }

    /// Readable without blocking: data is buffered, or the writer side closed.
    pub(crate) fn is_ready(&self) -> bool {
        self.lock().is_ready()
    }

    /// Refuse further writes. Buffered bytes stay readable.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            state.raise();
        }
    }

    /// Descriptor that polls readable while the pipe [is ready](Self::is_ready).
    pub(crate) fn signal(&self) -> fmux_transport::Result<Arc<WakePipe>> {
        let mut state = self.lock();
        if let Some(signal) = &state.signal {
            return Ok(Arc::clone(signal));
        }
        let signal = Arc::new(WakePipe::new()?);
        state.signal = Some(Arc::clone(&signal));
        if state.is_ready() {
            state.raise();
        }
        Ok(signal)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// The two pipes behind one channel.
#[derive(Debug, Default)]
pub(crate) struct DuplexBuffer {
    pub(crate) inbound: BytePipe,
    pub(crate) outbound: BytePipe,
}

impl DuplexBuffer {
    pub(crate) fn close(&self) {
        self.inbound.close();
        self.outbound.close();
    }
}
