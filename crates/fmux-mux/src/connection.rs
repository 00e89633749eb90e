use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use fmux_frame::{decode_header, HEADER_SIZE};
use fmux_transport::{wait_readable, IpcStream, WakePipe};
use tracing::debug;

use crate::buffer::DuplexBuffer;
use crate::channel::{Channel, ChannelType, CONTROL};
use crate::config::MuxConfig;
use crate::error::{MuxError, PumpError, Result};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which execution context demultiplexes a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Reads and selects on the connection drain the transport themselves.
    Synchronous,
    /// A [`Pump`](crate::Pump) drains the transport; reads only consume
    /// channel buffers.
    Pumped { pump: u64 },
}

/// Who is asking to demultiplex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Service {
    Synchronous,
    Pump(u64),
}

/// What a pump should do with a connection on its next pass.
pub(crate) enum ServiceStatus {
    /// Poll this transport. `buffered` means a whole frame is already waiting
    /// in the reassembly buffer, so the connection needs a pass regardless.
    Active {
        transport: Arc<IpcStream>,
        buffered: bool,
    },
    /// Inbound buffers are at the high-water mark; retry after a backoff.
    Saturated,
    /// End of stream or a sticky failure; nothing left to read.
    Finished { failed: bool },
    /// Closed, or no longer attached to this pump.
    Detached,
}

pub(crate) struct Slot {
    pub(crate) generation: u64,
    pub(crate) kind: ChannelType,
    pub(crate) buffers: Arc<DuplexBuffer>,
}

pub(crate) struct State {
    pub(crate) transport: Option<Arc<IpcStream>>,
    pub(crate) slots: Vec<Option<Slot>>,
    pub(crate) mode: Mode,
    /// Bytes read from the transport that do not yet form a routed frame.
    pub(crate) pending: BytesMut,
    pump_waker: Option<Arc<WakePipe>>,
    pub(crate) eof: bool,
    pub(crate) failed: bool,
    next_generation: u64,
}

impl State {
    pub(crate) fn saturated(&self, high_water: usize) -> bool {
        self.open_slots()
            .any(|(_, slot)| slot.buffers.inbound.len() >= high_water)
    }

    /// Whether a complete frame sits in the reassembly buffer.
    pub(crate) fn has_buffered_frame(&self) -> bool {
        let Some(header) = self
            .pending
            .get(..HEADER_SIZE)
            .and_then(|head| <&[u8; HEADER_SIZE]>::try_from(head).ok())
        else {
            return false;
        };
        let (_, len) = decode_header(header);
        self.pending.len() - HEADER_SIZE >= len as usize
    }

    pub(crate) fn open_slots(&self) -> impl Iterator<Item = (u32, &Slot)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|slot| (index as u32, slot)))
    }

    pub(crate) fn slot(&self, id: u32) -> Option<&Slot> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }
}

/// Monotonic counter bumped whenever channel buffers may have changed.
///
/// Waiters snapshot the counter before checking their buffers, then sleep
/// until it moves, so a notification between check and sleep is never lost.
#[derive(Debug, Default)]
pub(crate) struct Arrivals {
    seq: Mutex<u64>,
    cond: Condvar,
}

impl Arrivals {
    pub(crate) fn current(&self) -> u64 {
        *self.seq.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify(&self) {
        let mut seq = self.seq.lock().unwrap_or_else(PoisonError::into_inner);
        *seq = seq.wrapping_add(1);
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self, seen: u64, timeout: Option<Duration>) {
        let seq = self.seq.lock().unwrap_or_else(PoisonError::into_inner);
        match timeout {
            Some(timeout) => {
                let (_seq, _) = self
                    .cond
                    .wait_timeout_while(seq, timeout, |seq| *seq == seen)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            None => {
                let _seq = self
                    .cond
                    .wait_while(seq, |seq| *seq == seen)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

struct Shared {
    id: u64,
    config: MuxConfig,
    state: Mutex<State>,
    arrivals: Arrivals,
}

/// A multiplexed connection: one transport, a fixed-size channel table.
///
/// `Connection` is a cheap, cloneable handle; all clones refer to the same
/// connection and may be used from any thread. The transport is released
/// when [`close`](Self::close) is called or the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Wrap a transport with a table of `max_channels` channels.
    ///
    /// Channel [`CONTROL`] is opened automatically.
    pub fn open(transport: impl Into<IpcStream>, max_channels: usize) -> Result<Self> {
        Self::with_config(transport, MuxConfig::with_channels(max_channels))
    }

    /// Wrap a transport with explicit tunables.
    pub fn with_config(transport: impl Into<IpcStream>, config: MuxConfig) -> Result<Self> {
        config.validate().map_err(MuxError::InvalidConfig)?;

        let transport = transport.into();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            conn = id,
            transport = transport.kind(),
            channels = config.max_channels,
            "opened connection"
        );

        let mut slots = Vec::with_capacity(config.max_channels);
        slots.resize_with(config.max_channels, || None);

        let conn = Self {
            shared: Arc::new(Shared {
                id,
                state: Mutex::new(State {
                    transport: Some(Arc::new(transport)),
                    slots,
                    mode: Mode::Synchronous,
                    pending: BytesMut::new(),
                    pump_waker: None,
                    eof: false,
                    failed: false,
                    next_generation: 1,
                }),
                arrivals: Arrivals::default(),
                config,
            }),
        };
        conn.open_channel(CONTROL)?;
        Ok(conn)
    }

    /// Process-unique connection id (for logs and pump bookkeeping).
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &MuxConfig {
        &self.shared.config
    }

    /// Channel table capacity.
    pub fn capacity(&self) -> usize {
        self.shared.config.max_channels
    }

    pub fn mode(&self) -> Mode {
        self.lock().mode
    }

    /// Whether the transport has reported end of stream.
    pub fn is_eof(&self) -> bool {
        self.lock().eof
    }

    pub fn is_closed(&self) -> bool {
        self.lock().transport.is_none()
    }

    /// Open channel `id`, or return the handle of the already-open channel.
    pub fn open_channel(&self, id: u32) -> Result<Channel> {
        self.open_channel_with_type(id, ChannelType::default())
    }

    /// Like [`open_channel`](Self::open_channel), tagging a newly opened
    /// channel with `kind`. An already-open channel keeps its tag.
    pub fn open_channel_with_type(&self, id: u32, kind: ChannelType) -> Result<Channel> {
        let mut state = self.lock();
        if state.transport.is_none() || id as usize >= state.slots.len() {
            return Err(MuxError::InvalidChannel { id });
        }
        if let Some(slot) = state.slot(id) {
            return Ok(self.handle(id, slot.generation));
        }

        let generation = state.next_generation;
        state.next_generation += 1;

        let buffers = Arc::new(DuplexBuffer::default());
        if state.eof {
            buffers.inbound.close();
        }
        state.slots[id as usize] = Some(Slot {
            generation,
            kind,
            buffers,
        });

        debug!(conn = self.id(), channel = id, ?kind, "opened channel");
        Ok(self.handle(id, generation))
    }

    /// Close channel `id`, discarding its buffers.
    ///
    /// Readers blocked on the channel wake and return 0. Every handle to the
    /// channel becomes invalid. Closing a channel that is not open does
    /// nothing.
    pub fn close_channel(&self, id: u32) -> Result<()> {
        let slot = {
            let mut state = self.lock();
            if id as usize >= state.slots.len() {
                return Err(MuxError::InvalidChannel { id });
            }
            state.slots[id as usize].take()
        };

        if let Some(slot) = slot {
            slot.buffers.close();
            debug!(conn = self.id(), channel = id, "closed channel");
            self.shared.arrivals.notify();
        }
        Ok(())
    }

    /// Structural check: the handle belongs to this connection, the
    /// connection is open, and the id is within capacity.
    pub fn is_valid(&self, channel: &Channel) -> bool {
        channel.connection == self.id()
            && (channel.id as usize) < self.capacity()
            && !self.is_closed()
    }

    /// Liveness check: the exact channel this handle was issued for is
    /// still open.
    pub fn is_open(&self, channel: &Channel) -> bool {
        self.buffers(channel).is_ok()
    }

    pub fn channel_type(&self, channel: &Channel) -> Result<ChannelType> {
        let state = self.lock();
        let slot = self.resolve(&state, channel)?;
        Ok(slot.kind)
    }

    /// Close the connection: every channel is closed, blocked readers wake,
    /// and the transport is released. Idempotent.
    pub fn close(&self) {
        let (transport, slots, pump_waker) = {
            let mut state = self.lock();
            let transport = state.transport.take();
            state.pending.clear();
            let slots: Vec<Slot> = state.slots.iter_mut().filter_map(Option::take).collect();
            (transport, slots, state.pump_waker.take())
        };
        if transport.is_none() {
            return;
        }

        for slot in &slots {
            slot.buffers.close();
        }
        debug!(conn = self.id(), channels = slots.len(), "closed connection");
        self.shared.arrivals.notify();

        // Let the servicing pump notice and evict the connection.
        if let Some(waker) = pump_waker {
            if let Err(err) = waker.wake() {
                debug!(conn = self.id(), error = %err, "failed to wake pump");
            }
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn arrivals(&self) -> &Arrivals {
        &self.shared.arrivals
    }

    pub(crate) fn handle(&self, id: u32, generation: u64) -> Channel {
        Channel {
            connection: self.id(),
            id,
            generation,
        }
    }

    fn resolve<'a>(&self, state: &'a State, channel: &Channel) -> Result<&'a Slot> {
        if channel.connection != self.id() {
            return Err(MuxError::InvalidChannel { id: channel.id });
        }
        state
            .slot(channel.id)
            .filter(|slot| slot.generation == channel.generation)
            .ok_or(MuxError::InvalidChannel { id: channel.id })
    }

    /// Buffers behind a live handle.
    pub(crate) fn buffers(&self, channel: &Channel) -> Result<Arc<DuplexBuffer>> {
        let state = self.lock();
        let slot = self.resolve(&state, channel)?;
        Ok(Arc::clone(&slot.buffers))
    }

    /// Put the connection under `pump`. Returns `false` if it already was.
    pub(crate) fn attach_pump(
        &self,
        pump: u64,
        waker: &Arc<WakePipe>,
    ) -> std::result::Result<bool, PumpError> {
        let mut state = self.lock();
        if state.transport.is_none() {
            return Err(PumpError::ConnectionClosed);
        }
        match state.mode {
            Mode::Synchronous => {
                state.mode = Mode::Pumped { pump };
                state.pump_waker = Some(Arc::clone(waker));
                Ok(true)
            }
            Mode::Pumped { pump: current } if current == pump => Ok(false),
            Mode::Pumped { .. } => Err(PumpError::AlreadyPumped),
        }
    }

    /// Return the connection to synchronous mode if `pump` owns it.
    pub(crate) fn detach_pump(&self, pump: u64) {
        let detached = {
            let mut state = self.lock();
            if state.mode == (Mode::Pumped { pump }) {
                state.mode = Mode::Synchronous;
                state.pump_waker = None;
                true
            } else {
                false
            }
        };
        if detached {
            // Pumped-mode waiters switch over to polling the transport.
            self.shared.arrivals.notify();
        }
    }

    pub(crate) fn service_status(&self, pump: u64) -> ServiceStatus {
        let state = self.lock();
        let Some(transport) = state.transport.as_ref() else {
            return ServiceStatus::Detached;
        };
        if state.mode != (Mode::Pumped { pump }) {
            return ServiceStatus::Detached;
        }
        if state.eof || state.failed {
            return ServiceStatus::Finished {
                failed: state.failed,
            };
        }
        if state.saturated(self.shared.config.inbound_high_water) {
            return ServiceStatus::Saturated;
        }
        ServiceStatus::Active {
            transport: Arc::clone(transport),
            buffered: state.has_buffered_frame(),
        }
    }

    /// Sleep until new data may be available, for at most `limit`.
    ///
    /// Pumped connections wait for the pump's notification. Synchronous ones
    /// wait on transport readability in slices of `sync_poll_interval`, so
    /// data routed by another thread's read is still noticed promptly.
    pub(crate) fn wait_for_arrivals(&self, seen: u64, limit: Option<Duration>) -> Result<()> {
        let (mode, transport, stalled, buffered) = {
            let state = self.lock();
            let saturated = state.saturated(self.shared.config.inbound_high_water);
            let stalled = state.eof || state.failed || saturated;
            let buffered = !saturated && state.has_buffered_frame();
            (state.mode, state.transport.clone(), stalled, buffered)
        };
        let Some(transport) = transport else {
            return Ok(());
        };

        match mode {
            Mode::Pumped { .. } => self.shared.arrivals.wait(seen, limit),
            // The caller's next pass routes it without touching the transport.
            Mode::Synchronous if buffered => {}
            Mode::Synchronous => {
                let interval = self.shared.config.sync_poll_interval;
                let slice = limit.map_or(interval, |limit| limit.min(interval));
                if stalled {
                    self.shared.arrivals.wait(seen, Some(slice));
                } else {
                    wait_readable(transport.as_raw_fd(), Some(slice))?;
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("mode", &state.mode)
            .field("open_channels", &state.open_slots().count())
            .field("eof", &state.eof)
            .field("closed", &state.transport.is_none())
            .finish()
    }
}

/// Absolute deadline for an optional timeout. `None` waits forever.
pub(crate) fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

/// Time left before `deadline`; `Err(())` once it has passed.
pub(crate) fn remaining(deadline: Option<Instant>) -> std::result::Result<Option<Duration>, ()> {
    match deadline {
        None => Ok(None),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                Err(())
            } else {
                Ok(Some(deadline - now))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> (Connection, IpcStream) {
        let (local, remote) = IpcStream::pair().unwrap();
        (Connection::open(local, 4).unwrap(), remote)
    }

    #[test]
    fn control_channel_is_open_at_creation() {
        let (conn, _remote) = conn();
        let control = conn.open_channel(CONTROL).unwrap();
        assert!(conn.is_open(&control));
        assert_eq!(conn.mode(), Mode::Synchronous);
    }

    #[test]
    fn open_is_idempotent() {
        let (conn, _remote) = conn();
        let first = conn.open_channel(2).unwrap();
        let second = conn.open_channel_with_type(2, ChannelType::Binary).unwrap();
        assert_eq!(first, second);
        assert_eq!(conn.channel_type(&first).unwrap(), ChannelType::Text);
    }

    #[test]
    fn channel_type_is_reported() {
        let (conn, _remote) = conn();
        let ch = conn.open_channel_with_type(1, ChannelType::Binary).unwrap();
        assert_eq!(conn.channel_type(&ch).unwrap(), ChannelType::Binary);
    }

    #[test]
    fn rejects_ids_beyond_capacity() {
        let (conn, _remote) = conn();
        let err = conn.open_channel(4).unwrap_err();
        assert!(matches!(err, MuxError::InvalidChannel { id: 4 }));
        assert!(conn.close_channel(9).is_err());
    }

    #[test]
    fn reopened_channel_invalidates_old_handles() {
        let (conn, _remote) = conn();
        let old = conn.open_channel(1).unwrap();
        conn.close_channel(1).unwrap();
        assert!(!conn.is_open(&old));
        assert!(conn.is_valid(&old));

        let new = conn.open_channel(1).unwrap();
        assert_ne!(old, new);
        assert!(!conn.is_open(&old));
        assert!(conn.is_open(&new));
        assert!(matches!(
            conn.channel_type(&old),
            Err(MuxError::InvalidChannel { id: 1 })
        ));
    }

    #[test]
    fn close_channel_twice_is_a_noop() {
        let (conn, _remote) = conn();
        conn.open_channel(3).unwrap();
        conn.close_channel(3).unwrap();
        conn.close_channel(3).unwrap();
    }

    #[test]
    fn handles_from_another_connection_are_rejected() {
        let (a, _ra) = conn();
        let (b, _rb) = conn();
        let foreign = b.open_channel(1).unwrap();
        a.open_channel(1).unwrap();
        assert!(!a.is_valid(&foreign));
        assert!(!a.is_open(&foreign));
    }

    #[test]
    fn close_invalidates_everything() {
        let (conn, _remote) = conn();
        let ch = conn.open_channel(1).unwrap();
        conn.close();
        conn.close();

        assert!(conn.is_closed());
        assert!(!conn.is_valid(&ch));
        assert!(matches!(
            conn.open_channel(1),
            Err(MuxError::InvalidChannel { id: 1 })
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (local, _remote) = IpcStream::pair().unwrap();
        let err = Connection::open(local, 0).unwrap_err();
        assert!(matches!(err, MuxError::InvalidConfig(_)));
    }

    #[test]
    fn pump_attachment_is_exclusive() {
        let (conn, _remote) = conn();
        let waker = Arc::new(WakePipe::new().unwrap());
        assert!(conn.attach_pump(7, &waker).unwrap());
        assert!(!conn.attach_pump(7, &waker).unwrap());
        assert!(matches!(
            conn.attach_pump(8, &waker),
            Err(PumpError::AlreadyPumped)
        ));

        conn.detach_pump(8);
        assert_eq!(conn.mode(), Mode::Pumped { pump: 7 });
        conn.detach_pump(7);
        assert_eq!(conn.mode(), Mode::Synchronous);
    }

    #[test]
    fn closing_a_pumped_connection_wakes_the_pump() {
        let (conn, _remote) = conn();
        let waker = Arc::new(WakePipe::new().unwrap());
        conn.attach_pump(1, &waker).unwrap();

        conn.close();
        assert_eq!(waker.drain().unwrap(), 1);
    }

    #[test]
    fn arrivals_wait_returns_on_notify() {
        let arrivals = Arc::new(Arrivals::default());
        let seen = arrivals.current();

        let notifier = Arc::clone(&arrivals);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            notifier.notify();
        });

        arrivals.wait(seen, Some(Duration::from_secs(5)));
        assert_ne!(arrivals.current(), seen);
        handle.join().unwrap();
    }

    #[test]
    fn unbounded_arrivals_wait_returns_on_notify() {
        let arrivals = Arc::new(Arrivals::default());
        let seen = arrivals.current();

        let notifier = Arc::clone(&arrivals);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            notifier.notify();
        });

        arrivals.wait(seen, None);
        assert_ne!(arrivals.current(), seen);
        handle.join().unwrap();
    }

    #[test]
    fn remaining_expires() {
        assert_eq!(remaining(None), Ok(None));
        let past = deadline(Some(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(1));
        assert!(remaining(past).is_err());
        assert!(remaining(deadline(Some(Duration::from_secs(60))))
            .unwrap()
            .is_some());
    }
}
