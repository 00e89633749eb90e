//! Background demultiplexing for many connections from one thread.
//!
//! A [`Pump`] owns no thread. The caller runs [`Pump::start`] on a thread of
//! its choosing; it blocks in `poll(2)` over every registered transport plus
//! a wake pipe, and demultiplexes whichever transports become readable.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use fmux_mux::{Connection, Pump};
//! use fmux_transport::IpcStream;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pump = Arc::new(Pump::new()?);
//! let runner = Arc::clone(&pump);
//! let handle = std::thread::spawn(move || runner.start());
//! pump.wait_until_running(Duration::from_secs(1));
//!
//! let (local, _remote) = IpcStream::pair()?;
//! let conn = Connection::open(local, 8)?;
//! pump.add(&conn)?;
//!
//! pump.stop()?;
//! handle.join().expect("pump thread panicked")?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fmux_transport::{poll_readable, WakePipe};
use tracing::{debug, warn};

use crate::connection::{Connection, Service, ServiceStatus};
use crate::error::PumpError;

/// Poll interval used while any registered connection is saturated.
pub const SATURATION_BACKOFF: Duration = Duration::from_millis(10);

static NEXT_PUMP_ID: AtomicU64 = AtomicU64::new(1);

/// Pump lifecycle. Pumps are one-shot: a stopped pump never runs again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Idle,
    Running,
    Stopped,
}

type PumpResult<T> = std::result::Result<T, PumpError>;

/// Demultiplexing loop shared by many connections.
///
/// Registered connections switch to [`Mode::Pumped`](crate::Mode::Pumped):
/// reads on them only consume what the pump has already routed.
#[derive(Debug)]
pub struct Pump {
    id: u64,
    state: Mutex<PumpState>,
    state_changed: Condvar,
    registry: Mutex<Vec<Connection>>,
    waker: Arc<WakePipe>,
}

impl Pump {
    pub fn new() -> PumpResult<Self> {
        let id = NEXT_PUMP_ID.fetch_add(1, Ordering::Relaxed);
        debug!(pump = id, "created pump");
        Ok(Self {
            id,
            state: Mutex::new(PumpState::Idle),
            state_changed: Condvar::new(),
            registry: Mutex::new(Vec::new()),
            waker: Arc::new(WakePipe::new()?),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> PumpState {
        *self.lock_state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == PumpState::Running
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.lock_registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until the loop is running, it has stopped, or `timeout` passes.
    /// Returns whether the loop is running.
    pub fn wait_until_running(&self, timeout: Duration) -> bool {
        let state = self.lock_state();
        let (state, _) = self
            .state_changed
            .wait_timeout_while(state, timeout, |state| *state == PumpState::Idle)
            .unwrap_or_else(PoisonError::into_inner);
        *state == PumpState::Running
    }

    /// Run the loop on the calling thread until [`stop`](Self::stop).
    ///
    /// On return every registered connection has been released back to
    /// synchronous mode.
    pub fn start(&self) -> PumpResult<()> {
        {
            let mut state = self.lock_state();
            match *state {
                PumpState::Idle => *state = PumpState::Running,
                PumpState::Running => return Err(PumpError::AlreadyStarted),
                PumpState::Stopped => return Err(PumpError::AlreadyStopped),
            }
        }
        self.state_changed.notify_all();
        debug!(pump = self.id, "pump started");

        let result = self.run();
        if let Err(err) = &result {
            warn!(pump = self.id, error = %err, "pump loop failed");
        }

        *self.lock_state() = PumpState::Stopped;
        self.state_changed.notify_all();
        let released = self.release_all();
        debug!(pump = self.id, released, "pump stopped");
        result
    }

    /// Ask the loop to exit. Does not wait for it.
    ///
    /// Stopping a pump that was never started makes a later
    /// [`start`](Self::start) fail with [`PumpError::AlreadyStopped`].
    pub fn stop(&self) -> PumpResult<()> {
        {
            let mut state = self.lock_state();
            if *state == PumpState::Stopped {
                return Err(PumpError::AlreadyStopped);
            }
            *state = PumpState::Stopped;
        }
        self.state_changed.notify_all();
        self.waker.wake()?;
        Ok(())
    }

    /// Hand `conn` to this pump. Adding a connection this pump already
    /// services does nothing.
    pub fn add(&self, conn: &Connection) -> PumpResult<()> {
        {
            let mut registry = self.lock_registry();
            if !self.is_running() {
                return Err(PumpError::NotRunning);
            }
            if conn.attach_pump(self.id, &self.waker)? {
                registry.push(conn.clone());
                debug!(pump = self.id, conn = conn.id(), "added connection");
            }
        }
        self.waker.wake()?;
        Ok(())
    }

    /// Return `conn` to synchronous mode. Returns whether it was registered.
    pub fn remove(&self, conn: &Connection) -> PumpResult<bool> {
        let removed = {
            let mut registry = self.lock_registry();
            if !self.is_running() {
                return Err(PumpError::NotRunning);
            }
            let before = registry.len();
            registry.retain(|entry| entry.id() != conn.id());
            before != registry.len()
        };

        if removed {
            conn.detach_pump(self.id);
            debug!(pump = self.id, conn = conn.id(), "removed connection");
        }
        self.waker.wake()?;
        Ok(removed)
    }

    fn run(&self) -> PumpResult<()> {
        // Connections already reported as finished, so each is logged once.
        let mut finished = HashSet::new();

        while self.is_running() {
            let snapshot = self.lock_registry().clone();

            let mut fds = vec![self.waker.as_raw_fd()];
            let mut active = Vec::new();
            let mut detached = Vec::new();
            let mut saturated = false;
            let mut backlog = false;

            for conn in &snapshot {
                match conn.service_status(self.id) {
                    ServiceStatus::Active {
                        transport,
                        buffered,
                    } => {
                        fds.push(transport.as_raw_fd());
                        backlog |= buffered;
                        // Keeps the descriptor alive while it sits in the poll set.
                        active.push((conn, transport, buffered));
                    }
                    ServiceStatus::Saturated => saturated = true,
                    ServiceStatus::Finished { failed } => {
                        if finished.insert(conn.id()) {
                            log_finished(self.id, conn.id(), failed);
                        }
                    }
                    ServiceStatus::Detached => detached.push(conn.id()),
                }
            }

            if !detached.is_empty() {
                self.evict(&detached);
                for id in &detached {
                    finished.remove(id);
                }
            }

            let timeout = if backlog {
                Some(Duration::ZERO)
            } else {
                saturated.then_some(SATURATION_BACKOFF)
            };
            let ready = poll_readable(&fds, timeout)?;

            if ready[0].is_ready() {
                self.waker.drain()?;
            }

            for ((conn, _transport, buffered), readiness) in active.iter().zip(&ready[1..]) {
                if !readiness.is_ready() && !buffered {
                    continue;
                }
                if let Err(err) = conn.demux(Service::Pump(self.id)) {
                    warn!(pump = self.id, conn = conn.id(), error = %err, "demultiplex failed");
                }
            }
        }
        Ok(())
    }

    /// Drop closed connections from the registry.
    fn evict(&self, ids: &[u64]) {
        let mut registry = self.lock_registry();
        registry.retain(|conn| {
            let evict = ids.contains(&conn.id()) && conn.is_closed();
            if evict {
                debug!(pump = self.id, conn = conn.id(), "evicted closed connection");
            }
            !evict
        });
    }

    fn release_all(&self) -> usize {
        let entries = std::mem::take(&mut *self.lock_registry());
        for conn in &entries {
            conn.detach_pump(self.id);
        }
        entries.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, PumpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_registry(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_finished(pump: u64, conn: u64, failed: bool) {
    if failed {
        warn!(pump, conn, "transport failed; connection no longer polled");
    } else {
        debug!(pump, conn, "transport at end of stream; connection no longer polled");
    }
}
