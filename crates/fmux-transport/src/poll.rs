//! Readiness check across a set of descriptors, backed by `poll(2)`.

use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::{Result, TransportError};

/// Read readiness reported for one descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data is available (`POLLIN`).
    pub readable: bool,
    /// The peer hung up (`POLLHUP`); a read will return EOF once drained.
    pub hangup: bool,
    /// The descriptor is in an error state or invalid (`POLLERR`/`POLLNVAL`).
    pub error: bool,
}

impl Readiness {
    /// True if a read on the descriptor would not block.
    pub fn is_ready(&self) -> bool {
        self.readable || self.hangup || self.error
    }
}

/// Wait until at least one descriptor in `fds` is ready to read, or the
/// timeout expires.
///
/// `None` blocks indefinitely; `Some(Duration::ZERO)` polls. The result has
/// one entry per input descriptor, in order. A signal interrupting the wait
/// is reported as "nothing ready" so callers simply loop.
pub fn poll_readable(fds: &[RawFd], timeout: Option<Duration>) -> Result<Vec<Readiness>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    // SAFETY: `pollfds` is a valid, exclusively borrowed array of `len`
    // pollfd structs for the duration of the call.
    let rc = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_millis(timeout),
        )
    };

    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(vec![Readiness::default(); fds.len()]);
        }
        return Err(TransportError::Poll(err));
    }

    Ok(pollfds
        .iter()
        .map(|p| Readiness {
            readable: p.revents & libc::POLLIN != 0,
            hangup: p.revents & libc::POLLHUP != 0,
            error: p.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
        })
        .collect())
}

/// Single-descriptor convenience over [`poll_readable`].
pub fn wait_readable(fd: RawFd, timeout: Option<Duration>) -> Result<bool> {
    let ready = poll_readable(&[fd], timeout)?;
    Ok(ready.first().is_some_and(Readiness::is_ready))
}

// Round up so a sub-millisecond timeout still waits instead of polling.
fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) if d.is_zero() => 0,
        Some(d) => {
            let millis = d.as_nanos().div_ceil(1_000_000);
            millis.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}
