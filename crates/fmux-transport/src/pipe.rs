//! Self-pipe used to interrupt a blocked readiness poll.
//!
//! A thread blocked in [`poll_readable`](crate::poll_readable) includes the
//! read end of a [`WakePipe`] in its descriptor set. Any other thread calls
//! [`WakePipe::wake`] to make that poll return.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use crate::error::{Result, TransportError};

/// Non-blocking self-pipe.
#[derive(Debug)]
pub struct WakePipe {
    read: File,
    write: File,
}

impl WakePipe {
    /// Create a new wake pipe with both ends non-blocking.
    pub fn new() -> Result<Self> {
        let (read_fd, write_fd) = crate::traits::raw_pipe().map_err(TransportError::Create)?;
        set_nonblocking(read_fd.as_raw_fd(), true).map_err(TransportError::Create)?;
        set_nonblocking(write_fd.as_raw_fd(), true).map_err(TransportError::Create)?;
        Ok(Self {
            read: File::from(read_fd),
            write: File::from(write_fd),
        })
    }

    /// Wake whoever is polling the read end.
    ///
    /// A full pipe already guarantees a pending wakeup, so `WouldBlock` is
    /// not an error.
    pub fn wake(&self) -> Result<()> {
        loop {
            match (&self.write).write(&[1u8]) {
                Ok(_) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }

    /// Consume every pending wakeup. Returns how many bytes were drained.
    pub fn drain(&self) -> Result<usize> {
        let mut drained = 0usize;
        let mut buf = [0u8; 64];
        loop {
            match (&self.read).read(&mut buf) {
                Ok(0) => return Ok(drained),
                Ok(n) => drained += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(drained),
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }
}

impl AsRawFd for WakePipe {
    /// The descriptor to include in a poll set.
    fn as_raw_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> std::io::Result<()> {
    // SAFETY: F_GETFL/F_SETFL only read and update status flags of `fd`,
    // which the caller guarantees is an open descriptor it owns.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: F_GETFD/F_SETFD only touch the descriptor flags of an open fd.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
