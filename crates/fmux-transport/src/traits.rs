use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use tracing::debug;

use crate::error::{Result, TransportError};

/// A duplex byte-stream handle — implements Read + Write.
///
/// This is the transport type the multiplexer owns. It wraps one of:
///
/// - a Unix stream socket (full duplex),
/// - a plain file descriptor such as one end of an anonymous pipe (one
///   direction only; the other direction fails with the OS error, which the
///   multiplexer surfaces as a transport failure),
/// - a split pair of descriptors, reading from one and writing to the other
///   (e.g. a child process's stdout/stdin).
///
/// `Read` and `Write` are also implemented for `&IpcStream`, so a shared
/// handle can be read and written without exclusive ownership. The raw fd
/// reported by [`AsRawFd`] is always the readable side.
pub struct IpcStream {
    inner: IpcStreamInner,
}

enum IpcStreamInner {
    Unix(UnixStream),
    Fd(File),
    Split { read: File, write: File },
}

impl Read for &IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &self.inner {
            IpcStreamInner::Unix(stream) => (&*stream).read(buf),
            IpcStreamInner::Fd(file) => (&*file).read(buf),
            IpcStreamInner::Split { read, .. } => (&*read).read(buf),
        }
    }
}

impl Write for &IpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &self.inner {
            IpcStreamInner::Unix(stream) => (&*stream).write(buf),
            IpcStreamInner::Fd(file) => (&*file).write(buf),
            IpcStreamInner::Split { write, .. } => (&*write).write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &self.inner {
            IpcStreamInner::Unix(stream) => (&*stream).flush(),
            IpcStreamInner::Fd(file) => (&*file).flush(),
            IpcStreamInner::Split { write, .. } => (&*write).flush(),
        }
    }
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        (&*self).read(buf)
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        (&*self).flush()
    }
}

impl AsRawFd for IpcStream {
    fn as_raw_fd(&self) -> RawFd {
        match &self.inner {
            IpcStreamInner::Unix(stream) => stream.as_raw_fd(),
            IpcStreamInner::Fd(file) => file.as_raw_fd(),
            IpcStreamInner::Split { read, .. } => read.as_raw_fd(),
        }
    }
}

impl From<UnixStream> for IpcStream {
    fn from(stream: UnixStream) -> Self {
        Self {
            inner: IpcStreamInner::Unix(stream),
        }
    }
}

impl From<OwnedFd> for IpcStream {
    fn from(fd: OwnedFd) -> Self {
        Self {
            inner: IpcStreamInner::Fd(File::from(fd)),
        }
    }
}

impl From<File> for IpcStream {
    fn from(file: File) -> Self {
        Self {
            inner: IpcStreamInner::Fd(file),
        }
    }
}

impl IpcStream {
    /// Create a connected pair of full-duplex Unix stream sockets.
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = UnixStream::pair().map_err(TransportError::Create)?;
        debug!("created unix socket pair");
        Ok((left.into(), right.into()))
    }

    /// Create an anonymous pipe, returned as `(read_end, write_end)`.
    ///
    /// Both descriptors are close-on-exec.
    pub fn pipe() -> Result<(Self, Self)> {
        let (read_fd, write_fd) = raw_pipe().map_err(TransportError::Create)?;
        debug!("created anonymous pipe");
        Ok((read_fd.into(), write_fd.into()))
    }

    /// Combine a readable and a writable descriptor into one duplex stream.
    pub fn from_split(read: impl Into<OwnedFd>, write: impl Into<OwnedFd>) -> Self {
        Self {
            inner: IpcStreamInner::Split {
                read: File::from(read.into()),
                write: File::from(write.into()),
            },
        }
    }

    /// Create two crossed anonymous pipes, giving a duplex pair built from
    /// split descriptors (the pipe equivalent of [`pair`](Self::pair)).
    pub fn pipe_pair() -> Result<(Self, Self)> {
        let (left_read, right_write) = raw_pipe().map_err(TransportError::Create)?;
        let (right_read, left_write) = raw_pipe().map_err(TransportError::Create)?;
        debug!("created crossed pipe pair");
        Ok((
            Self::from_split(left_read, left_write),
            Self::from_split(right_read, right_write),
        ))
    }

    /// Try to clone this stream (creates new file descriptors).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            IpcStreamInner::Unix(stream) => Ok(stream.try_clone()?.into()),
            IpcStreamInner::Fd(file) => Ok(file.try_clone()?.into()),
            IpcStreamInner::Split { read, write } => {
                Ok(Self::from_split(read.try_clone()?, write.try_clone()?))
            }
        }
    }

    /// Put the descriptor(s) in (or out of) non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match &self.inner {
            IpcStreamInner::Unix(stream) => stream.set_nonblocking(nonblocking)?,
            IpcStreamInner::Fd(file) => {
                crate::pipe::set_nonblocking(file.as_raw_fd(), nonblocking)?
            }
            IpcStreamInner::Split { read, write } => {
                crate::pipe::set_nonblocking(read.as_raw_fd(), nonblocking)?;
                crate::pipe::set_nonblocking(write.as_raw_fd(), nonblocking)?;
            }
        }
        Ok(())
    }

    /// Transport kind for diagnostics.
    pub fn kind(&self) -> &'static str {
        match &self.inner {
            IpcStreamInner::Unix(_) => "unix",
            IpcStreamInner::Fd(_) => "fd",
            IpcStreamInner::Split { .. } => "split",
        }
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcStream")
            .field("type", &self.kind())
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

pub(crate) fn raw_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];

    // SAFETY: `fds` is a valid writable array of two c_ints as pipe(2) requires.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    // SAFETY: pipe(2) succeeded, so both descriptors are open and exclusively
    // owned by this process; wrapping them transfers that ownership.
    let (read_fd, write_fd) =
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    crate::pipe::set_cloexec(read_fd.as_raw_fd())?;
    crate::pipe::set_cloexec(write_fd.as_raw_fd())?;
    Ok((read_fd, write_fd))
}
