//! `std::io` adapter for a single channel.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use fmux_transport::WakePipe;

use crate::channel::Channel;
use crate::connection::Connection;
use crate::error::{MuxError, Result};

/// A channel viewed as a byte stream.
///
/// Implements [`Read`] and [`Write`] so a channel can be handed to anything
/// that speaks `std::io`. `flush` runs multiplex passes until the connection
/// has no pending output.
///
/// A write whose bytes were accepted but could not be framed reports success
/// for the accepted bytes; the framing error is returned by the next `write`
/// or `flush`.
#[derive(Debug)]
pub struct ChannelStream {
    conn: Connection,
    channel: Channel,
    read_timeout: Option<Duration>,
    deferred: Option<MuxError>,
}

impl ChannelStream {
    pub fn new(conn: Connection, channel: Channel) -> Self {
        Self {
            conn,
            channel,
            read_timeout: None,
            deferred: None,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Bound blocking reads; an expired read fails with
    /// [`io::ErrorKind::TimedOut`].
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    /// See [`Connection::readiness`].
    pub fn readiness(&self) -> Result<ChannelReadiness> {
        self.conn.readiness(&self.channel)
    }

    fn take_deferred(&mut self) -> io::Result<()> {
        match self.deferred.take() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

/// Pollable descriptor for one channel's inbound side.
///
/// The descriptor is readable while the channel has buffered bytes or has
/// reached end of stream, so a channel can join an application's own
/// `poll(2)` set. Never read from it; use the channel read calls.
#[derive(Debug, Clone)]
pub struct ChannelReadiness {
    signal: Arc<WakePipe>,
}

impl AsRawFd for ChannelReadiness {
    fn as_raw_fd(&self) -> RawFd {
        self.signal.as_raw_fd()
    }
}

impl Connection {
    /// Wrap `channel` in a [`ChannelStream`].
    pub fn stream(&self, channel: Channel) -> ChannelStream {
        ChannelStream::new(self.clone(), channel)
    }

    /// Readiness descriptor for `channel`, created on first request.
    ///
    /// It reflects bytes already demultiplexed. On a synchronous connection
    /// also poll the transport and call [`flush_reads`](Self::flush_reads)
    /// when it fires; on a pumped connection the pump keeps it current.
    pub fn readiness(&self, channel: &Channel) -> Result<ChannelReadiness> {
        let buffers = self.buffers(channel)?;
        Ok(ChannelReadiness {
            signal: buffers.inbound.signal()?,
        })
    }
}

impl Read for ChannelStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.conn
            .read_timeout(&self.channel, buf, self.read_timeout)
            .map_err(Into::into)
    }
}

impl Write for ChannelStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.take_deferred()?;
        match self.conn.write(&self.channel, buf) {
            Ok(n) => Ok(n),
            Err(MuxError::Flush { accepted, source }) if accepted > 0 => {
                self.deferred = Some(*source);
                Ok(accepted)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.take_deferred()?;
        self.conn.drain_writes().map(drop).map_err(Into::into)
    }
}
