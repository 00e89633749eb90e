//! Duplex transport handles for fmux.
//!
//! The multiplexer runs over any bidirectional byte conduit the caller already
//! holds: a connected Unix stream socket, a socket pair, or the ends of an
//! anonymous pipe. This crate wraps those in a single [`IpcStream`] type and
//! provides the readiness-check primitive ([`poll::poll_readable`]) the
//! demultiplexer and the pump are built on.
//!
//! This is the lowest layer of fmux. Everything else builds on top of it.

#![cfg(unix)]

pub mod error;
pub mod pipe;
pub mod poll;
pub mod traits;

pub use error::{Result, TransportError};
pub use pipe::WakePipe;
pub use poll::{poll_readable, wait_readable, Readiness};
pub use traits::IpcStream;
