//! Channel multiplexing over a single duplex transport.
//!
//! A [`Connection`] wraps one transport and a fixed-size table of logical
//! channels. Bytes written to a channel are framed onto the transport in
//! chunks; frames read from the transport are routed to the matching
//! channel's buffer. Per-channel byte order is preserved; nothing is
//! promised across channels.
//!
//! Connections demultiplex themselves on every read and select
//! ([`Mode::Synchronous`]), or hand that job to a [`Pump`] that services many
//! connections from one thread ([`Mode::Pumped`]). A connection is never
//! serviced by both.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod demux;
pub mod error;
pub mod mux;
pub mod pump;
pub mod read_write;
pub mod select;
pub mod stream;

pub use channel::{Channel, ChannelType, CONTROL};
pub use config::{
    MuxConfig, DEFAULT_CHUNK_SIZE, DEFAULT_INBOUND_HIGH_WATER, DEFAULT_OUTBOUND_CAPACITY,
    DEFAULT_SYNC_POLL_INTERVAL, RECOMMENDED_CHANNELS,
};
pub use connection::{Connection, Mode};
pub use error::{MuxError, PumpError, Result};
pub use pump::{Pump, PumpState, SATURATION_BACKOFF};
pub use stream::{ChannelReadiness, ChannelStream};
