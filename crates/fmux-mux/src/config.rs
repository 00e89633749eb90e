use std::time::Duration;

use fmux_frame::DEFAULT_MAX_PAYLOAD;

/// Suggested channel table size for a connection.
pub const RECOMMENDED_CHANNELS: usize = 32;

/// Bytes taken from one channel per multiplex pass.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Inbound buffer level at which the demultiplexer stops draining the transport.
///
/// The check covers every open channel, [`CONTROL`](crate::CONTROL) included:
/// one full channel holds back frames for all the others until it is read.
pub const DEFAULT_INBOUND_HIGH_WATER: usize = 64 * 1024;

/// Maximum bytes a channel holds locally before they are framed.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64 * 1024;

/// Slice a synchronous blocking read waits on the transport before re-checking
/// its channel buffer.
pub const DEFAULT_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Tunables for a [`Connection`](crate::Connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// Channel table capacity; valid ids are `0..max_channels`.
    pub max_channels: usize,
    /// Maximum payload of a frame produced by the multiplexer.
    pub chunk_size: usize,
    /// See [`DEFAULT_INBOUND_HIGH_WATER`].
    pub inbound_high_water: usize,
    /// See [`DEFAULT_OUTBOUND_CAPACITY`].
    pub outbound_capacity: usize,
    /// Largest frame payload accepted from the transport.
    pub max_payload_size: usize,
    /// See [`DEFAULT_SYNC_POLL_INTERVAL`].
    pub sync_poll_interval: Duration,
}

impl MuxConfig {
    /// Default configuration with an explicit channel table size.
    pub fn with_channels(max_channels: usize) -> Self {
        Self {
            max_channels,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if self.max_channels == 0 {
            return Err("max_channels must be at least 1");
        }
        if self.max_channels > u32::MAX as usize {
            return Err("max_channels exceeds the wire channel id range");
        }
        if self.chunk_size == 0 {
            return Err("chunk_size must be at least 1");
        }
        if self.chunk_size > self.max_payload_size {
            return Err("chunk_size exceeds max_payload_size");
        }
        if self.outbound_capacity < self.chunk_size {
            return Err("outbound_capacity must hold at least one chunk");
        }
        if self.inbound_high_water == 0 {
            return Err("inbound_high_water must be at least 1");
        }
        Ok(())
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_channels: RECOMMENDED_CHANNELS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            inbound_high_water: DEFAULT_INBOUND_HIGH_WATER,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            sync_poll_interval: DEFAULT_SYNC_POLL_INTERVAL,
        }
    }
}
