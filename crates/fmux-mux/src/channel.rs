//! Channel handles.
//!
//! A [`Channel`] is an opaque, copyable token naming one slot of one
//! connection's channel table. The connection owns the channel's buffers;
//! the handle only carries enough identity to find them again and to detect
//! that the slot was closed (and possibly reopened) in the meantime.

/// Conventional control channel, opened automatically on every connection.
///
/// Like every open channel it counts toward inbound backpressure: if the
/// application never reads it and the peer keeps sending on it, the
/// connection stops draining the transport and other channels starve.
/// Read it, or close it with [`Connection::close_channel`](crate::Connection::close_channel).
pub const CONTROL: u32 = 0;

/// Content hint carried with a channel. Not interpreted by the multiplexer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ChannelType {
    #[default]
    Text,
    Binary,
}

/// Handle to an open channel.
///
/// Handles are caller-discard-after-close: once the channel (or its
/// connection) is closed, every operation taking this handle fails with
/// [`MuxError::InvalidChannel`](crate::MuxError::InvalidChannel), even if
/// the same id is opened again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel {
    pub(crate) connection: u64,
    pub(crate) id: u32,
    pub(crate) generation: u64,
}

impl Channel {
    /// The channel id, as carried on the wire.
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel {} (conn {})", self.id, self.connection)
    }
}
