//! Many ordered byte-stream channels over one socket or pipe.
//!
//! fmux splits a single duplex transport into independent logical channels.
//! Each channel is an ordered byte stream; frames carry a channel id and a
//! length, nothing else.
//!
//! # Crate Structure
//!
//! - [`transport`] — Duplex stream handles and readiness polling
//! - [`frame`] — Wire framing (optional tokio codec behind `async`)
//! - [`mux`] — Connections, channels, select, and the background pump
//!
//! The most used types are also re-exported at the top level.

/// Re-export transport types.
pub mod transport {
    pub use fmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use fmux_frame::*;
}

/// Re-export multiplexer types.
pub mod mux {
    pub use fmux_mux::*;
}

pub use fmux_frame::Frame;
pub use fmux_mux::{
    Channel, ChannelReadiness, ChannelStream, ChannelType, Connection, Mode, MuxConfig, MuxError,
    Pump, PumpError, CONTROL,
};
pub use fmux_transport::IpcStream;
