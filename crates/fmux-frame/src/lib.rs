//! Wire framing for fmux.
//!
//! Every frame on the transport is:
//! - A 4-byte big-endian channel id
//! - A 4-byte big-endian payload length
//! - Exactly that many payload bytes
//!
//! Frames are adjacent on the wire with no separators. Payloads carry no
//! message boundaries of their own; each one is just more bytes for the
//! channel's stream.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

#[cfg(feature = "async")]
pub mod tokio_codec;

pub use codec::{
    decode_frame, decode_header, encode_frame, encode_header, Frame, FrameConfig,
    DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use reader::read_frame;
pub use writer::write_frame;

#[cfg(feature = "async")]
pub use tokio_codec::MuxCodec;
