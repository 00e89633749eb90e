use std::time::Duration;

/// Errors returned by connection and channel operations.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The channel id is out of range, the handle belongs to another
    /// connection, or the channel has been closed.
    #[error("invalid or closed channel {id}")]
    InvalidChannel { id: u32 },

    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection is serviced by a pump; synchronous demultiplexing is
    /// not allowed.
    #[error("connection is serviced by a pump")]
    Pumped,

    /// An earlier transport failure left the stream unusable.
    #[error("transport failed earlier; connection must be closed")]
    TransportFailed,

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Bytes were accepted into the channel, but framing them onto the
    /// transport failed.
    #[error("accepted {accepted} bytes but flush failed: {source}")]
    Flush {
        accepted: usize,
        #[source]
        source: Box<MuxError>,
    },

    /// A bounded wait expired before data arrived.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// Frame-level error on the transport.
    #[error("frame error: {0}")]
    Frame(#[from] fmux_frame::FrameError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] fmux_transport::TransportError),
}

pub type Result<T> = std::result::Result<T, MuxError>;

impl From<MuxError> for std::io::Error {
    fn from(err: MuxError) -> Self {
        use std::io::ErrorKind;

        match err {
            MuxError::Frame(fmux_frame::FrameError::Io(io))
            | MuxError::Transport(fmux_transport::TransportError::Io(io)) => io,
            MuxError::Frame(fmux_frame::FrameError::ConnectionClosed) => {
                std::io::Error::new(ErrorKind::UnexpectedEof, err.to_string())
            }
            MuxError::InvalidChannel { .. } | MuxError::ConnectionClosed => {
                std::io::Error::new(ErrorKind::NotConnected, err.to_string())
            }
            MuxError::TimedOut(_) => std::io::Error::new(ErrorKind::TimedOut, err.to_string()),
            MuxError::InvalidConfig(_) => {
                std::io::Error::new(ErrorKind::InvalidInput, err.to_string())
            }
            MuxError::Flush { source, .. } => (*source).into(),
            other => std::io::Error::other(other.to_string()),
        }
    }
}

/// Errors returned by [`Pump`](crate::Pump) operations.
#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    /// The pump loop is not running.
    #[error("pump is not running")]
    NotRunning,

    /// `start` was called on a pump that is already running.
    #[error("pump already started")]
    AlreadyStarted,

    /// The pump has stopped; pumps are one-shot.
    #[error("pump already stopped")]
    AlreadyStopped,

    /// The connection is registered with a different pump.
    #[error("connection is already serviced by another pump")]
    AlreadyPumped,

    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Wake pipe or readiness poll failure.
    #[error("transport error: {0}")]
    Transport(#[from] fmux_transport::TransportError),
}
