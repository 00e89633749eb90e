/// Failures while putting frames on, or taking them off, a byte stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A length field (or an outgoing payload) is above the allowed limit.
    #[error("frame payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("frame transport error: {0}")]
    Io(#[from] std::io::Error),

    /// End of stream arrived part way through a frame.
    #[error("stream ended inside a frame")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
