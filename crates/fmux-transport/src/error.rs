/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to create a pipe or socket pair.
    #[error("failed to create transport pair: {0}")]
    Create(std::io::Error),

    /// The readiness check itself failed.
    #[error("readiness poll failed: {0}")]
    Poll(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
