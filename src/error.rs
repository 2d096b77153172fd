//! Error types for sealwire.

use thiserror::Error;

use crate::framer::FramerStatus;

/// Main error type for all sealwire operations.
#[derive(Debug, Error)]
pub enum SealwireError {
    /// I/O error from the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The endpoint was destroyed while an operation was in flight.
    #[error("secure endpoint shutdown")]
    Shutdown,

    /// A wrapped read reported an error (or the shutdown race fired).
    ///
    /// The source is the transport error observed by the wrapped endpoint.
    #[error("Secure read failed: {0}")]
    SecureRead(#[source] Box<SealwireError>),

    /// The framer rejected inbound ciphertext.
    #[error("Unwrap failed ({0})")]
    Unwrap(FramerStatus),

    /// The framer rejected outbound plaintext.
    #[error("Wrap failed ({0})")]
    Wrap(FramerStatus),

    /// Connection closed by the peer.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl SealwireError {
    /// Whether this error is (or wraps) the destroy-during-read cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            SealwireError::Shutdown => true,
            SealwireError::SecureRead(inner) => inner.is_cancelled(),
            _ => false,
        }
    }
}

/// Result type alias using SealwireError.
pub type Result<T> = std::result::Result<T, SealwireError>;
