//! Error taxonomy for the Ferrobus messaging kernel.
//!
//! The taxonomy follows the platform error model: *invalid message*
//! (framing/decoding failure), *channel error* (illegal channel
//! operation), *stop* (a structured request to close a transmission
//! with a numeric code), *service error* (any other unexpected
//! failure), *timeout*, and wrapped ZeroMQ errors.

use thiserror::Error;

/// Main error type for Ferrobus operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A formal error was detected in a message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Transmission channel error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Error raised by a service or component.
    #[error("service error: {0}")]
    Service(String),

    /// Configuration load or validation error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Structured request to stop further processing.
    ///
    /// Carries the numeric code the protocol should put on the wire in
    /// its ERROR/CLOSE message. For FBDP a code of `0` (OK) signals
    /// normal end of stream rather than an error.
    #[error("{reason}")]
    Stop {
        /// Protocol error code to report.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },

    /// Operation did not finish within its time limit.
    #[error("operation timed out")]
    Timeout,

    /// Error reported by the ZeroMQ layer.
    #[error("ZMQ error: {0}")]
    Zmq(#[from] zmq::Error),
}

impl Error {
    /// Create an invalid message error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into())
    }

    /// Create a channel error.
    pub fn channel(msg: impl Into<String>) -> Self {
        Self::Channel(msg.into())
    }

    /// Create a service error.
    pub fn service(msg: impl Into<String>) -> Self {
        Self::Service(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a stop request carrying a protocol error code.
    pub fn stop(code: u16, reason: impl Into<String>) -> Self {
        Self::Stop { code, reason: reason.into() }
    }

    /// The stop code, if this is a stop request.
    #[must_use]
    pub fn stop_code(&self) -> Option<u16> {
        match self {
            Self::Stop { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true if this is the timeout error.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Returns true if this error wraps a ZMQ `EAGAIN`.
    #[must_use]
    pub fn is_again(&self) -> bool {
        matches!(self, Self::Zmq(zmq::Error::EAGAIN))
    }
}

/// Result type alias for Ferrobus operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_code() {
        let err = Error::stop(17, "request cancelled");
        assert_eq!(err.stop_code(), Some(17));
        assert_eq!(err.to_string(), "request cancelled");
        assert_eq!(Error::channel("x").stop_code(), None);
    }

    #[test]
    fn test_again_detection() {
        assert!(Error::from(zmq::Error::EAGAIN).is_again());
        assert!(!Error::from(zmq::Error::ETERM).is_again());
        assert!(!Error::Timeout.is_again());
    }
}
