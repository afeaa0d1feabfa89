//! Error types and handling

use thiserror::Error;

/// Result type alias for fallible operations in this crate
pub type Result<T> = std::result::Result<T, MaelstromError>;

/// Main error type
///
/// Queue operations never surface errors; they report success through their
/// return values. This type covers construction-time and OS-facing failures.
#[derive(Error, Debug)]
pub enum MaelstromError {
    /// I/O errors from socket or descriptor operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A bounded ring rejected an entry because it was full
    #[error("Ring is full")]
    RingFull,

    /// A timed operation reached its deadline
    #[error("Operation timed out")]
    Timeout,

    /// Invalid configuration parameter
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration issue
        message: String,
    },

    /// Listener or connection socket errors
    #[error("Socket error: {message}")]
    Socket {
        /// Description of the socket issue
        message: String,
    },

    /// CPU affinity errors
    #[error("CPU affinity error: {0}")]
    CpuAffinity(#[from] nix::Error),

    /// System resource errors (descriptor creation, registration)
    #[error("System resource error: {message}")]
    SystemResource {
        /// Description of the resource issue
        message: String,
    },
}

impl MaelstromError {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new socket error
    pub fn socket(message: impl Into<String>) -> Self {
        Self::Socket {
            message: message.into(),
        }
    }

    /// Create a new system resource error
    pub fn system_resource(message: impl Into<String>) -> Self {
        Self::SystemResource {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable by retrying
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RingFull | Self::Timeout | Self::Socket { .. } | Self::Io(_))
    }

    /// Check if this error is related to network operations
    pub fn is_network_error(&self) -> bool {
        matches!(self, Self::Socket { .. } | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = MaelstromError::config("test message");
        assert!(matches!(err, MaelstromError::InvalidConfig { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_classification() {
        let ring_full = MaelstromError::RingFull;
        assert!(ring_full.is_recoverable());
        assert!(!ring_full.is_network_error());

        let socket_err = MaelstromError::socket("connection refused");
        assert!(socket_err.is_recoverable());
        assert!(socket_err.is_network_error());

        let resource_err = MaelstromError::system_resource("eventfd create failed");
        assert!(!resource_err.is_recoverable());
    }
}
