use std::time::Duration;

use thiserror::Error;

/// Error type for the consumer service.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// A configuration value could not be parsed or failed validation.
    #[error("Invalid configuration for {key}={value:?}: {reason}")]
    Config {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// A broker request did not complete within the handshake timeout.
    #[error("Broker request '{operation}' timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Custom messaging-related error, e.g. a request issued without an open channel.
    #[error("Messaging setup or configuration error: {message}")]
    MessagingError {
        message: String,
    },

    /// Error from the message handler logic.
    #[error("Message handler failed: {0}")]
    HandlerError(#[from] Box<dyn std::error::Error + Send + Sync>),

    /// A request reached the transport before its connection or channel existed.
    #[error("Broker request issued without an open {resource}")]
    NotConnected {
        resource: &'static str,
    },

    /// Every sender of the consumer's event channel is gone.
    #[error("Consumer event channel closed unexpectedly")]
    EventChannelClosed,

    /// I/O failure in the HTTP surface.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConsumerError {
    /// Errors the consumer cannot recover from by reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsumerError::NotConnected { .. } | ConsumerError::EventChannelClosed)
    }
}

// Allow converting from a string-like type into a MessagingError
impl From<&str> for ConsumerError {
    fn from(s: &str) -> Self {
        ConsumerError::MessagingError { message: s.to_string() }
    }
}

impl From<String> for ConsumerError {
    fn from(s: String) -> Self {
        ConsumerError::MessagingError { message: s }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_driver_faults_are_fatal() {
        assert!(ConsumerError::NotConnected { resource: "channel" }.is_fatal());
        assert!(ConsumerError::EventChannelClosed.is_fatal());
        assert!(!ConsumerError::from("broker rejected").is_fatal());
        assert!(!ConsumerError::Timeout {
            operation: "bind_queue",
            timeout: Duration::from_secs(30),
        }
        .is_fatal());
    }
}
