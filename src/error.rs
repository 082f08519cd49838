use std::time::Duration;

use crate::ChannelId;

/// Why a channel stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called by the producer
    Normal,
    /// Peer shut the connection down or sent a close notification
    PeerClosed,
    /// Socket or poll failure
    Error(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Normal => write!(f, "closed by producer"),
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::Error(reason) => write!(f, "connection fault: {}", reason),
        }
    }
}

/// Unified channel error type
#[derive(Debug, thiserror::Error, Clone)]
pub enum ChannelError {
    /// Connect failure or fatal socket error
    #[error("Connection error: {reason} (retryable: {retryable})")]
    Connection {
        reason: String,
        retryable: bool,
    },

    /// Operation on a channel that is not active
    #[error("Channel closed: {reason}")]
    Closed {
        reason: CloseReason,
    },

    /// The page pool would grow past its elastic cap
    #[error("Resource '{resource}' exceeded: current {current}, limit {limit}")]
    ResourceExhausted {
        resource: String,
        current: usize,
        limit: usize,
    },

    /// Invalid configuration
    #[error("Configuration error in field '{field}': {reason}")]
    Configuration {
        field: String,
        reason: String,
    },

    /// Operation timed out
    #[error("Operation '{operation}' timeout after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },
}

impl ChannelError {
    /// Whether the caller may retry the same call later
    pub fn is_retryable(&self) -> bool {
        match self {
            ChannelError::Connection { retryable, .. } => *retryable,
            ChannelError::Closed { .. } => false,
            // pages come back once the peer drains them
            ChannelError::ResourceExhausted { .. } => true,
            ChannelError::Configuration { .. } => false,
            ChannelError::Timeout { .. } => true,
        }
    }

    /// Stable error code for logs
    pub fn error_code(&self) -> &'static str {
        match self {
            ChannelError::Connection { .. } => "CONNECTION_ERROR",
            ChannelError::Closed { .. } => "CHANNEL_CLOSED",
            ChannelError::ResourceExhausted { .. } => "RESOURCE_ERROR",
            ChannelError::Configuration { .. } => "CONFIG_ERROR",
            ChannelError::Timeout { .. } => "TIMEOUT_ERROR",
        }
    }

    /// Tags connection errors with the channel they came from
    pub fn with_channel(mut self, channel_id: ChannelId) -> Self {
        if let ChannelError::Connection { reason, .. } = &mut self {
            if !reason.contains("channel:") {
                *reason = format!("{} (channel: {})", reason, channel_id);
            }
        }
        self
    }
}

/// Convenience constructors
impl ChannelError {
    pub fn connection_error(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Connection {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn closed(reason: CloseReason) -> Self {
        Self::Closed { reason }
    }

    pub fn resource_error(resource: impl Into<String>, current: usize, limit: usize) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            current,
            limit,
        }
    }

    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout_error(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(error: std::io::Error) -> Self {
        let retryable = matches!(
            error.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
        );

        ChannelError::Connection {
            reason: format!("IO error: {}", error),
            retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let err = ChannelError::from(refused);
        assert!(err.is_retryable());
        assert_eq!(err.error_code(), "CONNECTION_ERROR");

        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert!(!ChannelError::from(reset).is_retryable());
    }

    #[test]
    fn test_with_channel_tags_once() {
        let err = ChannelError::connection_error("broken pipe", false)
            .with_channel(ChannelId::new(7))
            .with_channel(ChannelId::new(7));

        match err {
            ChannelError::Connection { reason, .. } => {
                assert_eq!(reason, "broken pipe (channel: channel-7)");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_exhaustion_is_retryable() {
        let err = ChannelError::resource_error("pages", 8, 8);
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Resource 'pages' exceeded: current 8, limit 8");
    }
}
