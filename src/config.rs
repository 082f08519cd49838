//! Channel configuration
//!
//! Supplied once to [`Channel::open`](crate::Channel::open); nothing can be
//! changed on a live channel.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::packet::MAX_BODY_LEN;

/// What `write` does when the page pool is at its elastic cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackpressurePolicy {
    /// Fail the write with `ResourceExhausted`
    Reject,
    /// Wait up to `timeout` for the worker to recycle pages, then fail
    Block { timeout: Duration },
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        BackpressurePolicy::Reject
    }
}

/// TCP channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Render server host name or address
    pub host: String,
    /// Render server port
    pub port: u16,
    /// Capacity of every page, also the largest frame body
    pub page_size: usize,
    /// Pages allocated up front
    pub page_count: usize,
    /// Elastic cap on live pages
    pub max_pages: usize,
    /// Upper bound on one readiness wait
    pub poll_timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Speculative buffer size for bytes that arrive before `request_read`
    pub unknown_read_size: usize,
    /// Largest single buffer requested from the sink; bigger reads arrive in pieces
    pub max_read_size: usize,
    /// TCP_NODELAY
    pub nodelay: bool,
    /// Send a close frame to the peer on `close()`
    pub notify_peer_on_close: bool,
    pub backpressure: BackpressurePolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 23432,
            page_size: 4096,
            page_count: 2,
            max_pages: 2048,
            poll_timeout: Duration::from_millis(20),
            connect_timeout: Duration::from_secs(5),
            unknown_read_size: 512,
            max_read_size: 1 << 20,
            nodelay: true,
            notify_peer_on_close: false,
            backpressure: BackpressurePolicy::Reject,
        }
    }
}

impl ChannelConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_page_count(mut self, page_count: usize) -> Self {
        self.page_count = page_count;
        self
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_unknown_read_size(mut self, size: usize) -> Self {
        self.unknown_read_size = size;
        self
    }

    pub fn with_max_read_size(mut self, size: usize) -> Self {
        self.max_read_size = size;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_notify_peer_on_close(mut self, notify: bool) -> Self {
        self.notify_peer_on_close = notify;
        self
    }

    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    /// `host:port` as handed to address resolution
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.host.is_empty() {
            return Err(ChannelError::config_error("host", "must not be empty"));
        }

        if self.page_size == 0 {
            return Err(ChannelError::config_error("page_size", "must be > 0"));
        }

        if self.page_size > MAX_BODY_LEN {
            return Err(ChannelError::config_error(
                "page_size",
                format!("must fit the 24-bit frame length (<= {})", MAX_BODY_LEN),
            ));
        }

        if self.max_pages == 0 {
            return Err(ChannelError::config_error("max_pages", "must be > 0"));
        }

        if self.page_count > self.max_pages {
            return Err(ChannelError::config_error(
                "page_count",
                format!("{} exceeds max_pages {}", self.page_count, self.max_pages),
            ));
        }

        if self.poll_timeout.is_zero() {
            return Err(ChannelError::config_error(
                "poll_timeout",
                "must be > 0 so the worker does not spin",
            ));
        }

        if self.unknown_read_size == 0 {
            return Err(ChannelError::config_error("unknown_read_size", "must be > 0"));
        }

        if self.max_read_size == 0 {
            return Err(ChannelError::config_error("max_read_size", "must be > 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ChannelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.address(), "127.0.0.1:23432");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases = [
            (ChannelConfig::default().with_page_size(0), "page_size"),
            (ChannelConfig::default().with_page_size(MAX_BODY_LEN + 1), "page_size"),
            (ChannelConfig::default().with_max_pages(0), "max_pages"),
            (ChannelConfig::default().with_page_count(10).with_max_pages(4), "page_count"),
            (ChannelConfig::default().with_poll_timeout(Duration::ZERO), "poll_timeout"),
            (ChannelConfig::default().with_unknown_read_size(0), "unknown_read_size"),
            (ChannelConfig::default().with_max_read_size(0), "max_read_size"),
            (ChannelConfig::new("", 1), "host"),
        ];

        for (config, expected_field) in cases {
            match config.validate() {
                Err(ChannelError::Configuration { field, .. }) => assert_eq!(field, expected_field),
                other => panic!("expected config error on {}, got {:?}", expected_field, other),
            }
        }
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = ChannelConfig::new("render.local", 4000)
            .with_page_size(10 * 1024)
            .with_backpressure(BackpressurePolicy::Block {
                timeout: Duration::from_millis(250),
            });

        let json = serde_json::to_string(&config).unwrap();
        let parsed: ChannelConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.host, "render.local");
        assert_eq!(parsed.page_size, 10 * 1024);
        assert_eq!(parsed.backpressure, config.backpressure);
    }
}
