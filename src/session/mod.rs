pub mod channel;
pub mod handshake;

use std::time::Duration;

use crate::error::{Error, SessionError};

/// Configuration for attesting and running a peer session.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Maximum payload of a single handshake frame (default: 64 KiB). Set it to
    /// the outer transport's handshake frame limit.
    pub max_frame_size: u32,

    /// Maximum payload of a relay frame once the session is trusted (default: 16 MiB).
    pub max_payload_size: u32,

    /// Maximum time allowed for all four phases together (default: 30s).
    pub handshake_timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_frame_size: crate::frame::MAX_HANDSHAKE_FRAME_SIZE,
            max_payload_size: crate::frame::MAX_PAYLOAD_SIZE,
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

impl HandshakeConfig {
    /// Create a builder for constructing a `HandshakeConfig`.
    pub fn builder() -> HandshakeConfigBuilder {
        HandshakeConfigBuilder::default()
    }
}

/// Builder for [`HandshakeConfig`].
#[derive(Debug, Clone)]
pub struct HandshakeConfigBuilder {
    max_frame_size: u32,
    max_payload_size: u32,
    handshake_timeout: Duration,
}

impl Default for HandshakeConfigBuilder {
    fn default() -> Self {
        let defaults = HandshakeConfig::default();
        Self {
            max_frame_size: defaults.max_frame_size,
            max_payload_size: defaults.max_payload_size,
            handshake_timeout: defaults.handshake_timeout,
        }
    }
}

impl HandshakeConfigBuilder {
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Build the `HandshakeConfig`, validating that all values are sensible.
    pub fn build(self) -> Result<HandshakeConfig, Error> {
        if self.max_frame_size == 0 {
            return Err(invalid("max_frame_size must be > 0"));
        }
        if self.max_frame_size > crate::frame::MAX_PAYLOAD_SIZE {
            return Err(invalid("max_frame_size exceeds the 16 MiB frame limit"));
        }
        if self.max_payload_size == 0 {
            return Err(invalid("max_payload_size must be > 0"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(invalid("handshake_timeout must be > 0"));
        }
        Ok(HandshakeConfig {
            max_frame_size: self.max_frame_size,
            max_payload_size: self.max_payload_size.min(crate::frame::MAX_PAYLOAD_SIZE),
            handshake_timeout: self.handshake_timeout,
        })
    }
}

fn invalid(msg: &str) -> Error {
    SessionError::InvalidConfig(msg.into()).into()
}
