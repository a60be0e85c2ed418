pub mod client;
pub mod server;
pub mod types;
pub mod wire;

use std::time::Duration;

use crate::error::{Error, SessionError};

pub use client::{EngineClient, EngineTxStream};

/// Connection settings for the remote trust engine.
///
/// Passed explicitly to [`EngineClient::new`]; nothing is read from global state.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `host:port` of the engine's call endpoint.
    pub endpoint: String,

    /// Maximum time to establish a connection (default: 5s).
    pub connect_timeout: Duration,

    /// Maximum time for one request/response round trip, dialling included (default: 10s).
    pub request_timeout: Duration,

    /// Maximum frame payload accepted from the engine (default: 16 MiB).
    pub max_payload_size: u32,

    /// Idle request connections kept for reuse (default: 4). Concurrent calls
    /// beyond this dial extra connections that are closed afterwards.
    pub max_idle_connections: usize,
}

impl EngineConfig {
    /// Config with default timeouts for the engine at `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_payload_size: crate::frame::MAX_PAYLOAD_SIZE,
            max_idle_connections: 4,
        }
    }

    /// Create a builder for constructing an `EngineConfig`.
    pub fn builder(endpoint: impl Into<String>) -> EngineConfigBuilder {
        EngineConfigBuilder {
            config: Self::new(endpoint),
        }
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    pub fn max_idle_connections(mut self, count: usize) -> Self {
        self.config.max_idle_connections = count;
        self
    }

    /// Build the `EngineConfig`, validating that all values are sensible.
    pub fn build(self) -> Result<EngineConfig, Error> {
        if self.config.endpoint.trim().is_empty() {
            return Err(invalid("engine endpoint must not be empty"));
        }
        if self.config.connect_timeout.is_zero() {
            return Err(invalid("connect_timeout must be > 0"));
        }
        if self.config.request_timeout.is_zero() {
            return Err(invalid("request_timeout must be > 0"));
        }
        if self.config.max_payload_size == 0 {
            return Err(invalid("max_payload_size must be > 0"));
        }
        Ok(self.config)
    }
}

fn invalid(msg: &str) -> Error {
    SessionError::InvalidConfig(msg.into()).into()
}
