//! Network configuration for the HTTP/WebSocket adapter.

use std::time::Duration;

/// Listener and transport-level limits.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Upper bound on a whole HTTP request, enforced by `tower-http`.
    /// Dispatches are bounded separately by the operation timeout.
    pub request_timeout: Duration,
    /// Largest accepted request body in bytes.
    pub max_body_size: usize,
    /// How long shutdown waits for in-flight dispatches.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            request_timeout: Duration::from_secs(60),
            max_body_size: 4 * 1024 * 1024,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl NetworkConfig {
    /// `host:port` string to bind.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
