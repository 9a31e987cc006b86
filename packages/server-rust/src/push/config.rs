//! Push subsystem configuration.

use std::time::Duration;

/// Configuration of the push server and its sessions.
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Pub/sub topic events are published on and received from.
    pub topic: String,
    /// Maximum queued messages per session; the oldest is dropped beyond it.
    pub session_queue_capacity: usize,
    /// Capacity of the channel feeding the distribution loop.
    pub publication_buffer: usize,
    /// How often `stop` checks whether every session is gone.
    pub drain_poll_interval: Duration,
    /// How long `stop` waits for sessions to go away.
    pub drain_timeout: Duration,
    /// How long `start` waits for the pub/sub backend to connect.
    pub connect_timeout: Duration,
    /// Subject of errors produced while admitting sessions.
    pub service_name: String,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            topic: "events".to_string(),
            session_queue_capacity: 256,
            publication_buffer: 1024,
            drain_poll_interval: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            service_name: "tidewire".to_string(),
        }
    }
}
