//! Pub/sub backend abstraction.
//!
//! A backend moves [`Publication`]s between processes. The push server
//! publishes every event through it and subscribes to the same topic, so a
//! single distribution loop serves local and remote events alike.

pub mod local;

use std::time::Duration;

use async_trait::async_trait;
use tidewire_core::Publication;
use tokio::sync::{mpsc, oneshot};

pub use local::LocalPubSub;

/// Errors reported by a pub/sub backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PubSubError {
    #[error("pub/sub backend is not connected")]
    NotConnected,
    #[error("publish on topic '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscription to topic '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("pub/sub backend disconnected")]
    Disconnected,
}

/// Resolves once a backend connection attempt succeeded or failed.
#[derive(Debug)]
pub struct Waiter {
    outcome: oneshot::Receiver<bool>,
}

impl Waiter {
    /// A waiter and the sender its backend resolves it with.
    #[must_use]
    pub fn channel() -> (oneshot::Sender<bool>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { outcome: rx })
    }

    /// A waiter already resolved to `connected`.
    #[must_use]
    pub fn resolved(connected: bool) -> Self {
        let (tx, waiter) = Self::channel();
        let _ = tx.send(connected);
        waiter
    }

    /// Waits up to `timeout` for the outcome. Returns `true` only if the
    /// backend reported a successful connection in time.
    pub async fn wait(self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.outcome).await,
            Ok(Ok(true))
        )
    }
}

/// Cancels a subscription when invoked.
pub struct Unsubscriber(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscriber {
    #[must_use]
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(cancel)))
    }

    /// An unsubscriber that does nothing.
    #[must_use]
    pub fn noop() -> Self {
        Self(None)
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.0.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Unsubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscriber")
            .field("active", &self.0.is_some())
            .finish()
    }
}

/// Transport-agnostic pub/sub client.
#[async_trait]
pub trait PubSubClient: Send + Sync {
    /// Publishes `publication` on its topic.
    async fn publish(&self, publication: Publication) -> Result<(), PubSubError>;

    /// Forwards every publication on `topic` to `pubs`, and backend errors
    /// to `errors`, until the returned handle is invoked.
    fn subscribe(
        &self,
        pubs: mpsc::Sender<Publication>,
        errors: mpsc::Sender<PubSubError>,
        topic: &str,
    ) -> Unsubscriber;

    /// Starts connecting. The waiter reports the outcome.
    fn connect(&self) -> Waiter;

    /// Disconnects from the backend.
    async fn disconnect(&self) -> Result<(), PubSubError>;
}
