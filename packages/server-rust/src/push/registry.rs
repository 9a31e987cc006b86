//! Registry of live push sessions.
//!
//! A single reader/writer lock guards the session map. Readers copy the
//! sessions out before releasing it, and hooks run outside the lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tidewire_core::ApiError;

use super::hook::PushDispatchHook;
use super::session::PushSession;
use crate::service::auth::{self, SessionAuthenticator};

/// Tracks registered push sessions by id.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<PushSession>>>,
    hook: Option<Arc<dyn PushDispatchHook>>,
    authenticators: Vec<Arc<dyn SessionAuthenticator>>,
    subject: String,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(
        hook: Option<Arc<dyn PushDispatchHook>>,
        authenticators: Vec<Arc<dyn SessionAuthenticator>>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            hook,
            authenticators,
            subject: subject.into(),
        }
    }

    /// Runs the session authenticator chain.
    ///
    /// # Errors
    ///
    /// Returns 401 on rejection, 500 when an authenticator fails, or the
    /// `ApiError` an authenticator produced.
    pub async fn authenticate(&self, session: &PushSession) -> Result<(), ApiError> {
        auth::authenticate_session(&self.authenticators, session, &self.subject).await
    }

    /// Asks the hook whether `session` may start.
    ///
    /// # Errors
    ///
    /// Returns 403 when the hook refuses the session, the hook's `ApiError`,
    /// or 500 when the hook fails otherwise.
    pub async fn init_session(&self, session: &PushSession) -> Result<(), ApiError> {
        let Some(hook) = &self.hook else {
            return Ok(());
        };
        match hook.on_session_init(session).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ApiError::forbidden(
                "the push session was refused",
                &self.subject,
            )),
            Err(err) => Err(ApiError::from_anyhow(err).unwrap_or_else(|other| {
                tracing::error!(session_id = %session.id(), error = %other, "session init failed");
                ApiError::internal(other.to_string(), &self.subject)
            })),
        }
    }

    /// Registers `session` and notifies the hook.
    ///
    /// # Panics
    ///
    /// Panics if the session id is empty or already registered.
    pub fn register(&self, session: Arc<PushSession>) {
        assert!(!session.id().is_empty(), "push session id must not be empty");
        let count = {
            let mut sessions = self.sessions.write();
            assert!(
                !sessions.contains_key(session.id()),
                "push session {} is already registered",
                session.id()
            );
            sessions.insert(session.id().to_string(), Arc::clone(&session));
            sessions.len()
        };
        record_count(count);
        tracing::debug!(session_id = %session.id(), sessions = count, "push session registered");

        if let Some(hook) = &self.hook {
            hook.on_session_start(&session);
        }
    }

    /// Removes `session` and notifies the hook. Only the call that removed
    /// the entry runs the stop hook; unknown sessions are ignored.
    pub fn unregister(&self, session: &PushSession) {
        let (removed, count) = {
            let mut sessions = self.sessions.write();
            let removed = sessions.remove(session.id());
            (removed, sessions.len())
        };
        if removed.is_none() {
            return;
        }
        if let Some(hook) = &self.hook {
            hook.on_session_stop(session);
        }
        record_count(count);
        tracing::debug!(session_id = %session.id(), sessions = count, "push session unregistered");
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<PushSession>> {
        self.sessions.read().get(id).cloned()
    }

    /// Copies out every registered session.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<PushSession>> {
        self.sessions.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Closes every registered session. Their transports unregister them.
    pub fn close_all(&self) {
        for session in self.snapshot() {
            session.close();
        }
    }

    /// Polls every `poll` until no session is registered, giving up after
    /// `timeout`. Returns whether the registry drained.
    pub async fn wait_until_empty(&self, poll: Duration, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(remaining = self.len(), "push sessions did not drain in time");
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_count(count: usize) {
    metrics::gauge!("tidewire_push_sessions").set(count as f64);
}
