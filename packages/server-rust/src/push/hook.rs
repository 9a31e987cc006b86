//! Pluggable delivery policy for push sessions.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tidewire_core::Event;

use super::session::PushSession;

/// Opaque per-event value computed once and shared by every
/// [`PushDispatchHook::should_dispatch`] call for that event.
pub type EventSummary = Arc<dyn Any + Send + Sync>;

/// Session lifecycle notifications and per-session delivery decisions.
///
/// Every method has a permissive default, so implementations override only
/// what they need.
#[async_trait]
pub trait PushDispatchHook: Send + Sync {
    /// Admits or rejects an authenticated session before it is registered.
    async fn on_session_init(&self, _session: &PushSession) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Called after the session is registered.
    fn on_session_start(&self, _session: &PushSession) {}

    /// Called before the session is removed.
    fn on_session_stop(&self, _session: &PushSession) {}

    /// Computes the value handed to every `should_dispatch` call for `event`.
    /// An error drops the event for every session.
    fn summarize_event(&self, _event: &Event) -> anyhow::Result<Option<EventSummary>> {
        Ok(None)
    }

    /// Identities whose filters also govern events of `identity`.
    fn related_identities(&self, _identity: &str) -> Vec<String> {
        Vec::new()
    }

    /// Decides whether `session` receives `event`. An error counts as `false`.
    async fn should_dispatch(
        &self,
        _session: &PushSession,
        _event: &Event,
        _summary: Option<&(dyn Any + Send + Sync)>,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }
}
