//! Per-session push filters.
//!
//! Clients send a [`PushFilter`] over their push channel to narrow which
//! events they receive. An empty filter lets everything through.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::event::EventType;

/// Allow/deny list over identities and event types.
///
/// - `identities`: when non-empty, only the listed identities pass. Each
///   entry maps to the event types accepted for it; an empty list accepts
///   every type.
/// - `denied_identities`: identities that never pass, regardless of
///   `identities`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushFilter {
    #[serde(default)]
    pub identities: BTreeMap<String, Vec<EventType>>,
    #[serde(default)]
    pub denied_identities: BTreeSet<String>,
}

impl PushFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `identity` for the given event types (all types if empty).
    #[must_use]
    pub fn allow(mut self, identity: impl Into<String>, types: &[EventType]) -> Self {
        self.identities.insert(identity.into(), types.to_vec());
        self
    }

    /// Rejects every event of `identity`.
    #[must_use]
    pub fn deny(mut self, identity: impl Into<String>) -> Self {
        self.denied_identities.insert(identity.into());
        self
    }

    /// Returns `true` when an event of `identity` and `event_type` must not
    /// be delivered.
    #[must_use]
    pub fn is_filtered_out(&self, identity: &str, event_type: EventType) -> bool {
        if self.denied_identities.contains(identity) {
            return true;
        }
        if self.identities.is_empty() {
            return false;
        }
        match self.identities.get(identity) {
            None => true,
            Some(types) => !types.is_empty() && !types.contains(&event_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_passes_everything() {
        let filter = PushFilter::new();
        assert!(!filter.is_filtered_out("list", EventType::Create));
        assert!(!filter.is_filtered_out("task", EventType::Delete));
    }

    #[test]
    fn denied_identity_never_passes() {
        let filter = PushFilter::new().allow("list", &[]).deny("list");
        for event_type in [EventType::Create, EventType::Update, EventType::Delete] {
            assert!(filter.is_filtered_out("list", event_type));
        }
        assert!(filter.is_filtered_out("task", EventType::Create));
    }

    #[test]
    fn allow_list_restricts_identities_and_types() {
        let filter = PushFilter::new()
            .allow("list", &[])
            .allow("task", &[EventType::Delete]);
        assert!(!filter.is_filtered_out("list", EventType::Update));
        assert!(!filter.is_filtered_out("task", EventType::Delete));
        assert!(filter.is_filtered_out("task", EventType::Create));
        assert!(filter.is_filtered_out("user", EventType::Create));
    }

    #[test]
    fn wire_form_uses_camel_case() {
        let filter: PushFilter =
            serde_json::from_str(r#"{"deniedIdentities":["list"]}"#).unwrap();
        assert!(filter.is_filtered_out("list", EventType::Create));
        assert!(filter.identities.is_empty());
    }
}
