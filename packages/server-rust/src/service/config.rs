use std::collections::HashSet;
use std::time::Duration;

/// Server-level configuration for the dispatch pipeline.
///
/// Controls read-only mode, panic containment and the subject stamped on
/// errors produced by the framework itself.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name used as the `subject` of framework-generated errors.
    pub service_name: String,
    /// Rejects every write operation with 423 unless the identity is exempted.
    pub read_only: bool,
    /// Identity names still writable while `read_only` is set.
    pub read_only_exempted_identities: HashSet<String>,
    /// When `true`, panics in processors are not converted into 500 responses
    /// and bring the process down instead.
    pub disable_panic_recovery: bool,
    /// Header carrying the client identifier used for rate limiting when no
    /// peer address is available.
    pub client_id_header: String,
    /// Upper bound on one dispatch. An expired dispatch is canceled.
    pub operation_timeout: Duration,
}

impl ServerConfig {
    /// Returns `true` when writes on `identity` must be refused.
    #[must_use]
    pub fn is_locked(&self, identity: &str) -> bool {
        self.read_only && !self.read_only_exempted_identities.contains(identity)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service_name: "tidewire".to_string(),
            read_only: false,
            read_only_exempted_identities: HashSet::new(),
            disable_panic_recovery: false,
            client_id_header: "x-forwarded-for".to_string(),
            operation_timeout: Duration::from_secs(30),
        }
    }
}
