//! The CRUD-style operations a client can request on an identity, and the
//! tri-state verdict returned by authenticators and authorizers.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// A resource operation, set once from the inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// List the children of a parent (or the root).
    RetrieveMany,
    /// Fetch a single object by identifier.
    Retrieve,
    /// Create a new object.
    Create,
    /// Replace an existing object.
    Update,
    /// Delete an existing object.
    Delete,
    /// Apply an assignation to an existing object.
    Patch,
    /// Count the children of a parent without returning them.
    Info,
}

impl Operation {
    /// All operations, in declaration order.
    pub const ALL: [Operation; 7] = [
        Operation::RetrieveMany,
        Operation::Retrieve,
        Operation::Create,
        Operation::Update,
        Operation::Delete,
        Operation::Patch,
        Operation::Info,
    ];

    /// Wire name of the operation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RetrieveMany => "retrieve-many",
            Self::Retrieve => "retrieve",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Patch => "patch",
            Self::Info => "info",
        }
    }

    /// Returns `true` for operations that mutate state and are therefore
    /// subject to read-only mode.
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::Create | Self::Update | Self::Delete | Self::Patch
        )
    }

    /// Returns `true` for operations that carry a request body.
    #[must_use]
    pub fn has_payload(self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Patch)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// AuthAction
// ---------------------------------------------------------------------------

/// Verdict of a single authenticator or authorizer.
///
/// `Ok` and `Ko` are terminal. `Continue` defers to the next link of the
/// chain; a chain exhausted on `Continue` accepts the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthAction {
    /// Accept and stop evaluating the chain.
    Ok,
    /// Reject and stop evaluating the chain.
    Ko,
    /// No opinion; ask the next link.
    Continue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_operations() {
        let writes: Vec<_> = Operation::ALL.iter().filter(|op| op.is_write()).collect();
        assert_eq!(
            writes,
            vec![
                &Operation::Create,
                &Operation::Update,
                &Operation::Delete,
                &Operation::Patch
            ]
        );
    }

    #[test]
    fn payload_operations() {
        assert!(Operation::Create.has_payload());
        assert!(Operation::Patch.has_payload());
        assert!(!Operation::Delete.has_payload());
        assert!(!Operation::Info.has_payload());
    }

    #[test]
    fn serde_names_match_display() {
        for op in Operation::ALL {
            let json = serde_json::to_string(&op).unwrap();
            assert_eq!(json, format!("\"{op}\""));
        }
    }
}
