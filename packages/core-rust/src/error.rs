//! Protocol-level error returned to clients.
//!
//! Every failure of a dispatch ends up as an [`ApiError`]: the status code it
//! maps to, a short title, a human-readable description and the subject (the
//! component that produced it). Validation errors raised by entities use the
//! same shape so they can be surfaced verbatim.

use serde::{Deserialize, Serialize};

/// A structured protocol error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("error {code} ({subject}): {title}: {description}")]
pub struct ApiError {
    /// HTTP-equivalent status code.
    pub code: u16,
    /// Short category of the error, e.g. `"Bad Request"`.
    pub title: String,
    /// Human-readable explanation.
    pub description: String,
    /// Component that produced the error.
    pub subject: String,
    /// Auxiliary data (e.g. a captured stack on recovered panics).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<serde_json::Value>,
    /// Request id the error belongs to, when known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trace: Option<String>,
}

impl ApiError {
    /// Creates a new error.
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        subject: impl Into<String>,
        code: u16,
    ) -> Self {
        Self {
            code,
            title: title.into(),
            description: description.into(),
            subject: subject.into(),
            data: None,
            trace: None,
        }
    }

    /// Attaches auxiliary data.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attaches the request id.
    #[must_use]
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }

    /// 400.
    pub fn bad_request(description: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new("Bad Request", description, subject, 400)
    }

    /// 401.
    pub fn unauthorized(description: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new("Unauthorized", description, subject, 401)
    }

    /// 403.
    pub fn forbidden(description: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new("Forbidden", description, subject, 403)
    }

    /// 404.
    pub fn not_found(description: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new("Not Found", description, subject, 404)
    }

    /// 405.
    pub fn method_not_allowed(description: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new("Method Not Allowed", description, subject, 405)
    }

    /// 409.
    pub fn conflict(description: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new("Conflict", description, subject, 409)
    }

    /// 422, used by entity validation.
    pub fn validation(description: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new("Validation Error", description, subject, 422)
    }

    /// 423.
    pub fn locked(description: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new("Locked", description, subject, 423)
    }

    /// 429.
    pub fn too_many_requests(description: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new("Too Many Requests", description, subject, 429)
    }

    /// 500.
    pub fn internal(description: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new("Internal Server Error", description, subject, 500)
    }

    /// 501.
    pub fn not_implemented(description: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new("Not Implemented", description, subject, 501)
    }

    /// Recovers an `ApiError` carried inside an `anyhow::Error`.
    ///
    /// Returns the original error back when it is something else, so callers
    /// can map it to the status appropriate for their step.
    ///
    /// # Errors
    ///
    /// Returns the untouched `anyhow::Error` when it does not wrap an `ApiError`.
    pub fn from_anyhow(err: anyhow::Error) -> Result<Self, anyhow::Error> {
        err.downcast::<ApiError>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_subject_and_description() {
        let err = ApiError::locked("read only", "tidewire");
        assert_eq!(
            err.to_string(),
            "error 423 (tidewire): Locked: read only"
        );
    }

    #[test]
    fn from_anyhow_recovers_api_error() {
        let wrapped = anyhow::Error::new(ApiError::forbidden("nope", "auth"));
        let recovered = ApiError::from_anyhow(wrapped).unwrap();
        assert_eq!(recovered.code, 403);
    }

    #[test]
    fn from_anyhow_returns_foreign_errors() {
        let wrapped = anyhow::anyhow!("disk on fire");
        let err = ApiError::from_anyhow(wrapped).unwrap_err();
        assert_eq!(err.to_string(), "disk on fire");
    }

    #[test]
    fn optional_fields_are_omitted_on_the_wire() {
        let json = serde_json::to_value(ApiError::bad_request("empty body", "tidewire")).unwrap();
        assert!(json.get("data").is_none());
        assert!(json.get("trace").is_none());
        assert_eq!(json["code"], 400);
    }
}
