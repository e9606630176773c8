//! Resource client failures, their classification, and the engine error taxonomy.

use serde::{Deserialize, Serialize};

/// Failure reported by a `ResourceClient`. API failures keep the HTTP status so
/// the classifier can tell "not found" and "conflict" apart from the rest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("api error {code} ({reason}): {message}")]
    Api { code: u16, reason: String, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("client configuration: {0}")]
    Config(String),
}

impl ClientError {
    pub fn api(code: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        ClientError::Api { code, reason: reason.into(), message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::api(404, "NotFound", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::api(409, "Conflict", message)
    }

    pub fn is_not_found(&self) -> bool {
        classify(self) == ErrorClass::NotFound
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    NotFound,
    Conflict,
    /// Schema or validation failure reported by the API.
    Rejected,
    /// Network or server-side failure; callers may retry, the engine does not.
    Transient,
    /// Malformed request, auth failure, or anything else retrying cannot fix.
    Fatal,
}

pub fn classify(err: &ClientError) -> ErrorClass {
    match err {
        ClientError::Api { code, .. } => match *code {
            404 => ErrorClass::NotFound,
            409 => ErrorClass::Conflict,
            400 | 422 => ErrorClass::Rejected,
            408 | 429 => ErrorClass::Transient,
            500..=599 => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        },
        ClientError::Transport(_) => ErrorClass::Transient,
        ClientError::Decode(_) | ClientError::Config(_) => ErrorClass::Fatal,
    }
}

/// Errors returned by the apply/wait/delete operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation: {0}")]
    ValidationRejected(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("timed out; unsatisfied: {}", unsatisfied.join(", "))]
    TimedOut { unsatisfied: Vec<String> },
}

impl EngineError {
    /// Wrap a client failure, prefixing the operation for context.
    pub fn from_client(op: &str, err: ClientError) -> Self {
        let msg = format!("{op}: {err}");
        match classify(&err) {
            ErrorClass::NotFound => EngineError::NotFound(msg),
            ErrorClass::Conflict => EngineError::Conflict(msg),
            ErrorClass::Rejected => EngineError::ValidationRejected(msg),
            ErrorClass::Transient => EngineError::Transient(msg),
            ErrorClass::Fatal => EngineError::Fatal(msg),
        }
    }

    /// Whether a caller-level retry could help. The engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_api_statuses() {
        assert_eq!(classify(&ClientError::not_found("x")), ErrorClass::NotFound);
        assert_eq!(classify(&ClientError::conflict("x")), ErrorClass::Conflict);
        assert_eq!(classify(&ClientError::api(422, "Invalid", "spec.replicas: must be >= 0")), ErrorClass::Rejected);
        assert_eq!(classify(&ClientError::api(400, "BadRequest", "x")), ErrorClass::Rejected);
        assert_eq!(classify(&ClientError::api(401, "Unauthorized", "x")), ErrorClass::Fatal);
        assert_eq!(classify(&ClientError::api(403, "Forbidden", "x")), ErrorClass::Fatal);
        assert_eq!(classify(&ClientError::api(429, "TooManyRequests", "x")), ErrorClass::Transient);
        assert_eq!(classify(&ClientError::api(503, "ServiceUnavailable", "x")), ErrorClass::Transient);
        assert_eq!(classify(&ClientError::api(504, "Timeout", "x")), ErrorClass::Transient);
    }

    #[test]
    fn classifies_non_api_failures() {
        assert_eq!(classify(&ClientError::Transport("connection refused".into())), ErrorClass::Transient);
        assert_eq!(classify(&ClientError::Decode("eof".into())), ErrorClass::Fatal);
        assert_eq!(classify(&ClientError::Config("no kubeconfig".into())), ErrorClass::Fatal);
    }

    #[test]
    fn engine_error_keeps_operation_context() {
        let e = EngineError::from_client("apply", ClientError::conflict("spec.replicas owned by kubectl"));
        assert!(matches!(e, EngineError::Conflict(_)));
        assert!(e.to_string().contains("apply:"), "{}", e);
        assert!(e.to_string().contains("spec.replicas"), "{}", e);
        assert!(!e.is_retryable());
        assert!(EngineError::from_client("get", ClientError::Transport("reset".into())).is_retryable());
    }
}
