//! Error types for the client boundary.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A structured error status returned by the control plane.
#[derive(Error, Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
#[error("{message} ({reason})")]
pub struct ErrorResponse {
    /// The status, usually `Failure`
    pub status: String,
    /// Human-readable description
    #[serde(default)]
    pub message: String,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,
    /// HTTP status code
    pub code: u16,
}

/// Errors a [`ResourceClient`](crate::client::ResourceClient) call can fail with.
///
/// The runtime dispatches on behavior: [`Error::Gone`] and transport loss
/// during a watch force a relist, [`Error::is_transient`] marks the cases
/// worth retrying with backoff.
#[derive(Error, Debug)]
pub enum Error {
    /// The named object does not exist
    #[error("object not found")]
    NotFound,

    /// Write rejected because the provided resource version is stale
    #[error("resource version conflict")]
    Conflict,

    /// Create rejected because the object already exists
    #[error("object already exists")]
    AlreadyExists,

    /// The caller is not permitted to perform this operation
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The server gave up on the request
    #[error("server timeout")]
    ServerTimeout,

    /// The requested watch resume point has expired; a full relist is required
    #[error("watch resume point expired")]
    Gone,

    /// Any other structured rejection from the server
    #[error("api error: {0}")]
    Api(#[source] ErrorResponse),

    /// The connection failed or was interrupted
    #[error("transport failure: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A payload could not be serialized or deserialized
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an arbitrary transport-level failure
    pub fn transport<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Error::Transport(Box::new(err))
    }

    /// Classify a structured server rejection by its status code
    pub fn from_response(resp: ErrorResponse) -> Self {
        match resp.code {
            403 => Error::Forbidden(resp.message),
            404 => Error::NotFound,
            409 if resp.reason == "AlreadyExists" => Error::AlreadyExists,
            409 => Error::Conflict,
            410 => Error::Gone,
            504 => Error::ServerTimeout,
            _ => Error::Api(resp),
        }
    }

    /// Whether retrying the same call later can reasonably succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Conflict | Error::ServerTimeout | Error::Transport(_) | Error::Gone
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(code: u16, reason: &str) -> ErrorResponse {
        ErrorResponse {
            status: "Failure".into(),
            message: "nope".into(),
            reason: reason.into(),
            code,
        }
    }

    #[test]
    fn classifies_by_status_code() {
        assert!(matches!(Error::from_response(resp(404, "NotFound")), Error::NotFound));
        assert!(matches!(Error::from_response(resp(409, "Conflict")), Error::Conflict));
        assert!(matches!(
            Error::from_response(resp(409, "AlreadyExists")),
            Error::AlreadyExists
        ));
        assert!(matches!(Error::from_response(resp(410, "Expired")), Error::Gone));
        assert!(matches!(Error::from_response(resp(500, "Internal")), Error::Api(_)));
    }

    #[test]
    fn transience_tracks_behavior_not_shape() {
        assert!(Error::Conflict.is_transient());
        assert!(Error::Gone.is_transient());
        assert!(!Error::NotFound.is_transient());
        assert!(!Error::from_response(resp(500, "Internal")).is_transient());
    }
}
