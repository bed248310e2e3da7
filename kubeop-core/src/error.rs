use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A `Status` failure returned by the API server, either as a response body
/// or inside a watch [`Error`](crate::WatchEvent::Error) event.
#[derive(Error, Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
#[error("{message}: {reason}")]
pub struct ErrorResponse {
    /// The status
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    pub code: u16,
}

impl ErrorResponse {
    /// Whether the watch position has expired and a fresh list is required
    #[must_use]
    pub fn is_gone(&self) -> bool {
        self.code == 410 || self.reason == "Expired" || self.reason == "Gone"
    }

    /// Whether a write lost an optimistic concurrency race
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.code == 409
    }

    /// Whether the addressed object does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code == 404
    }
}
