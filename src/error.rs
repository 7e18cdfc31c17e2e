//! Error types for the Matrixon test harness
//!
//! Every failure a harness call can hit is represented here. All variants are
//! fatal for the operation that produced them: the harness never retries on
//! its own, so a returned error describes the first and only attempt.

use std::time::Duration;

use ruma::OwnedUserId;
use thiserror::Error;

/// Test harness error types
#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure (connection refused, DNS, request timeout)
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-2xx status on an endpoint that must succeed
    #[error("{method} {url} returned non-2xx code: {status} - body: {body}")]
    Status {
        method: reqwest::Method,
        url: String,
        status: reqwest::StatusCode,
        body: String,
    },

    /// Response body is not syntactically valid JSON
    #[error("Malformed response body: {0}")]
    Json(#[from] serde_json::Error),

    /// A required key is absent from a response body
    #[error("key '{key}' missing from {body}")]
    MissingField { key: String, body: String },

    /// A key is present but does not have the required shape
    #[error("key '{key}' is not a {expected}, body: {body}")]
    WrongFieldType {
        key: String,
        expected: &'static str,
        body: String,
    },

    /// A Matrix identifier in a response failed to parse
    #[error("Invalid Matrix identifier: {0}")]
    Identifier(#[from] ruma::IdParseError),

    /// The configured homeserver base URL is unusable
    #[error("invalid base URL: {0}")]
    BaseUrl(String),

    /// A content reference handed to download is not a usable mxc:// URI
    #[error("invalid mxc URI: {uri}")]
    BadMxcUri { uri: String },

    /// The convergence loop ran out of wall-clock budget.
    ///
    /// `failures` aggregates the full failure history of every check that was
    /// still pending when the budget elapsed, one timestamped line per
    /// rejected response.
    #[error("{user_id} sync_until timed out after {elapsed:?}. Seen {responses} /sync responses. {failures}")]
    SyncTimeout {
        user_id: OwnedUserId,
        elapsed: Duration,
        responses: usize,
        failures: String,
    },
}

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, Error>;
