//! Error types shared by the executor and the coordinators.

use serde_json::Value;
use thiserror::Error;

/// Errors raised while building a request configuration.
///
/// These are programming errors on the caller's side and are not retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one options layer is required to merge request options")]
    NoOptionLayers,

    #[error("invalid cache payload: {0}")]
    InvalidCache(String),
}

/// Error type for fetch operations.
///
/// The error is `Clone` because a single in-flight read is shared by every
/// caller waiting on the same key.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// The server answered with a non-success status.
    ///
    /// `body` is the payload the server reported: parsed JSON when possible,
    /// otherwise the raw body text as a JSON string.
    #[error("request failed with status {status}: {body}")]
    Response { status: u16, body: Value },

    /// The transport could not complete the exchange.
    #[error("transport error: {0}")]
    Transport(String),

    /// The task driving the request panicked or was cancelled.
    #[error("request interrupted: {0}")]
    Interrupted(String),

    /// The payload did not match the requested type.
    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl FetchError {
    /// Returns the server-reported payload for status failures.
    #[must_use]
    pub const fn body(&self) -> Option<&Value> {
        match self {
            Self::Response { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Returns the HTTP status for status failures.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Response { status, .. } => Some(*status),
            _ => None,
        }
    }
}
