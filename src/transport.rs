//! The network-facing collaborator.
//!
//! The core never talks to the network itself. Every call goes through a
//! [`Transport`], which performs one request/response exchange and reports
//! the raw status and body. Any HTTP client can be plugged in; closures
//! returning a boxed future implement the trait directly.

#[cfg(feature = "reqwest")]
pub mod http;
pub mod mock;

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::error::FetchError;
use crate::options::RequestOptions;

/// A failure to complete the exchange at all (DNS, connection, I/O).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<TransportError> for FetchError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.0)
    }
}

/// The raw result of a transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    #[must_use]
    pub const fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    /// Creates a response whose body is the serialized `value`.
    #[must_use]
    pub fn json(status: u16, value: &Value) -> Self {
        Self::new(status, value.to_string().into_bytes())
    }

    /// Returns `true` for 2xx statuses.
    #[must_use]
    pub const fn ok(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Parses the body as JSON, falling back to the body text as a string.
    #[must_use]
    pub fn parse_body(&self) -> Value {
        serde_json::from_slice(&self.body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&self.body).into_owned()))
    }
}

/// Performs a single request/response exchange.
///
/// The returned future must be `'static`: the executor drives it on a
/// spawned task so that it settles even when every caller has lost
/// interest.
pub trait Transport: Send + Sync + 'static {
    fn call(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> BoxFuture<'static, Result<RawResponse, TransportError>>;
}

impl<F> Transport for F
where
    F: Fn(&str, &RequestOptions) -> BoxFuture<'static, Result<RawResponse, TransportError>>
        + Send
        + Sync
        + 'static,
{
    fn call(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> BoxFuture<'static, Result<RawResponse, TransportError>> {
        self(url, options)
    }
}
