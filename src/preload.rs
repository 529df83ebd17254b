//! Reads started before any query exists.
//!
//! A host can kick off a request as early as it knows the URL (for example
//! while routing) and hand the in-flight response to a query later with
//! [`Client::query_preloaded`]. The query then settles from that response
//! instead of fetching again.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use crate::client::Client;
use crate::error::FetchError;
use crate::executor::SharedResponse;
use crate::key::derive_key;
use crate::options::{Overrides, RequestOptions};
use crate::query::read_request;

/// A read that is already in flight.
///
/// Clones share the same response.
#[derive(Clone)]
pub struct Preloaded {
    path: String,
    url: String,
    fetch_options: Option<RequestOptions>,
    key: String,
    response: SharedResponse,
}

impl Preloaded {
    pub(crate) fn start(client: &Client, path: String, fetch_options: Option<RequestOptions>) -> Self {
        let (url, options) = read_request(
            client,
            &path,
            None,
            fetch_options.as_ref(),
            &Overrides::default(),
        );
        let key = derive_key(&url, &options);
        debug!(%key, "preloading");
        let response = client.execute_request(&url, &options).shared();
        Self {
            path,
            url,
            fetch_options,
            key,
            response,
        }
    }

    /// Returns the path this read was started for.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the absolute URL that was requested.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn fetch_options(&self) -> Option<&RequestOptions> {
        self.fetch_options.as_ref()
    }

    /// Waits for the response.
    pub fn data(&self) -> BoxFuture<'static, Result<Value, FetchError>> {
        self.response.clone().boxed()
    }

    /// Returns the response if it has already settled.
    #[must_use]
    pub fn peek(&self) -> Option<Result<Value, FetchError>> {
        self.response.peek().cloned()
    }
}

impl std::fmt::Debug for Preloaded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Preloaded")
            .field("url", &self.url)
            .field("key", &self.key)
            .field("settled", &self.response.peek().is_some())
            .finish_non_exhaustive()
    }
}
