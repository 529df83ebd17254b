//! The client owning one cache and one in-flight table.
//!
//! Every [`Query`] and [`Mutation`] is created from a [`Client`] and holds a
//! clone of it. Clones share state; separate clients are fully independent,
//! which is what tests and multi-tenant hosts want.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::cache::{Cache, CacheStore, WatcherGuard};
use crate::config::ClientConfig;
use crate::error::FetchError;
use crate::executor::RequestExecutor;
use crate::mutation::{Mutation, MutationOptions};
use crate::options::RequestOptions;
use crate::preload::Preloaded;
use crate::query::{Query, QueryOptions};
use crate::transport::Transport;

#[derive(Debug)]
struct ClientInner {
    config: ClientConfig,
    store: CacheStore,
    executor: RequestExecutor,
}

/// Shared cache, request execution and configuration.
///
/// # Example
///
/// ```
/// use refetch::client::Client;
/// use refetch::config::ClientConfig;
/// use refetch::transport::mock::MockTransport;
/// use serde_json::json;
///
/// let client = Client::with_config(
///     MockTransport::new(),
///     ClientConfig::new().with_base_url("https://api.example.com"),
/// );
///
/// client.add_response("https://api.example.com/posts", json!([]), ["posts"]);
/// client.clear_domains(["posts"]);
///
/// let cache = client.cache();
/// assert!(cache.get("https://api.example.com/posts").unwrap().refetch);
/// ```
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Creates a client with default configuration.
    pub fn new(transport: impl Transport) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    /// Creates a client with the given configuration.
    ///
    /// The cache starts from `config.initial_cache` when present.
    pub fn with_config(transport: impl Transport, config: ClientConfig) -> Self {
        let store = config
            .initial_cache
            .clone()
            .map_or_else(CacheStore::new, CacheStore::with_initial);
        Self {
            inner: Arc::new(ClientInner {
                config,
                store,
                executor: RequestExecutor::new(transport),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Returns the current cache snapshot.
    #[must_use]
    pub fn cache(&self) -> Arc<Cache> {
        self.inner.store.cache()
    }

    /// Registers `callback` to receive every new cache snapshot.
    #[must_use = "dropping the guard unsubscribes the watcher immediately"]
    pub fn add_cache_watcher<F>(&self, callback: F) -> WatcherGuard
    where
        F: Fn(&Arc<Cache>) + Send + Sync + 'static,
    {
        self.inner.store.add_cache_watcher(callback)
    }

    /// Stores `data` under `key`, tagged with `domains`.
    pub fn add_response<I, D>(&self, key: impl Into<String>, data: Value, domains: I)
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        self.inner.store.add_response(key, data, domains);
    }

    /// Flags every entry tagged with any of `domains` for refetch.
    pub fn clear_domains<I, D>(&self, domains: I)
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        self.inner.store.clear_domains(domains);
    }

    /// Issues a request through the deduplicating executor.
    ///
    /// See [`RequestExecutor::execute`].
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn execute_request(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> BoxFuture<'static, Result<Value, FetchError>> {
        self.inner.executor.execute(url, options)
    }

    /// Issues a request and decodes the payload into `T`.
    ///
    /// # Errors
    ///
    /// Fails like [`Client::execute_request`], or with
    /// [`FetchError::Decode`] when the payload does not match `T`.
    pub fn execute_request_as<T>(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> BoxFuture<'static, Result<T, FetchError>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.execute_request(url, options)
            .map(|result| {
                result.and_then(|data| {
                    serde_json::from_value(data).map_err(|e| FetchError::Decode(e.to_string()))
                })
            })
            .boxed()
    }

    /// Creates a query for `url`. Call [`Query::activate`] to start it.
    #[must_use]
    pub fn query(&self, url: impl Into<String>, options: QueryOptions) -> Query {
        Query::new(self.clone(), url.into(), options)
    }

    /// Starts a `GET` for `url` right away, before any query exists.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn preload(&self, url: impl Into<String>, fetch_options: Option<RequestOptions>) -> Preloaded {
        Preloaded::start(self, url.into(), fetch_options)
    }

    /// Creates a query whose first result is the preloaded one.
    #[must_use]
    pub fn query_preloaded(&self, preloaded: &Preloaded, options: QueryOptions) -> Query {
        Query::from_preloaded(self.clone(), preloaded, options)
    }

    /// Creates a mutation for `url`.
    #[must_use]
    pub fn mutation(&self, url: impl Into<String>, options: MutationOptions) -> Mutation {
        Mutation::new(self.clone(), url.into(), options)
    }

    /// Prefixes `path` with the first base URL found: `base_url`, then the
    /// configured one.
    pub(crate) fn resolve_url(&self, base_url: Option<&str>, path: &str) -> String {
        let base = base_url
            .or(self.inner.config.base_url.as_deref())
            .unwrap_or_default();
        format!("{base}{path}")
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.inner.executor.in_flight()
    }
}
