//! Read coordination: fetching, caching and automatic refetching.
//!
//! A [`Query`] binds one URL to the client's cache. Once activated it:
//!
//! 1. Shows cached data when its [`CachePolicy`] allows it
//! 2. Fetches when the policy and `auto_fetch` call for it
//! 3. Publishes successful responses to the cache under its domains
//! 4. Refetches by itself when one of those domains is invalidated
//! 5. Adopts newer data that other queries wrote for the same key
//!
//! Failures never surface as panics or errors from the query itself; they
//! land in [`FetchState::error`] while the previous data stays visible.
//!
//! # Example
//!
//! ```rust,no_run
//! use refetch::prelude::*;
//! use refetch::transport::mock::MockTransport;
//!
//! # async fn run() {
//! let client = Client::new(MockTransport::new());
//! let posts = client.query("/posts", QueryOptions::new(["posts"]));
//! posts.activate();
//!
//! let mut states = posts.subscribe();
//! let state = states.wait_for(|state| !state.fetching).await.unwrap().clone();
//! println!("{:?}", state.data);
//!
//! posts.deactivate();
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, trace};

use crate::cache::{CacheEntry, WatcherGuard};
use crate::client::Client;
use crate::error::FetchError;
use crate::key::derive_key;
use crate::options::{DEFAULT_METHOD, Overrides, RequestOptions, merge_onto};
use crate::preload::Preloaded;
use crate::state::FetchState;

/// How a query combines the shared cache with the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
    /// Show cached data; fetch on activation only when nothing fresh is
    /// cached; refetch on invalidation.
    #[default]
    CacheFirst,
    /// Never touch the network on its own; show whatever is cached.
    CacheOnly,
    /// Always fetch on activation; adopt cache updates once the first
    /// network response has landed.
    NetworkFirst,
    /// Always fetch; never read from or write to the shared cache.
    NetworkOnly,
}

impl CachePolicy {
    /// Returns `true` if the query may fetch on its own.
    #[must_use]
    pub const fn uses_network(self) -> bool {
        !matches!(self, Self::CacheOnly)
    }

    /// Returns `true` if the query reads from and writes to the cache.
    #[must_use]
    pub const fn uses_cache(self) -> bool {
        !matches!(self, Self::NetworkOnly)
    }

    const fn refetches_on_invalidation(self) -> bool {
        matches!(self, Self::CacheFirst | Self::NetworkFirst)
    }

    const fn adopts_cache(self, network_landed: bool) -> bool {
        match self {
            Self::CacheFirst | Self::CacheOnly => true,
            Self::NetworkFirst => network_landed,
            Self::NetworkOnly => false,
        }
    }
}

/// Post-processes data before it is exposed. The cache keeps the raw payload.
pub type ParseResponse = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Configuration of a single query.
#[derive(Clone)]
pub struct QueryOptions {
    /// Domains the cached response belongs to.
    pub domains: Vec<String>,
    pub cache_policy: CachePolicy,
    /// Fetch on activation when the policy allows it. Defaults to `true`.
    pub auto_fetch: bool,
    /// Overrides the client's base URL.
    pub base_url: Option<String>,
    /// Applied on top of the client's options.
    pub fetch_options: Option<RequestOptions>,
    pub parse_response: Option<ParseResponse>,
}

impl QueryOptions {
    /// Creates options for a query tagged with `domains`.
    pub fn new<I, D>(domains: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<String>,
    {
        Self {
            domains: domains.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_cache_policy(mut self, cache_policy: CachePolicy) -> Self {
        self.cache_policy = cache_policy;
        self
    }

    #[must_use]
    pub const fn with_auto_fetch(mut self, auto_fetch: bool) -> Self {
        self.auto_fetch = auto_fetch;
        self
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn with_fetch_options(mut self, fetch_options: RequestOptions) -> Self {
        self.fetch_options = Some(fetch_options);
        self
    }

    #[must_use]
    pub fn with_parse_response<F>(mut self, parse: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.parse_response = Some(Arc::new(parse));
        self
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            cache_policy: CachePolicy::default(),
            auto_fetch: true,
            base_url: None,
            fetch_options: None,
            parse_response: None,
        }
    }
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("domains", &self.domains)
            .field("cache_policy", &self.cache_policy)
            .field("auto_fetch", &self.auto_fetch)
            .field("base_url", &self.base_url)
            .field("fetch_options", &self.fetch_options)
            .field("parse_response", &self.parse_response.is_some())
            .finish()
    }
}

/// Builds the URL and options of a read.
///
/// Reads use `GET` unless the overrides ask for another method.
pub(crate) fn read_request(
    client: &Client,
    path: &str,
    base_url: Option<&str>,
    fetch_options: Option<&RequestOptions>,
    overrides: &Overrides,
) -> (String, RequestOptions) {
    let url = client.resolve_url(
        overrides.base_url.as_deref().or(base_url),
        overrides.url.as_deref().unwrap_or(path),
    );
    let mut options = merge_onto(
        &client.config().options_layer(),
        &overrides.layers_over(fetch_options),
    );
    options.method = Some(
        overrides
            .requested_method()
            .unwrap_or(DEFAULT_METHOD)
            .to_string(),
    );
    (url, options)
}

#[derive(Default)]
struct Tracking {
    active: bool,
    watcher: Option<WatcherGuard>,
    /// The cache entry last observed for our key.
    seen: Option<Arc<CacheEntry>>,
    /// Requests started by this query and not yet settled.
    pending: usize,
    network_landed: bool,
}

struct QueryInner {
    client: Client,
    path: String,
    key: String,
    options: QueryOptions,
    state: watch::Sender<FetchState>,
    tracking: Mutex<Tracking>,
}

impl QueryInner {
    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transform(&self, data: Value) -> Value {
        match &self.options.parse_response {
            Some(parse) => parse(data),
            None => data,
        }
    }

    fn fetches_on_activate(&self, entry: Option<&CacheEntry>) -> bool {
        let policy = self.options.cache_policy;
        if !self.options.auto_fetch || !policy.uses_network() {
            return false;
        }
        match policy {
            CachePolicy::CacheFirst => entry.is_none_or(|entry| entry.refetch),
            _ => true,
        }
    }

    fn request(&self, overrides: &Overrides) -> (String, RequestOptions) {
        read_request(
            &self.client,
            &self.path,
            self.options.base_url.as_deref(),
            self.options.fetch_options.as_ref(),
            overrides,
        )
    }

    /// Starts a request. The caller has already counted it in `pending`.
    fn spawn_fetch(inner: &Arc<Self>, overrides: &Overrides) -> JoinHandle<FetchState> {
        let (url, options) = inner.request(overrides);
        debug!(key = %inner.key, %url, method = options.method(), "query fetching");
        let response = inner.client.execute_request(&url, &options);
        Self::spawn_settle(inner, response)
    }

    fn spawn_settle(
        inner: &Arc<Self>,
        response: BoxFuture<'static, Result<Value, FetchError>>,
    ) -> JoinHandle<FetchState> {
        inner.state.send_if_modified(|state| !std::mem::replace(&mut state.fetching, true));
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let result = response.await;
            Self::settle(&inner, result)
        })
    }

    fn settle(inner: &Arc<Self>, result: Result<Value, FetchError>) -> FetchState {
        let policy = inner.options.cache_policy;
        if let Ok(data) = &result {
            if policy.uses_cache() {
                inner
                    .client
                    .add_response(inner.key.clone(), data.clone(), &inner.options.domains);
            }
        }

        let refetch = {
            let mut tracking = inner.tracking();
            tracking.pending = tracking.pending.saturating_sub(1);
            let mut refetch = false;
            let result = result.map(|data| {
                tracking.network_landed = true;
                if !policy.uses_cache() {
                    return data;
                }
                // Another thread may have replaced or invalidated the entry
                // since our write; the store's current entry wins.
                match inner.client.cache().get(&inner.key) {
                    Some(entry) => {
                        refetch = entry.refetch
                            && tracking.active
                            && policy.refetches_on_invalidation()
                            && tracking.pending == 0;
                        entry.data.clone()
                    }
                    None => data,
                }
            });
            if refetch {
                tracking.pending += 1;
            }
            let fetching = tracking.pending > 0;

            inner.state.send_modify(|state| {
                state.fetching = fetching;
                match result {
                    Ok(data) => {
                        state.data = Some(inner.transform(data));
                        state.error = None;
                    }
                    Err(e) => {
                        debug!(key = %inner.key, error = %e, "query failed");
                        state.error = Some(e);
                    }
                }
            });
            refetch
        };

        if refetch {
            debug!(key = %inner.key, "entry invalidated while settling, refetching");
            Self::spawn_fetch(inner, &Overrides::default());
        }
        inner.state.borrow().clone()
    }

    /// Reacts to a cache publish.
    ///
    /// Deliveries can lag behind the store, so the entry is read from the
    /// current snapshot while the tracking lock is held; concurrent
    /// deliveries therefore converge on the newest entry.
    fn on_cache(inner: &Arc<Self>) {
        let policy = inner.options.cache_policy;

        let refetch = {
            let mut tracking = inner.tracking();
            if !tracking.active {
                return;
            }
            let entry = inner.client.cache().get(&inner.key).cloned();
            let changed = match (&tracking.seen, &entry) {
                (Some(seen), Some(entry)) => !Arc::ptr_eq(seen, entry),
                (None, None) => false,
                _ => true,
            };
            if !changed {
                return;
            }
            tracking.seen.clone_from(&entry);

            match entry {
                Some(entry) if entry.refetch => {
                    let refetch =
                        policy.refetches_on_invalidation() && tracking.pending == 0;
                    if refetch {
                        tracking.pending += 1;
                    }
                    refetch
                }
                Some(entry) if policy.adopts_cache(tracking.network_landed) => {
                    trace!(key = %inner.key, "adopting cached data");
                    let data = inner.transform(entry.data.clone());
                    inner.state.send_modify(|state| state.data = Some(data));
                    false
                }
                _ => false,
            }
        };

        if refetch {
            debug!(key = %inner.key, "entry invalidated, refetching");
            Self::spawn_fetch(inner, &Overrides::default());
        }
    }
}

/// A read bound to one request key.
///
/// Clones share the same state. The query stops watching the cache when
/// deactivated or when the last clone is dropped; requests already issued
/// still settle and still write to the cache.
#[derive(Clone)]
pub struct Query {
    inner: Arc<QueryInner>,
}

impl Query {
    pub(crate) fn new(client: Client, path: String, options: QueryOptions) -> Self {
        let (url, request) = read_request(
            &client,
            &path,
            options.base_url.as_deref(),
            options.fetch_options.as_ref(),
            &Overrides::default(),
        );
        let key = derive_key(&url, &request);

        // Seed data is visible before activation, so a consumer can render
        // synchronously from a hydrated cache.
        let seeded = options
            .cache_policy
            .adopts_cache(false)
            .then(|| client.cache().get(&key).map(|entry| entry.data.clone()))
            .flatten();

        let (state, _) = watch::channel(FetchState::default());
        let inner = Arc::new(QueryInner {
            client,
            path,
            key,
            options,
            state,
            tracking: Mutex::new(Tracking::default()),
        });
        if let Some(data) = seeded {
            let data = inner.transform(data);
            inner.state.send_modify(|state| state.data = Some(data));
        }
        Self { inner }
    }

    pub(crate) fn from_preloaded(client: Client, preloaded: &Preloaded, options: QueryOptions) -> Self {
        let options = QueryOptions {
            auto_fetch: false,
            fetch_options: options
                .fetch_options
                .or_else(|| preloaded.fetch_options().cloned()),
            ..options
        };
        let query = Self::new(client, preloaded.path().to_string(), options);
        query.inner.tracking().pending += 1;
        QueryInner::spawn_settle(&query.inner, preloaded.data().boxed());
        query
    }

    /// Starts watching the cache and, if the policy calls for it, fetches.
    ///
    /// Activating an active query does nothing.
    ///
    /// # Panics
    ///
    /// Panics when a fetch is needed outside a Tokio runtime.
    pub fn activate(&self) {
        let inner = &self.inner;
        let policy = inner.options.cache_policy;

        let fetch = {
            let mut tracking = inner.tracking();
            if tracking.active {
                return;
            }
            tracking.active = true;

            // Register before reading the snapshot so no publish falls in
            // between; deliveries wait on the tracking lock until we are done.
            if policy.uses_cache() {
                let weak = Arc::downgrade(inner);
                tracking.watcher = Some(inner.client.add_cache_watcher(move |_| {
                    if let Some(inner) = weak.upgrade() {
                        QueryInner::on_cache(&inner);
                    }
                }));
            }
            let entry = inner.client.cache().get(&inner.key).cloned();
            if policy.uses_cache() {
                tracking.seen.clone_from(&entry);
            }

            let fetch = inner.fetches_on_activate(entry.as_deref());
            if fetch {
                tracking.pending += 1;
            }
            if let Some(entry) = entry.filter(|_| policy.adopts_cache(tracking.network_landed)) {
                let data = inner.transform(entry.data.clone());
                inner.state.send_modify(|state| state.data = Some(data));
            }
            fetch
        };

        debug!(key = %inner.key, ?policy, fetch, "query activated");
        if fetch {
            QueryInner::spawn_fetch(inner, &Overrides::default());
        }
    }

    /// Stops watching the cache. Pending requests are not aborted.
    pub fn deactivate(&self) {
        let watcher = {
            let mut tracking = self.inner.tracking();
            tracking.active = false;
            tracking.seen = None;
            tracking.watcher.take()
        };
        if let Some(watcher) = watcher {
            watcher.unsubscribe();
        }
        debug!(key = %self.inner.key, "query deactivated");
    }

    /// Fetches now, whatever the policy, applying `overrides` to this call
    /// only.
    ///
    /// The request is issued before this method returns; the returned future
    /// resolves to the state once it settles.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn refetch(&self, overrides: Overrides) -> BoxFuture<'static, FetchState> {
        self.inner.tracking().pending += 1;
        let task = QueryInner::spawn_fetch(&self.inner, &overrides);
        let inner = Arc::clone(&self.inner);
        async move { task.await.unwrap_or_else(|_| inner.state.borrow().clone()) }.boxed()
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> FetchState {
        self.inner.state.borrow().clone()
    }

    /// Returns a receiver notified on every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<FetchState> {
        self.inner.state.subscribe()
    }

    /// Returns the current state followed by every change.
    #[must_use]
    pub fn stream(&self) -> BoxStream<'static, FetchState> {
        WatchStream::new(self.subscribe()).boxed()
    }

    /// Returns the key this query caches under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.tracking().active
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.inner.key)
            .field("options", &self.inner.options)
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::config::ClientConfig;
    use crate::transport::mock::{MockReply, MockTransport};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn settled(query: &Query) -> FetchState {
        let mut rx = query.subscribe();
        let state = timeout(Duration::from_secs(1), rx.wait_for(|state| !state.fetching))
            .await
            .expect("query settles in time")
            .expect("state channel open")
            .clone();
        state
    }

    fn setup() -> (Client, MockTransport) {
        let mock = MockTransport::new();
        let client = Client::with_config(
            mock.clone(),
            ClientConfig::new()
                .with_base_url("http://api")
                .with_fetch_options(RequestOptions::new().with_header("x-app", "test")),
        );
        (client, mock)
    }

    #[test]
    fn test_cache_policy_serde() {
        let policy: CachePolicy = serde_json::from_str("\"network-first\"").expect("parses");
        assert_eq!(policy, CachePolicy::NetworkFirst);
        assert_eq!(
            serde_json::to_string(&CachePolicy::CacheOnly).expect("serializes"),
            "\"cache-only\""
        );
    }

    #[test]
    fn test_query_options_default() {
        let options = QueryOptions::new(["posts"]);
        assert_eq!(options.domains, vec!["posts".to_string()]);
        assert_eq!(options.cache_policy, CachePolicy::CacheFirst);
        assert!(options.auto_fetch);
        assert!(options.parse_response.is_none());
    }

    #[test]
    fn test_key_uses_absolute_url() {
        let (client, _) = setup();
        let query = client.query("/posts", QueryOptions::new(["posts"]));
        assert_eq!(query.key(), "http://api/posts");

        let other = client.query(
            "/posts",
            QueryOptions::new(["posts"]).with_base_url("http://other"),
        );
        assert_eq!(other.key(), "http://other/posts");
    }

    #[test]
    fn test_read_request_merges_layers() {
        let (client, _) = setup();
        let (url, options) = read_request(
            &client,
            "/posts",
            None,
            Some(&RequestOptions::new().with_header("x-query", "1")),
            &Overrides::new()
                .with_base_url("http://override")
                .with_fetch_options(RequestOptions::new().with_header("x-app", "override")),
        );

        assert_eq!(url, "http://override/posts");
        assert_eq!(options.method(), "GET");
        assert_eq!(options.headers.get("x-app").map(String::as_str), Some("override"));
        assert_eq!(options.headers.get("x-query").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_activation_fetches_and_publishes() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 200, json!([{ "id": 1 }]));

        let query = client.query("/posts", QueryOptions::new(["posts"]));
        assert!(!query.state().fetching);
        query.activate();
        assert!(query.state().fetching);

        let state = settled(&query).await;
        assert_eq!(state.data, Some(json!([{ "id": 1 }])));
        assert!(state.error.is_none());
        assert_eq!(client.in_flight(), 0);

        let calls = mock.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].options.method(), "GET");
        assert_eq!(calls[0].options.headers.get("x-app").map(String::as_str), Some("test"));

        let entry = client.cache().get("http://api/posts").cloned().expect("cached");
        assert_eq!(entry.domains, vec!["posts".to_string()]);
        assert!(!entry.refetch);
    }

    #[tokio::test]
    async fn test_activate_twice_fetches_once() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 200, json!([]));

        let query = client.query("/posts", QueryOptions::new(["posts"]));
        query.activate();
        query.activate();
        settled(&query).await;

        assert_eq!(mock.call_count(), 1);
        assert!(query.is_active());
    }

    #[tokio::test]
    async fn test_cache_first_skips_fetch_when_cached() {
        let (client, mock) = setup();
        client.add_response("http://api/posts", json!(["cached"]), ["posts"]);

        let query = client.query("/posts", QueryOptions::new(["posts"]));
        assert_eq!(query.state().data, Some(json!(["cached"])));
        query.activate();

        assert!(!query.state().fetching);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cache_first_fetches_stale_seed() {
        let mock = MockTransport::new();
        mock.respond("/posts", 200, json!(["fresh"]));
        let seed = Cache::new().with_entry(
            "/posts",
            CacheEntry {
                data: json!(["seed"]),
                domains: vec!["posts".into()],
                refetch: true,
            },
        );
        let client = Client::with_config(mock.clone(), ClientConfig::new().with_initial_cache(seed));

        let query = client.query("/posts", QueryOptions::new(["posts"]));
        assert_eq!(query.state().data, Some(json!(["seed"])));
        query.activate();

        let state = settled(&query).await;
        assert_eq!(state.data, Some(json!(["fresh"])));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_auto_fetch_disabled() {
        let (client, mock) = setup();
        let query = client.query("/posts", QueryOptions::new(["posts"]).with_auto_fetch(false));
        query.activate();
        tokio::task::yield_now().await;

        assert_eq!(mock.call_count(), 0);
        assert!(!query.state().fetching);
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_data() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 200, json!(["first"]));

        let query = client.query("/posts", QueryOptions::new(["posts"]));
        query.activate();
        settled(&query).await;

        mock.respond_once(
            "http://api/posts",
            MockReply::Json {
                status: 500,
                body: json!({ "message": "down" }),
            },
        );
        let state = query.refetch(Overrides::default()).await;

        assert!(!state.fetching);
        assert_eq!(state.data, Some(json!(["first"])));
        let error = state.error.expect("error recorded");
        assert_eq!(error.body(), Some(&json!({ "message": "down" })));
        // The cache still holds the last good response.
        assert_eq!(
            client.cache().get("http://api/posts").expect("cached").data,
            json!(["first"])
        );
    }

    #[tokio::test]
    async fn test_success_clears_previous_error() {
        let (client, mock) = setup();
        mock.respond_once("http://api/posts", MockReply::Fail("offline".to_string()));
        mock.respond("http://api/posts", 200, json!([]));

        let query = client.query("/posts", QueryOptions::new(["posts"]));
        query.activate();
        assert!(settled(&query).await.error.is_some());

        let state = query.refetch(Overrides::default()).await;
        assert!(state.error.is_none());
        assert_eq!(state.data, Some(json!([])));
    }

    #[tokio::test]
    async fn test_invalidation_triggers_one_refetch() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 200, json!(["v1"]));

        let query = client.query("/posts", QueryOptions::new(["posts"]));
        query.activate();
        settled(&query).await;

        mock.respond("http://api/posts", 200, json!(["v2"]));
        client.clear_domains(["posts"]);
        assert!(query.state().fetching);
        // A second invalidation while fetching does not stack another call.
        client.clear_domains(["posts"]);

        let state = settled(&query).await;
        assert_eq!(state.data, Some(json!(["v2"])));
        assert_eq!(mock.call_count(), 2);
        assert!(!client.cache().get(query.key()).expect("cached").refetch);
    }

    #[tokio::test]
    async fn test_unrelated_invalidation_is_ignored() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 200, json!([]));

        let query = client.query("/posts", QueryOptions::new(["posts"]));
        query.activate();
        settled(&query).await;

        client.clear_domains(["users"]);
        tokio::task::yield_now().await;

        assert!(!query.state().fetching);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_refetch_does_not_loop() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 200, json!([]));

        let query = client.query("/posts", QueryOptions::new(["posts"]));
        query.activate();
        settled(&query).await;

        mock.fail("http://api/posts", "offline");
        client.clear_domains(["posts"]);
        let state = settled(&query).await;
        assert!(state.error.is_some());

        // Unrelated cache traffic must not retry the failed refetch.
        client.add_response("other", json!(1), ["users"]);
        tokio::task::yield_now().await;
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_cache_first_adopts_data_from_peers() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 200, json!(["network"]));

        let query = client.query("/posts", QueryOptions::new(["posts"]));
        query.activate();
        settled(&query).await;

        client.add_response("http://api/posts", json!(["peer"]), ["posts"]);
        assert_eq!(query.state().data, Some(json!(["peer"])));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_network_first_waits_for_network_before_adopting() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 200, json!(["network"]));
        mock.hold();
        client.add_response("http://api/posts", json!(["stale"]), ["posts"]);

        let query = client.query(
            "/posts",
            QueryOptions::new(["posts"]).with_cache_policy(CachePolicy::NetworkFirst),
        );
        assert_eq!(query.state().data, None);
        query.activate();
        assert_eq!(mock.call_count(), 1);

        client.add_response("http://api/posts", json!(["peer"]), ["posts"]);
        assert_eq!(query.state().data, None);

        mock.release();
        assert_eq!(settled(&query).await.data, Some(json!(["network"])));

        client.add_response("http://api/posts", json!(["later"]), ["posts"]);
        assert_eq!(query.state().data, Some(json!(["later"])));
    }

    #[tokio::test]
    async fn test_cache_only_never_fetches() {
        let (client, mock) = setup();
        let query = client.query(
            "/posts",
            QueryOptions::new(["posts"]).with_cache_policy(CachePolicy::CacheOnly),
        );
        query.activate();
        assert_eq!(query.state().data, None);

        client.add_response("http://api/posts", json!(["cached"]), ["posts"]);
        assert_eq!(query.state().data, Some(json!(["cached"])));

        client.clear_domains(["posts"]);
        tokio::task::yield_now().await;

        assert!(!query.state().fetching);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_network_only_is_isolated() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 200, json!(["network"]));
        client.add_response("http://api/posts", json!(["cached"]), ["posts"]);
        let before = client.cache();

        let query = client.query(
            "/posts",
            QueryOptions::new(["posts"]).with_cache_policy(CachePolicy::NetworkOnly),
        );
        assert_eq!(query.state().data, None);
        query.activate();
        assert_eq!(settled(&query).await.data, Some(json!(["network"])));

        // Nothing was written.
        assert!(Arc::ptr_eq(&before, &client.cache()));

        client.add_response("http://api/posts", json!(["peer"]), ["posts"]);
        client.clear_domains(["posts"]);
        tokio::task::yield_now().await;

        assert_eq!(query.state().data, Some(json!(["network"])));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_manual_refetch_ignores_policy_and_applies_overrides() {
        let (client, mock) = setup();
        mock.respond("http://override/posts/2", 200, json!({ "id": 2 }));

        let query = client.query(
            "/posts",
            QueryOptions::new(["posts"]).with_cache_policy(CachePolicy::CacheOnly),
        );
        query.activate();

        let state = query
            .refetch(
                Overrides::new()
                    .with_base_url("http://override")
                    .with_url("/posts/2")
                    .with_method("HEAD")
                    .with_fetch_options(RequestOptions::new().with_header("some-header", "v")),
            )
            .await;
        assert_eq!(state.data, Some(json!({ "id": 2 })));

        let call = &mock.calls()[0];
        assert_eq!(call.url, "http://override/posts/2");
        assert_eq!(call.options.method(), "HEAD");
        assert_eq!(call.options.headers.get("some-header").map(String::as_str), Some("v"));
        assert_eq!(call.options.headers.get("x-app").map(String::as_str), Some("test"));

        // Overrides are one-shot.
        mock.respond("http://api/posts", 200, json!([]));
        query.refetch(Overrides::default()).await;
        assert_eq!(mock.calls()[1].url, "http://api/posts");
        assert_eq!(mock.calls()[1].options.method(), "GET");
    }

    #[tokio::test]
    async fn test_parse_response_is_not_cached() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 200, json!([1, 2, 3]));

        let query = client.query(
            "/posts",
            QueryOptions::new(["posts"]).with_parse_response(|data| {
                json!(data.as_array().map_or(0, Vec::len))
            }),
        );
        query.activate();

        assert_eq!(settled(&query).await.data, Some(json!(3)));
        assert_eq!(
            client.cache().get("http://api/posts").expect("cached").data,
            json!([1, 2, 3])
        );

        client.add_response("http://api/posts", json!([1]), ["posts"]);
        assert_eq!(query.state().data, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_deactivated_query_ignores_invalidation() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 200, json!([]));

        let query = client.query("/posts", QueryOptions::new(["posts"]));
        query.activate();
        settled(&query).await;
        query.deactivate();
        assert!(!query.is_active());

        client.clear_domains(["posts"]);
        tokio::task::yield_now().await;
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_deactivation_does_not_abort_pending_write() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 200, json!(["late"]));
        mock.hold();

        let query = client.query("/posts", QueryOptions::new(["posts"]));
        query.activate();
        query.deactivate();
        mock.release();

        assert_eq!(settled(&query).await.data, Some(json!(["late"])));
        assert_eq!(
            client.cache().get("http://api/posts").expect("written").data,
            json!(["late"])
        );
    }

    #[tokio::test]
    async fn test_stream_yields_current_state_first() {
        let (client, _) = setup();
        client.add_response("http://api/posts", json!(["cached"]), ["posts"]);
        let query = client.query("/posts", QueryOptions::new(["posts"]));

        let first = query.stream().next().await.expect("initial state");
        assert_eq!(first.data, Some(json!(["cached"])));
    }
}
