//! Write coordination.
//!
//! A [`Mutation`] sends a write and, once the server accepts it, invalidates
//! every cache domain it touches. Active queries in those domains then
//! refetch on their own.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::client::Client;
use crate::error::FetchError;
use crate::options::{Overrides, RequestOptions, merge_onto};
use crate::state::FetchState;

/// The method used by mutations that set none.
pub const DEFAULT_MUTATION_METHOD: &str = "POST";

/// Configuration of a single mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationOptions {
    /// Domains invalidated after every successful call.
    pub domains: Vec<String>,
    /// Overrides the client's base URL.
    pub base_url: Option<String>,
    /// Applied on top of the client's options.
    pub fetch_options: Option<RequestOptions>,
}

impl MutationOptions {
    /// Creates options for a mutation invalidating `domains`.
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
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn with_fetch_options(mut self, fetch_options: RequestOptions) -> Self {
        self.fetch_options = Some(fetch_options);
        self
    }
}

struct MutationInner {
    client: Client,
    path: String,
    options: MutationOptions,
    state: watch::Sender<FetchState>,
    /// Calls issued and not yet settled.
    pending: AtomicUsize,
}

impl MutationInner {
    fn request(&self, overrides: &Overrides) -> (String, RequestOptions) {
        let url = self.client.resolve_url(
            overrides
                .base_url
                .as_deref()
                .or(self.options.base_url.as_deref()),
            overrides.url.as_deref().unwrap_or(&self.path),
        );
        let mut options = merge_onto(
            &self.client.config().options_layer(),
            &overrides.layers_over(self.options.fetch_options.as_ref()),
        );
        let method = overrides
            .method
            .clone()
            .or_else(|| options.method.take())
            .unwrap_or_else(|| DEFAULT_MUTATION_METHOD.to_string());
        options.method = Some(method);
        (url, options)
    }

    fn settle(&self, result: &Result<Value, FetchError>) {
        if result.is_ok() {
            self.client.clear_domains(&self.options.domains);
        }
        let fetching = self.pending.fetch_sub(1, Ordering::SeqCst) > 1;
        self.state.send_modify(|state| {
            state.fetching = fetching;
            match result {
                Ok(data) => {
                    state.data = Some(data.clone());
                    state.error = None;
                }
                Err(e) => {
                    debug!(path = %self.path, error = %e, "mutation failed");
                    state.error = Some(e.clone());
                }
            }
        });
    }
}

/// A write bound to one URL.
///
/// Clones share the same state.
///
/// # Example
///
/// ```rust,no_run
/// use refetch::prelude::*;
/// use refetch::transport::mock::MockTransport;
///
/// # async fn run() -> Result<(), FetchError> {
/// let client = Client::new(MockTransport::new());
/// let create = client.mutation(
///     "/posts",
///     MutationOptions::new(["posts"])
///         .with_fetch_options(RequestOptions::new().with_body(r#"{"title":"hi"}"#)),
/// );
///
/// let created = create.invoke(Overrides::default()).await?;
/// println!("{created}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Mutation {
    inner: Arc<MutationInner>,
}

impl Mutation {
    pub(crate) fn new(client: Client, path: String, options: MutationOptions) -> Self {
        let (state, _) = watch::channel(FetchState::default());
        Self {
            inner: Arc::new(MutationInner {
                client,
                path,
                options,
                state,
                pending: AtomicUsize::new(0),
            }),
        }
    }

    /// Sends the write, applying `overrides` to this call only.
    ///
    /// The method is the override's, else the configured one, else `POST`.
    /// Writes are never deduplicated. On success the mutation's domains are
    /// invalidated before the returned future resolves; the write also
    /// completes when the future is dropped.
    ///
    /// # Errors
    ///
    /// Resolves to the failure also recorded in [`FetchState::error`].
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn invoke(&self, overrides: Overrides) -> BoxFuture<'static, Result<Value, FetchError>> {
        let inner = Arc::clone(&self.inner);
        let (url, options) = inner.request(&overrides);
        debug!(%url, method = options.method(), "mutation sending");

        inner.pending.fetch_add(1, Ordering::SeqCst);
        inner
            .state
            .send_if_modified(|state| !std::mem::replace(&mut state.fetching, true));

        let response = inner.client.execute_request(&url, &options);
        let task = tokio::spawn(async move {
            let result = response.await;
            inner.settle(&result);
            result
        });
        async move {
            task.await
                .unwrap_or_else(|e| Err(FetchError::Interrupted(e.to_string())))
        }
        .boxed()
    }

    /// Clears `data` and `error`. `fetching` keeps reflecting pending calls.
    pub fn reset(&self) {
        self.inner.state.send_modify(|state| {
            state.data = None;
            state.error = None;
        });
    }

    #[must_use]
    pub fn state(&self) -> FetchState {
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<FetchState> {
        self.inner.state.subscribe()
    }

    /// Returns the current state followed by every change.
    #[must_use]
    pub fn stream(&self) -> BoxStream<'static, FetchState> {
        WatchStream::new(self.subscribe()).boxed()
    }
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("path", &self.inner.path)
            .field("options", &self.inner.options)
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::mock::{MockReply, MockTransport};
    use serde_json::json;

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

    #[tokio::test]
    async fn test_invoke_defaults_to_post() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 201, json!({ "id": 7 }));
        let mutation = client.mutation(
            "/posts",
            MutationOptions::new(["posts"])
                .with_fetch_options(RequestOptions::new().with_body("{\"title\":\"t\"}")),
        );

        let created = mutation.invoke(Overrides::default()).await;
        assert_eq!(created, Ok(json!({ "id": 7 })));

        let call = &mock.calls()[0];
        assert_eq!(call.options.method(), "POST");
        assert_eq!(call.options.body.as_deref(), Some("{\"title\":\"t\"}"));
        assert_eq!(call.options.headers.get("x-app").map(String::as_str), Some("test"));

        let state = mutation.state();
        assert!(!state.fetching);
        assert_eq!(state.data, Some(json!({ "id": 7 })));
    }

    #[tokio::test]
    async fn test_configured_and_override_methods() {
        let (client, mock) = setup();
        mock.respond("http://api/posts/1", 200, json!({}));
        let mutation = client.mutation(
            "/posts/1",
            MutationOptions::new(["posts"])
                .with_fetch_options(RequestOptions::new().with_method("PUT")),
        );

        mutation.invoke(Overrides::default()).await.expect("put succeeds");
        mutation
            .invoke(Overrides::new().with_method("DELETE"))
            .await
            .expect("delete succeeds");

        let methods: Vec<String> = mock
            .calls()
            .iter()
            .map(|call| call.options.method().to_string())
            .collect();
        assert_eq!(methods, ["PUT", "DELETE"]);
    }

    #[tokio::test]
    async fn test_success_invalidates_domains_before_resolving() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 201, json!({}));
        client.add_response("http://api/posts", json!([]), ["posts"]);
        client.add_response("http://api/users", json!([]), ["users"]);

        let mutation = client.mutation("/posts", MutationOptions::new(["posts"]));
        mutation.invoke(Overrides::default()).await.expect("succeeds");

        let cache = client.cache();
        assert!(cache.get("http://api/posts").expect("cached").refetch);
        assert!(!cache.get("http://api/users").expect("cached").refetch);
    }

    #[tokio::test]
    async fn test_failure_leaves_cache_untouched() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 422, json!({ "field": "title" }));
        client.add_response("http://api/posts", json!([]), ["posts"]);
        let before = client.cache();

        let mutation = client.mutation("/posts", MutationOptions::new(["posts"]));
        let err = mutation
            .invoke(Overrides::default())
            .await
            .expect_err("rejected");

        assert_eq!(err.status(), Some(422));
        assert_eq!(err.body(), Some(&json!({ "field": "title" })));
        assert!(Arc::ptr_eq(&before, &client.cache()));

        let state = mutation.state();
        assert!(!state.fetching);
        assert_eq!(state.error, Some(err));
        assert_eq!(state.data, None);
    }

    #[tokio::test]
    async fn test_writes_are_not_deduplicated() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 201, json!({}));
        mock.hold();
        let mutation = client.mutation("/posts", MutationOptions::new(["posts"]));

        let first = mutation.invoke(Overrides::default());
        let second = mutation.invoke(Overrides::default());
        assert_eq!(mock.call_count(), 2);
        assert!(mutation.state().fetching);

        mock.release();
        first.await.expect("first succeeds");
        second.await.expect("second succeeds");
        assert!(!mutation.state().fetching);
    }

    #[tokio::test]
    async fn test_dropped_future_still_completes() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 201, json!({ "id": 1 }));
        mock.hold();
        client.add_response("http://api/posts", json!([]), ["posts"]);
        let mutation = client.mutation("/posts", MutationOptions::new(["posts"]));

        drop(mutation.invoke(Overrides::default()));
        mock.release();

        let mut states = mutation.subscribe();
        states
            .wait_for(|state| !state.fetching)
            .await
            .expect("state channel open");
        assert!(client.cache().get("http://api/posts").expect("cached").refetch);
    }

    #[tokio::test]
    async fn test_error_then_success_clears_error() {
        let (client, mock) = setup();
        mock.respond_once("http://api/posts", MockReply::Fail("offline".to_string()));
        mock.respond("http://api/posts", 201, json!({ "ok": true }));
        let mutation = client.mutation("/posts", MutationOptions::default());

        assert!(mutation.invoke(Overrides::default()).await.is_err());
        assert!(mutation.state().error.is_some());

        mutation.invoke(Overrides::default()).await.expect("retry succeeds");
        let state = mutation.state();
        assert!(state.error.is_none());
        assert_eq!(state.data, Some(json!({ "ok": true })));
    }

    #[tokio::test]
    async fn test_reset() {
        let (client, mock) = setup();
        mock.respond("http://api/posts", 201, json!({}));
        let mutation = client.mutation("/posts", MutationOptions::default());
        mutation.invoke(Overrides::default()).await.expect("succeeds");

        mutation.reset();
        assert_eq!(mutation.state(), FetchState::default());
    }
}
