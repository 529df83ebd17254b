//! # Refetch - Cache-Coordinated Data Fetching
//!
//! Refetch keeps the data shown by many independent consumers consistent
//! with a remote JSON API. Reads are cached under a request key and tagged
//! with domains; writes invalidate domains; every active read in an
//! invalidated domain refetches on its own.
//!
//! ## Architecture
//!
//! 1. **Transport**: Performs one request/response exchange
//! 2. **Executor**: Deduplicates identical reads while they are in flight
//! 3. **Cache**: Immutable snapshots of keyed, domain-tagged responses
//! 4. **Query**: A read bound to a key, driven by a [`CachePolicy`](query::CachePolicy)
//! 5. **Mutation**: A write that invalidates domains on success
//!
//! ## Core Components
//!
//! - [`Client`](client::Client): Owns one cache and one in-flight table
//! - [`Query`](query::Query): Fetches, caches and refetches a read
//! - [`Mutation`](mutation::Mutation): Sends a write and invalidates domains
//! - [`Transport`](transport::Transport): The seam to the network
//! - [`FetchState`](state::FetchState): What a coordinator publishes
//!
//! ## Example
//!
//! ```rust,no_run
//! use refetch::prelude::*;
//! use refetch::transport::mock::MockTransport;
//! use serde_json::json;
//!
//! # async fn run() {
//! let mock = MockTransport::new();
//! mock.respond("https://api.example.com/posts", 200, json!([{ "id": 1 }]));
//!
//! let client = Client::with_config(
//!     mock,
//!     ClientConfig::new().with_base_url("https://api.example.com"),
//! );
//!
//! let posts = client.query("/posts", QueryOptions::new(["posts"]));
//! posts.activate();
//!
//! let create = client.mutation("/posts", MutationOptions::new(["posts"]));
//! // On success every active query tagged "posts" refetches.
//! let _ = create.invoke(Overrides::default()).await;
//! # }
//! ```
//!
//! ## Features
//!
//! - `reqwest`: enables [`ReqwestTransport`](transport::http::ReqwestTransport)

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod key;
pub mod mutation;
pub mod options;
pub mod preload;
pub mod prelude;
pub mod query;
pub mod state;
pub mod transport;
