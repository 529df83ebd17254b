//! Prelude module for convenient imports.
//!
//! ```
//! use refetch::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`Client`] and [`ClientConfig`] - The entry point and its configuration
//! - [`Query`], [`QueryOptions`] and [`CachePolicy`] - For reads
//! - [`Mutation`] and [`MutationOptions`] - For writes
//! - [`RequestOptions`] and [`Overrides`] - Request configuration
//! - [`FetchState`] and [`FetchError`] - What coordinators publish
//! - [`Transport`] - The network seam

pub use crate::cache::{Cache, CacheEntry};
pub use crate::client::Client;
pub use crate::config::ClientConfig;
pub use crate::error::FetchError;
pub use crate::mutation::{Mutation, MutationOptions};
pub use crate::options::{OptionsLayer, Overrides, RequestOptions};
pub use crate::preload::Preloaded;
pub use crate::query::{CachePolicy, Query, QueryOptions};
pub use crate::state::FetchState;
pub use crate::transport::Transport;
