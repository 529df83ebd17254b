//! Transport calls with in-flight deduplication.
//!
//! The executor turns a [`RawResponse`](crate::transport::RawResponse) into
//! either parsed JSON or a [`FetchError`], and makes sure that identical
//! `GET` requests share one transport call while it is pending.
//!
//! Every call is driven by a spawned task. Dropping the future returned by
//! [`RequestExecutor::execute`] stops waiting for the result but never
//! aborts the call.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::key::derive_key;
use crate::options::RequestOptions;
use crate::transport::{RawResponse, Transport, TransportError};

/// The settled outcome of a request, shareable between waiters.
pub type SharedResponse = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

#[derive(Clone)]
struct InFlight {
    id: u64,
    response: SharedResponse,
}

type InFlightTable = DashMap<String, InFlight>;

/// Removes an in-flight registration when the driving task ends, whether
/// the call succeeded, failed, panicked or was cancelled.
struct InFlightGuard {
    table: Arc<InFlightTable>,
    key: String,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.table.remove_if(&self.key, |_, entry| entry.id == self.id);
    }
}

/// Performs transport calls for one client.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    in_flight: Arc<InFlightTable>,
    next_id: Arc<AtomicU64>,
}

impl RequestExecutor {
    pub fn new(transport: impl Transport) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    pub fn from_arc(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            in_flight: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Issues a request and returns a future resolving to its parsed body.
    ///
    /// The transport call starts before this method returns. A request whose
    /// method is absent or exactly `GET` joins an identical pending request
    /// instead of issuing a new one; any other method always reaches the
    /// transport.
    ///
    /// On a non-success status the future fails with
    /// [`FetchError::Response`] carrying the server's payload.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn execute(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> BoxFuture<'static, Result<Value, FetchError>> {
        if !options.is_get() {
            debug!(url, method = options.method(), "issuing request");
            let call = self.transport.call(url, options);
            return join(tokio::spawn(async move { settle(call.await) })).boxed();
        }

        match self.in_flight.entry(derive_key(url, options)) {
            Entry::Occupied(entry) => {
                debug!(key = %entry.key(), "joining in-flight request");
                entry.get().response.clone().boxed()
            }
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let guard = InFlightGuard {
                    table: Arc::clone(&self.in_flight),
                    key: entry.key().clone(),
                    id,
                };
                debug!(key = %entry.key(), "issuing request");

                let call = self.transport.call(url, options);
                let task = tokio::spawn(async move {
                    let _guard = guard;
                    settle(call.await)
                });
                let response = join(task).boxed().shared();
                entry.insert(InFlight {
                    id,
                    response: response.clone(),
                });
                response.boxed()
            }
        }
    }

    /// Returns the number of `GET` requests currently pending.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

fn settle(result: Result<RawResponse, TransportError>) -> Result<Value, FetchError> {
    let response = result?;
    let body = response.parse_body();
    if response.ok() {
        Ok(body)
    } else {
        Err(FetchError::Response {
            status: response.status,
            body,
        })
    }
}

async fn join(task: JoinHandle<Result<Value, FetchError>>) -> Result<Value, FetchError> {
    task.await.unwrap_or_else(|e| {
        warn!(error = %e, "request task did not complete");
        Err(FetchError::Interrupted(e.to_string()))
    })
}
