//! Scriptable transport for testing.
//!
//! [`MockTransport`] answers requests from a table of scripted replies and
//! records every call it receives, enabling deterministic tests without a
//! network.
//!
//! # Basic Usage
//!
//! ```
//! use refetch::transport::mock::MockTransport;
//! use serde_json::json;
//!
//! let mock = MockTransport::new();
//! mock.respond("/posts", 200, json!([{ "id": 1 }]));
//! mock.respond("/broken", 500, json!({ "message": "bad" }));
//!
//! assert_eq!(mock.call_count(), 0);
//! ```
//!
//! # Holding calls
//!
//! [`MockTransport::hold`] keeps every subsequent call pending until
//! [`MockTransport::release`] is called. This is how concurrent callers are
//! made to overlap when testing in-flight deduplication.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::watch;

use super::{RawResponse, Transport, TransportError};
use crate::options::RequestOptions;

/// A scripted reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Respond with a status and JSON body.
    Json { status: u16, body: Value },
    /// Respond with a status and raw body bytes.
    Raw { status: u16, body: Vec<u8> },
    /// Fail the exchange with a transport error.
    Fail(String),
}

impl MockReply {
    fn into_result(self) -> Result<RawResponse, TransportError> {
        match self {
            Self::Json { status, body } => Ok(RawResponse::json(status, &body)),
            Self::Raw { status, body } => Ok(RawResponse::new(status, body)),
            Self::Fail(message) => Err(TransportError(message)),
        }
    }
}

/// A call received by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub url: String,
    pub options: RequestOptions,
}

#[derive(Debug, Default)]
struct Script {
    persistent: HashMap<String, MockReply>,
    queued: HashMap<String, VecDeque<MockReply>>,
    calls: Vec<RecordedCall>,
}

impl Script {
    fn reply_for(&mut self, url: &str) -> MockReply {
        if let Some(reply) = self.queued.get_mut(url).and_then(VecDeque::pop_front) {
            return reply;
        }
        self.persistent.get(url).cloned().unwrap_or_else(|| MockReply::Json {
            status: 404,
            body: json!({ "message": format!("no reply scripted for {url}") }),
        })
    }
}

/// A transport answering from scripted replies.
///
/// Clones share the same script, call log and gate, so one clone can be
/// handed to a [`Client`](crate::client::Client) while the test keeps
/// another.
#[derive(Debug, Clone)]
pub struct MockTransport {
    script: Arc<Mutex<Script>>,
    gate: Arc<watch::Sender<bool>>,
}

impl MockTransport {
    /// Creates a mock with no scripted replies and an open gate.
    ///
    /// Unscripted URLs answer `404` with a JSON message.
    #[must_use]
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            gate: Arc::new(gate),
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answers every call to `url` with `status` and `body`.
    pub fn respond(&self, url: impl Into<String>, status: u16, body: Value) {
        self.script()
            .persistent
            .insert(url.into(), MockReply::Json { status, body });
    }

    /// Answers the next call to `url` with `reply`, ahead of any persistent
    /// reply.
    pub fn respond_once(&self, url: impl Into<String>, reply: MockReply) {
        self.script()
            .queued
            .entry(url.into())
            .or_default()
            .push_back(reply);
    }

    /// Fails every call to `url` with a transport error.
    pub fn fail(&self, url: impl Into<String>, message: impl Into<String>) {
        self.script()
            .persistent
            .insert(url.into(), MockReply::Fail(message.into()));
    }

    /// Keeps subsequent calls pending until [`release`](Self::release).
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    /// Lets every held call settle.
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Returns every call received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script().calls.clone()
    }

    /// Returns the number of calls received so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.script().calls.len()
    }

    /// Returns the number of calls received for `url`.
    #[must_use]
    pub fn calls_to(&self, url: &str) -> usize {
        self.script().calls.iter().filter(|call| call.url == url).count()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn call(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> BoxFuture<'static, Result<RawResponse, TransportError>> {
        // The call is recorded when issued, not when it settles.
        let reply = {
            let mut script = self.script();
            script.calls.push(RecordedCall {
                url: url.to_string(),
                options: options.clone(),
            });
            script.reply_for(url)
        };
        let mut gate = self.gate.subscribe();

        async move {
            let opened = gate.wait_for(|open| *open).await.is_ok();
            if !opened {
                return Err(TransportError("mock transport dropped".to_string()));
            }
            reply.into_result()
        }
        .boxed()
    }
}
