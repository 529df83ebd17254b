//! [`Transport`] backed by `reqwest`.

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use reqwest::Method;

use super::{RawResponse, Transport, TransportError};
use crate::options::RequestOptions;

/// Sends requests with a shared [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a preconfigured client (timeouts, TLS, proxies).
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    fn call(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> BoxFuture<'static, Result<RawResponse, TransportError>> {
        let method = match Method::from_bytes(options.method().as_bytes()) {
            Ok(method) => method,
            Err(e) => return future::ready(Err(TransportError(e.to_string()))).boxed(),
        };

        let mut request = self.client.request(method, url);
        for (name, value) in &options.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &options.body {
            request = request.body(body.clone());
        }

        async move {
            let response = request
                .send()
                .await
                .map_err(|e| TransportError(e.to_string()))?;
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(|e| TransportError(e.to_string()))?;
            Ok(RawResponse::new(status, body.to_vec()))
        }
        .boxed()
    }
}
