//! HTTP client seam used by negotiation.
//!
//! The client is injected through a factory so embedders can supply their
//! own stack (or tests a scripted mock); [`ReqwestHttpClient`] is the
//! default.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ClientConfig;
use crate::error::{Error, Result};

/// An outbound HTTP request. Negotiation only ever POSTs.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub headers: HashMap<String, String>,
    pub body: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Minimal async HTTP client contract.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn post(&self, url: &str, request: HttpRequest) -> Result<HttpResponse>;
}

/// Builds the HTTP client bound to a connection.
pub type HttpClientFactory = Arc<dyn Fn(&ClientConfig) -> Arc<dyn HttpClient> + Send + Sync>;

/// The default reqwest-backed client.
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// The default [`HttpClientFactory`].
    pub fn factory() -> HttpClientFactory {
        Arc::new(|_config| Arc::new(ReqwestHttpClient::new()) as Arc<dyn HttpClient>)
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn post(&self, url: &str, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self.client.post(url).timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("http request failed: {e}")))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("failed to read http response: {e}")))?;

        Ok(HttpResponse { status, body })
    }
}
