//! The negotiate exchange: the pre-transport HTTP handshake that assigns a
//! connection id, may redirect the client elsewhere, and rules out servers
//! speaking the legacy protocol.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::cancellation::CancellationToken;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::http::{HttpClient, HttpRequest};

/// The negotiate protocol version this client speaks.
pub const NEGOTIATE_VERSION: u32 = 1;

/// How many `url` redirects negotiation will chase before giving up.
pub const MAX_REDIRECTS: usize = 5;

/// One entry of the server's `availableTransports` list.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: String,
    #[serde(default)]
    pub transfer_formats: Vec<String>,
}

/// The raw negotiate response body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateResponse {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub connection_token: Option<String>,
    #[serde(default)]
    pub negotiate_version: Option<i64>,
    #[serde(default)]
    pub available_transports: Vec<AvailableTransport>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Present only on legacy (ASP.NET) servers. Any value is fatal.
    #[serde(default, rename = "ProtocolVersion")]
    pub protocol_version: Option<Value>,
}

/// The outcome of a completed negotiation, after any redirects.
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// The (possibly redirected) base URL the transport connects to.
    pub url: String,
    pub connection_id: String,
    /// Appended to the transport URL as `id=<token>`.
    pub connection_token: String,
    pub access_token: Option<String>,
    pub available_transports: Vec<AvailableTransport>,
}

pub(crate) fn build_negotiate_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    format!("{base}/negotiate?negotiateVersion={NEGOTIATE_VERSION}")
}

/// Run the negotiate exchange against `base_url`, chasing redirects up to
/// [`MAX_REDIRECTS`] times.
pub async fn negotiate(
    http: &Arc<dyn HttpClient>,
    base_url: &str,
    config: &ClientConfig,
    token: &CancellationToken,
) -> Result<Negotiated> {
    let mut url = base_url.to_owned();
    let mut access_token: Option<String> = None;

    for _ in 0..=MAX_REDIRECTS {
        let response = negotiate_once(http, &url, config, access_token.as_deref(), token).await?;

        if let Some(error) = response.error {
            return Err(Error::NegotiationRejected(error));
        }
        if response.protocol_version.is_some() {
            return Err(Error::LegacyServerDetected);
        }

        if let Some(redirect) = response.url {
            tracing::debug!(url = %redirect, "negotiate redirected");
            if response.access_token.is_some() {
                access_token = response.access_token;
            }
            url = redirect;
            continue;
        }

        let connection_id = response.connection_id.ok_or_else(|| {
            Error::NegotiationFailed("negotiate response is missing connectionId".into())
        })?;

        // Servers speaking negotiate version 0 don't issue a separate
        // token; the connection id doubles as one.
        let connection_token = match response.connection_token {
            Some(token) if response.negotiate_version.unwrap_or(0) > 0 => token,
            _ => connection_id.clone(),
        };

        return Ok(Negotiated {
            url,
            connection_id,
            connection_token,
            access_token,
            available_transports: response.available_transports,
        });
    }

    Err(Error::NegotiationFailed(format!(
        "negotiate exceeded the redirect limit ({MAX_REDIRECTS})"
    )))
}

async fn negotiate_once(
    http: &Arc<dyn HttpClient>,
    base_url: &str,
    config: &ClientConfig,
    access_token: Option<&str>,
    token: &CancellationToken,
) -> Result<NegotiateResponse> {
    let negotiate_url = build_negotiate_url(base_url);

    let mut request = HttpRequest {
        headers: config.http_headers.clone(),
        body: String::new(),
        timeout: config.http_request_timeout,
    };
    if let Some(bearer) = access_token {
        request
            .headers
            .insert("Authorization".into(), format!("Bearer {bearer}"));
    }

    tracing::debug!(url = %negotiate_url, "sending negotiate request");

    let response = tokio::select! {
        response = http.post(&negotiate_url, request) => response?,
        _ = token.canceled() => return Err(Error::Canceled),
    };

    if token.is_canceled() {
        return Err(Error::Canceled);
    }

    if response.status != 200 {
        return Err(Error::NegotiationFailed(format!(
            "negotiate failed with status code {}",
            response.status
        )));
    }

    serde_json::from_str(&response.body).map_err(|e| {
        Error::NegotiationFailed(format!("failed to parse negotiate response: {e}"))
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
