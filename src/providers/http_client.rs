// =============================================================================
// HTTP/JSON Provider — reqwest client with optional HMAC-SHA256 signing
// =============================================================================
//
// Request shape:
//   GET {base_url}/v1/signals/{data_type}/{instrument}?as_of=<rfc3339>
//       [&timestamp=<ms>&signature=<hex hmac>]
//
// Response body: `{ "value": <f64>, "as_of": "<rfc3339>" }` (as_of optional).
//
// Status mapping: 404 → NotFound (permanent).  429, 5xx, transport errors,
// timeouts and unparseable bodies → Unavailable (retryable).  Other 4xx are
// client mistakes that will not fix themselves, so they map to NotFound.
//
// SECURITY: the secret is never logged or serialised.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, instrument};

use super::{Provider, SignalReading};
use crate::error::ProviderError;
use crate::runtime_config::SourceConfig;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct SignalBody {
    value: f64,
    #[serde(default)]
    as_of: Option<DateTime<Utc>>,
}

/// Provider speaking the generic signal HTTP/JSON protocol.
#[derive(Clone)]
pub struct HttpJsonProvider {
    id: String,
    base_url: String,
    secret: Option<String>,
    client: reqwest::Client,
}

impl HttpJsonProvider {
    /// Build a provider from a source entry, resolving credentials from the
    /// environment variables it names.
    pub fn from_config(source: &SourceConfig) -> Result<Self> {
        let base_url = source
            .base_url
            .clone()
            .with_context(|| format!("source '{}' has no base_url", source.id))?;
        let api_key = source
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        let secret = source
            .api_secret_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        Self::new(
            &source.id,
            base_url,
            api_key,
            secret,
            Duration::from_millis(source.timeout_ms),
        )
    }

    pub fn new(
        id: &str,
        base_url: impl Into<String>,
        api_key: Option<String>,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        if let Some(key) = api_key.as_deref() {
            let val = HeaderValue::from_str(key).context("API key is not a valid header value")?;
            default_headers.insert("X-API-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(source = id, base_url = %base_url, "HttpJsonProvider initialised");

        Ok(Self {
            id: id.to_string(),
            base_url,
            secret,
            client,
        })
    }

    /// Produce an HMAC-SHA256 hex signature of `query`, if a secret is set.
    pub fn sign(&self, query: &str) -> Option<String> {
        let secret = self.secret.as_deref()?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
        mac.update(query.as_bytes());
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    fn build_url(&self, instrument_id: &str, data_type: &str, as_of: DateTime<Utc>) -> String {
        let mut query = format!("as_of={}", as_of.to_rfc3339());
        if self.secret.is_some() {
            query.push_str(&format!("&timestamp={}", Utc::now().timestamp_millis()));
            if let Some(sig) = self.sign(&query) {
                query.push_str(&format!("&signature={sig}"));
            }
        }
        format!(
            "{}/v1/signals/{}/{}?{}",
            self.base_url, data_type, instrument_id, query
        )
    }
}

/// Map an HTTP status to the provider error taxonomy; `None` means success.
pub fn classify_status(
    status: StatusCode,
    source_id: &str,
    instrument_id: &str,
    data_type: &str,
) -> Option<ProviderError> {
    if status.is_success() {
        return None;
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Some(ProviderError::unavailable(
            source_id,
            format!("HTTP {status}"),
        ));
    }
    Some(ProviderError::not_found(source_id, instrument_id, data_type))
}

#[async_trait]
impl Provider for HttpJsonProvider {
    fn id(&self) -> &str {
        &self.id
    }

    #[instrument(skip(self), name = "http_provider::fetch", fields(source = %self.id))]
    async fn fetch(
        &self,
        instrument_id: &str,
        data_type: &str,
        as_of: DateTime<Utc>,
    ) -> Result<SignalReading, ProviderError> {
        let url = self.build_url(instrument_id, data_type, as_of);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::unavailable(&self.id, e.to_string()))?;

        if let Some(err) = classify_status(resp.status(), &self.id, instrument_id, data_type) {
            return Err(err);
        }

        let body: SignalBody = resp
            .json()
            .await
            .map_err(|e| ProviderError::unavailable(&self.id, format!("bad body: {e}")))?;

        Ok(SignalReading {
            value: body.value,
            as_of: body.as_of.unwrap_or(as_of),
            source_id: self.id.clone(),
        })
    }
}

impl std::fmt::Debug for HttpJsonProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpJsonProvider")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("signed", &self.secret.is_some())
            .finish()
    }
}
