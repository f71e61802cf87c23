//! Transport strategy: how requests reach a target site.
//!
//! Two variants exist, selected statically per target by
//! [`TransportKind`](crate::config::TransportKind): a fingerprint-matched
//! plain client for sites that block on handshake signature alone, and a
//! marker-free interactive browser for sites that also inspect the execution
//! environment. Both expose the single [`Transport::fetch`] operation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{PacingConfig, TransportKind};
use crate::error::{ScrapeError, ScrapeResult};

/// HTTP method for a [`RequestSpec`]. The form protocol only needs these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One outbound request, carrying session state from the pacing layer.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    pub referrer: Option<String>,
    pub cookie_header: Option<String>,
    pub form: Option<Vec<(String, String)>>,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            referrer: None,
            cookie_header: None,
            form: None,
        }
    }

    pub fn post(url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            referrer: None,
            cookie_header: None,
            form: Some(form),
        }
    }

    /// Attach the referrer and cookie jar handed out by the session.
    pub fn with_session(mut self, referrer: Option<String>, cookie_header: Option<String>) -> Self {
        self.referrer = referrer;
        self.cookie_header = cookie_header;
        self
    }
}

/// One response as seen by the pipeline.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
    pub cookies: Vec<(String, String)>,
    pub final_url: String,
}

/// Capability interface over the two transport variants.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one request. `Blocked` is surfaced, never retried here;
    /// `Transport` errors are retryable by the caller.
    async fn fetch(&self, spec: &RequestSpec) -> ScrapeResult<FetchResponse>;

    fn name(&self) -> &'static str;
}

/// Build the configured transport variant for a target site.
pub fn build(kind: TransportKind, pacing: &PacingConfig) -> Result<Arc<dyn Transport>> {
    match kind {
        TransportKind::Client => Ok(Arc::new(super::client::ImpersonatedClient::new(
            pacing.request_timeout_secs,
        )?)),
        TransportKind::Browser => Ok(Arc::new(super::browser::StealthBrowser::new()?)),
    }
}

/// Statuses treated as access denial by the anti-bot layer.
pub fn is_blocked_status(status: u16) -> bool {
    matches!(status, 403 | 429)
}

/// Heuristic for challenge pages served with a 200.
pub fn looks_like_challenge(body: &str) -> bool {
    const MARKERS: [&str; 4] = [
        "Access Denied",
        "Pardon Our Interruption",
        "Just a moment...",
        "cf-chl-widget",
    ];
    MARKERS.iter().any(|m| body.contains(m))
}

/// Fetch with bounded exponential backoff on transport failures.
///
/// `Blocked` and other stage errors pass through untouched.
pub async fn fetch_with_retry(
    transport: &dyn Transport,
    spec: &RequestSpec,
    max_retries: u32,
    base_delay_secs: f64,
) -> ScrapeResult<FetchResponse> {
    let mut attempt = 0;
    loop {
        match transport.fetch(spec).await {
            Ok(resp) => return Ok(resp),
            Err(err) if err.is_retryable() && attempt < max_retries => {
                attempt += 1;
                // Exponent capped so a large retry budget cannot overflow
                // the shift.
                let delay = base_delay_secs * f64::from(1u32 << (attempt - 1).min(16));
                warn!(url = %spec.url, attempt, delay_secs = delay, error = %err, "retrying after transport failure");
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
            Err(err) => {
                debug!(url = %spec.url, error = %err, "fetch failed");
                return Err(err);
            }
        }
    }
}
