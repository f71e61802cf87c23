//! Fingerprint-matched plain HTTP client.
//!
//! Carries the full header signature of a current desktop Chrome so the
//! request profile matches what the court portal expects from a real
//! browser. Cookies and referrer are injected per request by the session
//! layer rather than held in the client.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, COOKIE, REFERER, SET_COOKIE};
use reqwest::redirect::Policy;
use reqwest::Client;
use tracing::debug;

use crate::error::{ScrapeError, ScrapeResult};
use crate::scrapers::transport::{
    is_blocked_status, looks_like_challenge, FetchResponse, Method, RequestSpec, Transport,
};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Transport variant for sites that block on transport signature alone.
pub struct ImpersonatedClient {
    client: Client,
}

impl ImpersonatedClient {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .redirect(Policy::limited(5))
            .user_agent(USER_AGENT)
            .default_headers(impersonation_headers())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }
}

/// The Chrome navigation header set the portal's anti-bot layer checks.
fn impersonation_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8",
        ),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(
        "Sec-Ch-Ua",
        HeaderValue::from_static(
            "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\"",
        ),
    );
    headers.insert("Sec-Ch-Ua-Mobile", HeaderValue::from_static("?0"));
    headers.insert("Sec-Ch-Ua-Platform", HeaderValue::from_static("\"macOS\""));
    headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("document"));
    headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("navigate"));
    headers.insert("Sec-Fetch-Site", HeaderValue::from_static("same-origin"));
    headers.insert("Sec-Fetch-User", HeaderValue::from_static("?1"));
    headers.insert(
        "Upgrade-Insecure-Requests",
        HeaderValue::from_static("1"),
    );
    headers
}

/// Pull `name=value` pairs out of `Set-Cookie` response headers.
fn response_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| {
            let raw = value.to_str().ok()?;
            let pair = raw.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

#[async_trait]
impl Transport for ImpersonatedClient {
    async fn fetch(&self, spec: &RequestSpec) -> ScrapeResult<FetchResponse> {
        let mut request = match spec.method {
            Method::Get => self.client.get(&spec.url),
            Method::Post => self
                .client
                .post(&spec.url)
                .form(spec.form.as_deref().unwrap_or(&[])),
        };

        if let Some(referrer) = &spec.referrer {
            request = request.header(REFERER, referrer);
        }
        if let Some(cookies) = &spec.cookie_header {
            request = request.header(COOKIE, cookies);
        }

        debug!(method = ?spec.method, url = %spec.url, "fetching");

        let response = request
            .send()
            .await
            .map_err(|e| ScrapeError::transport(format!("{}: {e}", spec.url)))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let cookies = response_cookies(response.headers());

        if is_blocked_status(status) {
            return Err(ScrapeError::Blocked {
                status,
                url: final_url,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| ScrapeError::transport(format!("{}: body read failed: {e}", spec.url)))?;

        if looks_like_challenge(&body) {
            return Err(ScrapeError::Blocked {
                status,
                url: final_url,
            });
        }

        Ok(FetchResponse {
            status,
            body,
            cookies,
            final_url,
        })
    }

    fn name(&self) -> &'static str {
        "impersonated-client"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn get_carries_session_state_and_collects_cookies() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/courtrosters/"))
            .and(header("Referer", "https://portal.example/disclaimer"))
            .and(header("Cookie", "ASP.NET_SessionId=abc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html>roster</html>")
                    .insert_header("set-cookie", "accepted=1; Path=/"),
            )
            .mount(&server)
            .await;

        let client = ImpersonatedClient::new(5).unwrap();
        let spec = RequestSpec::get(format!("{}/courtrosters/", server.uri())).with_session(
            Some("https://portal.example/disclaimer".into()),
            Some("ASP.NET_SessionId=abc".into()),
        );

        let resp = client.fetch(&spec).await.unwrap();
        assert_eq!(resp.status, 200);
        assert!(resp.body.contains("roster"));
        assert!(resp
            .cookies
            .contains(&("accepted".to_string(), "1".to_string())));
    }

    #[tokio::test]
    async fn post_sends_form_payload() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/courtrosters/"))
            .and(body_string_contains("__VIEWSTATE=tok123"))
            .respond_with(ResponseTemplate::new(200).set_body_string("accepted"))
            .mount(&server)
            .await;

        let client = ImpersonatedClient::new(5).unwrap();
        let spec = RequestSpec::post(
            format!("{}/courtrosters/", server.uri()),
            vec![("__VIEWSTATE".into(), "tok123".into())],
        );

        let resp = client.fetch(&spec).await.unwrap();
        assert_eq!(resp.body, "accepted");
    }

    #[tokio::test]
    async fn denial_status_maps_to_blocked() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let client = ImpersonatedClient::new(5).unwrap();
        let err = client
            .fetch(&RequestSpec::get(server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Blocked { status: 403, .. }));
    }

    #[tokio::test]
    async fn challenge_body_maps_to_blocked() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><title>Just a moment...</title></html>"),
            )
            .mount(&server)
            .await;

        let client = ImpersonatedClient::new(5).unwrap();
        let err = client
            .fetch(&RequestSpec::get(server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Blocked { .. }));
    }
}
