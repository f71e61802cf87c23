//! Run-scoped session state: cookie jar, referrer chain, request pacing.
//!
//! One `Session` per network-facing stage per run. Constructed at run start
//! and dropped at run end, so no state leaks across runs.

use std::collections::HashMap;

use rand::Rng;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::config::PacingConfig;

/// Cookie jar, referrer chain and human-like delay scheduling.
///
/// Cannot fail; it only delays.
pub struct Session {
    delay_min: Duration,
    delay_max: Duration,
    last_request: Option<Instant>,
    referrer: Option<String>,
    cookies: HashMap<String, String>,
    requests_issued: u64,
}

impl Session {
    pub fn new(pacing: &PacingConfig) -> Self {
        Self {
            delay_min: Duration::from_secs_f64(pacing.delay_min_secs),
            delay_max: Duration::from_secs_f64(pacing.delay_max_secs),
            last_request: None,
            referrer: None,
            cookies: HashMap::new(),
            requests_issued: 0,
        }
    }

    /// Block until a randomized interval has elapsed since the previous slot,
    /// then return the referrer to attach to the next request.
    ///
    /// The first slot of a session is granted immediately.
    pub async fn acquire_slot(&mut self) -> Option<String> {
        if let Some(last) = self.last_request {
            let wait = self.random_delay().saturating_sub(last.elapsed());
            if !wait.is_zero() {
                debug!(wait_secs = wait.as_secs_f64(), "pacing delay");
                sleep(wait).await;
            }
        }
        self.last_request = Some(Instant::now());
        self.requests_issued += 1;
        self.referrer.clone()
    }

    /// Record a completed response: absorb its cookies and chain the referrer
    /// for the next request.
    pub fn record_response(&mut self, url: &str, cookies: &[(String, String)]) {
        for (name, value) in cookies {
            self.cookies.insert(name.clone(), value.clone());
        }
        self.referrer = Some(url.to_string());
    }

    /// Render the jar as a `Cookie` header value, if any cookies are held.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let mut pairs: Vec<String> = self
            .cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        pairs.sort();
        Some(pairs.join("; "))
    }

    pub fn requests_issued(&self) -> u64 {
        self.requests_issued
    }

    fn random_delay(&self) -> Duration {
        if self.delay_max <= self.delay_min {
            return self.delay_min;
        }
        let secs = rand::thread_rng().gen_range(self.delay_min.as_secs_f64()..=self.delay_max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}
