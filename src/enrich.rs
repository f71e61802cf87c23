//! Property valuation lookups keyed by address.
//!
//! Best-effort by design: a miss is a valid outcome (`None`), and transport
//! trouble degrades to a miss after bounded retries instead of failing the
//! run. Results are cached per run per normalized address so the same
//! address never costs two external lookups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use regex::Regex;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::config::{EnrichConfig, PacingConfig};
use crate::models::{Address, EnrichmentEstimate};
use crate::scrapers::transport::{fetch_with_retry, RequestSpec, Transport};
use crate::session::Session;

type CachedLookup = Arc<OnceCell<Option<EnrichmentEstimate>>>;

/// Resolves a normalized address to a valuation estimate, or NoMatch.
pub struct EnrichmentResolver {
    transport: Arc<dyn Transport>,
    config: EnrichConfig,
    pacing: PacingConfig,
    session: Mutex<Session>,
    cache: Mutex<HashMap<String, CachedLookup>>,
    lookups_issued: AtomicU64,
}

impl EnrichmentResolver {
    pub fn new(transport: Arc<dyn Transport>, config: EnrichConfig, pacing: PacingConfig) -> Self {
        let session = Session::new(&pacing);
        Self {
            transport,
            config,
            pacing,
            session: Mutex::new(session),
            cache: Mutex::new(HashMap::new()),
            lookups_issued: AtomicU64::new(0),
        }
    }

    /// Look up an address, hitting the cache first. Concurrent calls for the
    /// same address share a single in-flight lookup.
    pub async fn resolve(&self, address: &Address) -> Option<EnrichmentEstimate> {
        if !address.has_street() {
            return None;
        }
        if self.out_of_scope(address) {
            debug!(zip = %address.zip, "address outside target zip codes; skipping lookup");
            return None;
        }

        let entry = {
            let mut cache = self.cache.lock().await;
            cache
                .entry(address.normalized_key())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        entry
            .get_or_init(|| async { self.lookup(address).await })
            .await
            .clone()
    }

    /// External lookups issued this run. Cache hits do not count.
    pub fn lookups_issued(&self) -> u64 {
        self.lookups_issued.load(Ordering::SeqCst)
    }

    fn out_of_scope(&self, address: &Address) -> bool {
        !address.zip.is_empty()
            && !self.config.target_zip_codes.is_empty()
            && !self.config.target_zip_codes.contains(&address.zip)
    }

    async fn lookup(&self, address: &Address) -> Option<EnrichmentEstimate> {
        self.lookups_issued.fetch_add(1, Ordering::SeqCst);
        let url = self.search_url(address);
        debug!(%url, "valuation lookup");

        // Pacing and retries happen under the session lock; the valuation
        // site sees one request at a time.
        let mut session = self.session.lock().await;
        let referrer = session.acquire_slot().await;
        let spec = RequestSpec::get(&url).with_session(referrer, session.cookie_header());

        let resp = match fetch_with_retry(
            self.transport.as_ref(),
            &spec,
            self.pacing.max_retries,
            self.pacing.retry_delay_secs,
        )
        .await
        {
            Ok(resp) => resp,
            Err(err) => {
                warn!(address = %address.full_address(), error = %err, "valuation lookup failed; treating as no match");
                return None;
            }
        };
        session.record_response(&resp.final_url, &resp.cookies);
        drop(session);

        let mut estimate = parse_estimate(&resp.body)?;
        estimate.listing_url = Some(resp.final_url);
        Some(estimate)
    }

    /// Address search URL, quote-plus encoded the way the listing site
    /// expects.
    fn search_url(&self, address: &Address) -> String {
        let encoded: String =
            url::form_urlencoded::byte_serialize(address.full_address().as_bytes()).collect();
        format!("{}/homes/{}_rb/", self.config.base_url.trim_end_matches('/'), encoded)
    }
}

/// Pull valuation fields out of the listing JSON embedded in the page.
///
/// Returns None when nothing useful was found, which usually means the
/// address had no listing.
pub fn parse_estimate(html: &str) -> Option<EnrichmentEstimate> {
    let number = |pattern: &str| -> Option<f64> {
        Regex::new(pattern)
            .unwrap()
            .captures(html)
            .and_then(|c| c[1].parse().ok())
    };
    let integer = |pattern: &str| -> Option<u32> {
        Regex::new(pattern)
            .unwrap()
            .captures(html)
            .and_then(|c| c[1].parse().ok())
    };

    let zestimate = number(r#""zestimate"\s*:\s*(\d+(?:\.\d+)?)"#);
    let price = number(r#""(?:price|listPrice)"\s*:\s*(\d+(?:\.\d+)?)"#);

    let estimate = EnrichmentEstimate {
        estimate_value: zestimate.or(price),
        bedrooms: integer(r#""bedrooms"\s*:\s*(\d+)"#),
        bathrooms: number(r#""bathrooms"\s*:\s*(\d+(?:\.\d+)?)"#),
        sqft: integer(r#""livingArea"\s*:\s*(\d+)"#),
        year_built: integer(r#""yearBuilt"\s*:\s*(\d{4})"#),
        property_type: Regex::new(r#""(?:homeType|propertyType)"\s*:\s*"([A-Za-z_ ]+)""#)
            .unwrap()
            .captures(html)
            .map(|c| c[1].to_string()),
        listing_url: None,
    };

    estimate.has_data().then_some(estimate)
}
