//! Property deal lookups keyed by address.
//!
//! Second enrichment step after the valuation lookup: an address search on
//! the deals site, then extraction from the first matching listing page.
//! Same contract as the valuation resolver: a miss is a valid outcome,
//! transport trouble degrades to a miss, and a per-run cache keeps each
//! distinct address to a single lookup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use regex::Regex;
use scraper::{Html, Selector};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::config::{DealConfig, PacingConfig};
use crate::error::ScrapeResult;
use crate::models::{Address, DealListing};
use crate::scrapers::transport::{fetch_with_retry, FetchResponse, RequestSpec, Transport};
use crate::session::Session;

type CachedLookup = Arc<OnceCell<Option<DealListing>>>;

pub struct DealResolver {
    transport: Arc<dyn Transport>,
    config: DealConfig,
    pacing: PacingConfig,
    session: Mutex<Session>,
    cache: Mutex<HashMap<String, CachedLookup>>,
    lookups_issued: AtomicU64,
}

impl DealResolver {
    pub fn new(transport: Arc<dyn Transport>, config: DealConfig, pacing: PacingConfig) -> Self {
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

    /// Look up deals for an address, hitting the cache first.
    pub async fn resolve(&self, address: &Address) -> Option<DealListing> {
        if !address.has_street() {
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

    pub fn lookups_issued(&self) -> u64 {
        self.lookups_issued.load(Ordering::SeqCst)
    }

    /// Search, follow the first matching result, extract the listing.
    async fn lookup(&self, address: &Address) -> Option<DealListing> {
        self.lookups_issued.fetch_add(1, Ordering::SeqCst);
        let search_url = self.search_url(address);
        debug!(url = %search_url, "deal search");

        let search = match self.round_trip(&search_url).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(address = %address.full_address(), error = %err, "deal search failed; treating as no match");
                return None;
            }
        };

        let listing_url = find_listing_url(&search.body, &self.config.base_url)?;
        debug!(url = %listing_url, "deal listing found");

        let detail = match self.round_trip(&listing_url).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(url = %listing_url, error = %err, "deal listing fetch failed; treating as no match");
                return None;
            }
        };

        let mut listing = parse_listing(&detail.body)?;
        listing.listing_url = Some(detail.final_url);
        Some(listing)
    }

    async fn round_trip(&self, url: &str) -> ScrapeResult<FetchResponse> {
        let mut session = self.session.lock().await;
        let referrer = session.acquire_slot().await;
        let spec = RequestSpec::get(url).with_session(referrer, session.cookie_header());
        let resp = fetch_with_retry(
            self.transport.as_ref(),
            &spec,
            self.pacing.max_retries,
            self.pacing.retry_delay_secs,
        )
        .await?;
        session.record_response(&resp.final_url, &resp.cookies);
        Ok(resp)
    }

    fn search_url(&self, address: &Address) -> String {
        let encoded: String =
            url::form_urlencoded::byte_serialize(address.full_address().as_bytes()).collect();
        format!("{}/search?q={}", self.config.base_url.trim_end_matches('/'), encoded)
    }
}

/// First result link on a deal search page, absolutized against the site
/// base.
pub fn find_listing_url(html: &str, base_url: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let card_selector = Selector::parse(
        ".listing-card a[href], .deal-card a[href], .property-card a[href], article[data-listing] a[href]",
    )
    .unwrap();
    let fallback_selector =
        Selector::parse("a[href*='listing'], a[href*='deal'], a[href*='property']").unwrap();

    let href = document
        .select(&card_selector)
        .chain(document.select(&fallback_selector))
        .find_map(|a| a.value().attr("href"))?;

    if href.starts_with("http") {
        Some(href.to_string())
    } else {
        Some(format!("{}{}", base_url.trim_end_matches('/'), href))
    }
}

/// Extract deal data from a listing detail page: structured data first,
/// visible page elements as fallback.
pub fn parse_listing(html: &str) -> Option<DealListing> {
    let document = Html::parse_document(html);
    let mut listing = DealListing::default();

    parse_structured_data(&document, &mut listing);
    parse_page_elements(&document, &mut listing);

    if let (Some(price), Some(original)) = (listing.price, listing.original_price) {
        if original > price {
            listing.discount_percent = Some((original - price) / original * 100.0);
        }
    }

    listing.has_data().then_some(listing)
}

/// JSON-LD blocks of type Product/Offer/RealEstateListing.
fn parse_structured_data(document: &Html, listing: &mut DealListing) {
    let selector = Selector::parse("script[type='application/ld+json']").unwrap();

    for script in document.select(&selector) {
        let raw: String = script.text().collect();
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
            continue;
        };
        match value {
            serde_json::Value::Array(items) => {
                for item in items {
                    apply_structured_item(&item, listing);
                }
            }
            item => apply_structured_item(&item, listing),
        }
    }
}

fn apply_structured_item(item: &serde_json::Value, listing: &mut DealListing) {
    let item_type = item.get("@type").and_then(|t| t.as_str()).unwrap_or("");
    if !matches!(item_type, "Product" | "Offer" | "RealEstateListing" | "Service") {
        return;
    }

    if let Some(name) = item.get("name").and_then(|v| v.as_str()) {
        listing.title = Some(name.to_string());
    }
    if let Some(offers) = item.get("offers") {
        if let Some(price) = offers.get("price").and_then(json_number) {
            listing.price = Some(price);
        }
        if let Some(high) = offers.get("highPrice").and_then(json_number) {
            listing.original_price = Some(high);
        }
    } else if let Some(price) = item.get("price").and_then(json_number) {
        listing.price = Some(price);
    }
}

// Prices appear both as JSON numbers and as quoted strings.
fn json_number(value: &serde_json::Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn parse_page_elements(document: &Html, listing: &mut DealListing) {
    let text_of = |selectors: &str| -> Option<String> {
        let selector = Selector::parse(selectors).ok()?;
        document.select(&selector).next().map(|el| {
            el.text()
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
    };

    if listing.title.is_none() {
        listing.title = text_of("h1.listing-title, .deal-title, h1");
    }
    if listing.price.is_none() {
        listing.price = text_of(".price, .deal-price, .listing-price").and_then(|t| parse_price(&t));
    }
    if listing.original_price.is_none() {
        listing.original_price =
            text_of(".original-price, .was-price, .strikethrough, del").and_then(|t| parse_price(&t));
    }
    if listing.offer_description.is_none() {
        listing.offer_description =
            text_of(".offer-details, .deal-details, .promotion, .special-offer");
    }
    if listing.contact_name.is_none() {
        listing.contact_name = text_of(".agent-name, .contact-name, .seller-name");
    }

    if listing.contact_phone.is_none() {
        let phone_re = Regex::new(r"\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}").unwrap();
        listing.contact_phone = text_of("a[href^='tel:'], .phone, .contact-phone")
            .and_then(|t| phone_re.find(&t).map(|m| m.as_str().to_string()));
    }
    if listing.contact_email.is_none() {
        listing.contact_email = mailto_address(document).or_else(|| {
            let email_re =
                Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").unwrap();
            text_of(".email, .contact-email")
                .and_then(|t| email_re.find(&t).map(|m| m.as_str().to_string()))
        });
    }
}

fn mailto_address(document: &Html) -> Option<String> {
    let selector = Selector::parse("a[href^='mailto:']").unwrap();
    document.select(&selector).find_map(|a| {
        let href = a.value().attr("href")?;
        let address = href.strip_prefix("mailto:")?;
        Some(address.split('?').next().unwrap_or(address).to_string())
    })
}

fn parse_price(text: &str) -> Option<f64> {
    let cleaned: String = text.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
    cleaned.parse().ok()
}
