use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which transport strategy variant to use for a target site.
///
/// Static per-target configuration; never switched at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// TLS/header fingerprint-matched plain HTTP client.
    Client,
    /// Full interactive browser with automation markers disabled.
    Browser,
}

/// Request pacing and retry behavior, shared by all network stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Randomized delay bounds between requests, in seconds.
    pub delay_min_secs: f64,
    pub delay_max_secs: f64,
    pub max_retries: u32,
    /// Base backoff delay in seconds, doubled per attempt.
    pub retry_delay_secs: f64,
    pub request_timeout_secs: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            delay_min_secs: 10.0,
            delay_max_secs: 30.0,
            max_retries: 3,
            retry_delay_secs: 2.0,
            request_timeout_secs: 30,
        }
    }
}

impl PacingConfig {
    /// Zero-delay pacing for tests. Ordering and slot accounting still apply.
    #[cfg(test)]
    pub fn instant() -> Self {
        Self {
            delay_min_secs: 0.0,
            delay_max_secs: 0.0,
            retry_delay_secs: 0.0,
            ..Default::default()
        }
    }
}

/// County court roster portal settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountyConfig {
    pub base_url: String,
    /// Case types requested from the roster search.
    pub case_types: Vec<String>,
    pub transport: TransportKind,
    /// Upper bound on result pages walked per run.
    pub max_pages: u32,
}

impl Default for CountyConfig {
    fn default() -> Self {
        Self {
            base_url: "https://publicindex.sccourts.org/york/courtrosters/".to_string(),
            case_types: vec!["Foreclosure".to_string(), "FORECLOSURE".to_string()],
            transport: TransportKind::Client,
            max_pages: 20,
        }
    }
}

/// Valuation lookup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichConfig {
    pub base_url: String,
    /// Zip codes considered in scope; anything else skips the lookup.
    pub target_zip_codes: Vec<String>,
    pub transport: TransportKind,
    /// Concurrent lookups allowed within a run.
    pub concurrency: usize,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.zillow.com".to_string(),
            target_zip_codes: [
                "29732", "29745", "29730", "29710", "29708", "29704", "29726", "29717", "29715",
                "29702", "29743", "29712",
            ]
            .iter()
            .map(|z| z.to_string())
            .collect(),
            transport: TransportKind::Browser,
            concurrency: 3,
        }
    }
}

/// Property deal lookup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealConfig {
    pub base_url: String,
    pub transport: TransportKind,
    pub concurrency: usize,
}

impl Default for DealConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.dealio.com".to_string(),
            transport: TransportKind::Browser,
            concurrency: 2,
        }
    }
}

/// Durable store and export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub export_format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            export_format: "csv".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("foreclosures.json")
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub pacing: PacingConfig,
    pub county: CountyConfig,
    pub enrich: EnrichConfig,
    pub deals: DealConfig,
    pub storage: StorageConfig,
    pub schedule_interval_days: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pacing: PacingConfig::default(),
            county: CountyConfig::default(),
            enrich: EnrichConfig::default(),
            deals: DealConfig::default(),
            storage: StorageConfig::default(),
            schedule_interval_days: 14,
        }
    }
}

impl AppConfig {
    /// Build configuration from defaults, overridden by environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("PORTAL_BASE_URL") {
            config.county.base_url = url;
        }
        if let Some(types) = env_list("CASE_TYPES") {
            config.county.case_types = types;
        }
        if let Some(pages) = env_parse::<u32>("MAX_PAGES") {
            config.county.max_pages = pages;
        }
        if let Ok(url) = env::var("ENRICH_BASE_URL") {
            config.enrich.base_url = url;
        }
        if let Ok(url) = env::var("DEALS_BASE_URL") {
            config.deals.base_url = url;
        }
        if let Some(zips) = env_list("TARGET_ZIP_CODES") {
            config.enrich.target_zip_codes = zips;
        }
        if let Some(min) = env_parse::<f64>("DELAY_MIN_SECS") {
            config.pacing.delay_min_secs = min;
        }
        if let Some(max) = env_parse::<f64>("DELAY_MAX_SECS") {
            config.pacing.delay_max_secs = max;
        }
        if let Some(retries) = env_parse::<u32>("MAX_RETRIES") {
            config.pacing.max_retries = retries;
        }
        if let Some(days) = env_parse::<u64>("SCHEDULE_INTERVAL_DAYS") {
            // A zero interval would panic the scheduler's timer.
            config.schedule_interval_days = days.max(1);
        }
        if let Ok(dir) = env::var("DATA_DIR") {
            config.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(format) = env::var("EXPORT_FORMAT") {
            config.storage.export_format = format;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_list(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
