use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Property address from the court roster.
///
/// Components are stored trimmed with their original casing; comparisons go
/// through [`Address::normalized_key`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

impl Address {
    /// Formatted full address for display and enrichment queries.
    pub fn full_address(&self) -> String {
        [&self.street, &self.city, &self.state, &self.zip]
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Case-insensitive comparison key for deduplication and caching.
    pub fn normalized_key(&self) -> String {
        self.full_address().to_lowercase()
    }

    pub fn has_street(&self) -> bool {
        !self.street.is_empty()
    }
}

/// Attorney of record. Absence of either field means unlisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attorney {
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// A party to a case (plaintiff or defendant).
///
/// `first_name`/`last_name` are populated only when the source separates
/// them; a single combined name sets `full_name` alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Party {
    pub full_name: String,
    pub first_name: String,
    pub last_name: String,
    /// None means self-represented or unlisted.
    pub attorney: Option<Attorney>,
}

impl Party {
    /// Build a party from a single combined name field. First/last stay
    /// empty; they are only set when the source separates them.
    pub fn from_combined_name(name: &str) -> Self {
        Self {
            full_name: name.trim().to_string(),
            ..Default::default()
        }
    }

    /// Build a party from separated first/last name fields.
    pub fn from_split_name(first: &str, last: &str) -> Self {
        let first = first.trim();
        let last = last.trim();
        Self {
            full_name: format!("{first} {last}").trim().to_string(),
            first_name: first.to_string(),
            last_name: last.to_string(),
            attorney: None,
        }
    }
}

/// Foreclosure case scraped from the county court roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    /// Court-assigned key, unique within the store. Never empty.
    pub case_number: String,
    pub case_type: String,
    pub filing_date: Option<String>,
    pub hearing_date: Option<String>,
    pub court_room: Option<String>,
    /// Typically the lender.
    pub plaintiff: Party,
    /// The property owner.
    pub defendant: Party,
    pub property_address: Address,
    pub source_url: String,
    pub scraped_at: DateTime<Utc>,
}

impl CaseRecord {
    pub fn new(case_number: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            case_number: case_number.into(),
            case_type: "Foreclosure".to_string(),
            filing_date: None,
            hearing_date: None,
            court_room: None,
            plaintiff: Party::default(),
            defendant: Party::default(),
            property_address: Address::default(),
            source_url: source_url.into(),
            scraped_at: Utc::now(),
        }
    }
}

/// Best-effort valuation looked up from the enrichment source.
///
/// Attached to a case by address; a case exists fine without one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentEstimate {
    pub estimate_value: Option<f64>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<f64>,
    pub sqft: Option<u32>,
    pub year_built: Option<u32>,
    pub property_type: Option<String>,
    pub listing_url: Option<String>,
}

impl EnrichmentEstimate {
    /// Whether the lookup produced anything worth keeping.
    pub fn has_data(&self) -> bool {
        self.estimate_value.is_some() || self.sqft.is_some() || self.bedrooms.is_some()
    }
}

/// A property deal or offer looked up from the deals site.
///
/// Like the estimate, attached by address and entirely optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DealListing {
    pub title: Option<String>,
    pub price: Option<f64>,
    pub original_price: Option<f64>,
    pub discount_percent: Option<f64>,
    pub offer_description: Option<String>,
    pub contact_name: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
    pub listing_url: Option<String>,
}

impl DealListing {
    pub fn has_data(&self) -> bool {
        self.price.is_some() || self.offer_description.is_some() || self.contact_phone.is_some()
    }
}

/// A canonical stored record: the case plus its attached enrichments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseReport {
    pub case: CaseRecord,
    pub estimate: Option<EnrichmentEstimate>,
    #[serde(default)]
    pub deal: Option<DealListing>,
    pub first_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CaseReport {
    /// Export column names, in [`CaseReport::to_flat_row`] order.
    pub fn flat_header() -> Vec<&'static str> {
        vec![
            "case_number",
            "case_type",
            "filing_date",
            "hearing_date",
            "court_room",
            "plaintiff_name",
            "plaintiff_attorney_name",
            "plaintiff_attorney_phone",
            "defendant_first_name",
            "defendant_last_name",
            "defendant_full_name",
            "defendant_attorney_name",
            "defendant_attorney_phone",
            "property_street",
            "property_city",
            "property_state",
            "property_zip",
            "property_full_address",
            "estimate_value",
            "bedrooms",
            "bathrooms",
            "sqft",
            "year_built",
            "property_type",
            "listing_url",
            "deal_price",
            "deal_offer",
            "deal_contact_phone",
            "deal_contact_email",
            "deal_url",
            "source_url",
            "scraped_at",
        ]
    }

    /// Flatten to one export row (CSV/XLSX column order follows this).
    pub fn to_flat_row(&self) -> Vec<(&'static str, String)> {
        let case = &self.case;
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        let atty = |a: &Option<Attorney>, f: fn(&Attorney) -> Option<String>| {
            a.as_ref().and_then(f).unwrap_or_default()
        };
        let num = |v: Option<f64>| v.map(|n| n.to_string()).unwrap_or_default();
        let int = |v: Option<u32>| v.map(|n| n.to_string()).unwrap_or_default();

        let estimate = self.estimate.clone().unwrap_or_default();
        let deal = self.deal.clone().unwrap_or_default();
        vec![
            ("case_number", case.case_number.clone()),
            ("case_type", case.case_type.clone()),
            ("filing_date", opt(&case.filing_date)),
            ("hearing_date", opt(&case.hearing_date)),
            ("court_room", opt(&case.court_room)),
            ("plaintiff_name", case.plaintiff.full_name.clone()),
            (
                "plaintiff_attorney_name",
                atty(&case.plaintiff.attorney, |a| a.name.clone()),
            ),
            (
                "plaintiff_attorney_phone",
                atty(&case.plaintiff.attorney, |a| a.phone.clone()),
            ),
            ("defendant_first_name", case.defendant.first_name.clone()),
            ("defendant_last_name", case.defendant.last_name.clone()),
            ("defendant_full_name", case.defendant.full_name.clone()),
            (
                "defendant_attorney_name",
                atty(&case.defendant.attorney, |a| a.name.clone()),
            ),
            (
                "defendant_attorney_phone",
                atty(&case.defendant.attorney, |a| a.phone.clone()),
            ),
            ("property_street", case.property_address.street.clone()),
            ("property_city", case.property_address.city.clone()),
            ("property_state", case.property_address.state.clone()),
            ("property_zip", case.property_address.zip.clone()),
            ("property_full_address", case.property_address.full_address()),
            ("estimate_value", num(estimate.estimate_value)),
            ("bedrooms", int(estimate.bedrooms)),
            ("bathrooms", num(estimate.bathrooms)),
            ("sqft", int(estimate.sqft)),
            ("year_built", int(estimate.year_built)),
            ("property_type", estimate.property_type.unwrap_or_default()),
            ("listing_url", estimate.listing_url.unwrap_or_default()),
            ("deal_price", num(deal.price)),
            ("deal_offer", deal.offer_description.unwrap_or_default()),
            ("deal_contact_phone", deal.contact_phone.unwrap_or_default()),
            ("deal_contact_email", deal.contact_email.unwrap_or_default()),
            ("deal_url", deal.listing_url.unwrap_or_default()),
            ("source_url", case.source_url.clone()),
            ("scraped_at", case.scraped_at.to_rfc3339()),
        ]
    }
}

/// Terminal state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

/// Bookkeeping for one pipeline pass.
///
/// Created by the scheduler at trigger time, mutated only by the run it
/// represents, closed on completion or fatal failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records_seen: usize,
    pub records_new: usize,
    pub records_updated: usize,
    pub anomalies: usize,
    pub status: RunStatus,
}

impl PipelineRun {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            records_seen: 0,
            records_new: 0,
            records_updated: 0,
            anomalies: 0,
            status: RunStatus::Running,
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.finished_at = Some(Utc::now());
        self.status = status;
    }
}
