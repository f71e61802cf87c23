//! Stateful multi-page roster protocol.
//!
//! The portal is a classic postback form: a disclaimer gate, then a search
//! whose results paginate through hidden validation tokens that must be
//! round-tripped on every submission. Page state lives in an explicit
//! [`PageCursor`] value passed between round trips, so the one-restart rule
//! on session expiry stays easy to reason about.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{CountyConfig, PacingConfig};
use crate::error::{ScrapeError, ScrapeResult};
use crate::models::CaseRecord;
use crate::scrapers::extract;
use crate::scrapers::transport::{fetch_with_retry, FetchResponse, RequestSpec, Transport};
use crate::session::Session;

/// Everything needed to request one result page: the hidden tokens from the
/// previous response plus the page index.
#[derive(Debug, Clone)]
pub struct PageCursor {
    pub tokens: HashMap<String, String>,
    pub page: u32,
}

/// Drives the disclaimer → search → paginated-results protocol.
pub struct RosterNavigator {
    transport: Arc<dyn Transport>,
    session: Session,
    county: CountyConfig,
    pacing: PacingConfig,
}

impl RosterNavigator {
    pub fn new(transport: Arc<dyn Transport>, county: CountyConfig, pacing: PacingConfig) -> Self {
        let session = Session::new(&pacing);
        Self {
            transport,
            session,
            county,
            pacing,
        }
    }

    /// Discard cookies, referrer chain and pacing history. Used for the
    /// single permitted restart after a session expiry.
    pub fn reset_session(&mut self) {
        self.session = Session::new(&self.pacing);
    }

    /// Pass the disclaimer gate and return a cursor for page one.
    pub async fn start(&mut self) -> ScrapeResult<PageCursor> {
        let base_url = self.county.base_url.clone();
        info!(url = %base_url, "opening roster portal");

        let resp = self.round_trip(RequestSpec::get(&base_url)).await?;
        let mut tokens = extract::extract_form_tokens(&resp.body);

        if let Some((name, value)) = extract::find_accept_submit(&resp.body) {
            if tokens.is_empty() {
                return Err(ScrapeError::extraction(
                    "disclaimer page carries no form state",
                ));
            }
            debug!("accepting portal disclaimer");
            let mut form: Vec<(String, String)> = sorted_pairs(&tokens);
            form.push((name, value));
            let resp = self.round_trip(RequestSpec::post(&base_url, form)).await?;
            tokens = extract::extract_form_tokens(&resp.body);
        }

        if !tokens.contains_key("__VIEWSTATE") {
            return Err(ScrapeError::SessionExpired(
                "no form state after disclaimer".into(),
            ));
        }

        Ok(PageCursor { tokens, page: 1 })
    }

    /// Fetch the page the cursor points at. Returns the extracted records and
    /// the cursor for the next page, if one exists within the page budget.
    pub async fn fetch_page(
        &mut self,
        cursor: &PageCursor,
    ) -> ScrapeResult<(Vec<CaseRecord>, Option<PageCursor>)> {
        let base_url = self.county.base_url.clone();
        let form = self.page_form(cursor);
        let resp = self.round_trip(RequestSpec::post(&base_url, form)).await?;

        // The portal bounces expired sessions back to the disclaimer gate.
        if extract::find_accept_submit(&resp.body).is_some() {
            return Err(ScrapeError::SessionExpired(
                "portal returned to disclaimer mid-search".into(),
            ));
        }

        let (cases, has_next) = extract::extract_cases(&resp.body, &resp.final_url)?;
        info!(page = cursor.page, cases = cases.len(), has_next, "roster page extracted");

        let next = if has_next && cursor.page < self.county.max_pages {
            let tokens = extract::extract_form_tokens(&resp.body);
            if !tokens.contains_key("__VIEWSTATE") {
                return Err(ScrapeError::SessionExpired(
                    "pagination tokens missing from results page".into(),
                ));
            }
            Some(PageCursor {
                tokens,
                page: cursor.page + 1,
            })
        } else {
            None
        };

        Ok((cases, next))
    }

    /// Form payload for a page request: the round-tripped tokens plus either
    /// the initial search fields or a pager postback.
    fn page_form(&self, cursor: &PageCursor) -> Vec<(String, String)> {
        let mut fields = cursor.tokens.clone();
        if cursor.page == 1 {
            let case_type = self
                .county
                .case_types
                .first()
                .cloned()
                .unwrap_or_else(|| "Foreclosure".to_string());
            fields.insert("ddlCaseType".to_string(), case_type);
            fields.insert("btnSearch".to_string(), "Search".to_string());
        } else {
            fields.insert("__EVENTTARGET".to_string(), "gvRoster".to_string());
            fields.insert(
                "__EVENTARGUMENT".to_string(),
                format!("Page${}", cursor.page),
            );
        }
        sorted_pairs(&fields)
    }

    /// One paced round trip: slot, session headers, bounded retry, cookie
    /// absorption.
    async fn round_trip(&mut self, spec: RequestSpec) -> ScrapeResult<FetchResponse> {
        let referrer = self.session.acquire_slot().await;
        let spec = spec.with_session(referrer, self.session.cookie_header());
        let resp = fetch_with_retry(
            self.transport.as_ref(),
            &spec,
            self.pacing.max_retries,
            self.pacing.retry_delay_secs,
        )
        .await?;
        self.session.record_response(&resp.final_url, &resp.cookies);
        Ok(resp)
    }
}

fn sorted_pairs(fields: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = fields
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    pairs.sort();
    pairs
}
