//! End-to-end acquisition pass: roster walk, enrichment, merge, export.
//!
//! Commits page by page. A failure on page N never rolls back pages one
//! through N-1; they are already merged and persisted.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::deals::DealResolver;
use crate::enrich::EnrichmentResolver;
use crate::error::ScrapeError;
use crate::models::{CaseRecord, PipelineRun, RunStatus};
use crate::scrapers::navigator::RosterNavigator;
use crate::scrapers::transport::{self, Transport};
use crate::store::{CaseStore, EnrichedCase};

pub struct Pipeline {
    config: AppConfig,
    store: Arc<CaseStore>,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Result<Self> {
        let store = Arc::new(CaseStore::open(config.storage.store_path())?);
        Ok(Self { config, store })
    }

    pub fn store(&self) -> &CaseStore {
        &self.store
    }

    /// Run one full pass with transports built from configuration.
    pub async fn run(&self, stop: Option<watch::Receiver<bool>>) -> Result<PipelineRun> {
        let county = transport::build(self.config.county.transport, &self.config.pacing)?;
        let enrich = transport::build(self.config.enrich.transport, &self.config.pacing)?;
        let deals = transport::build(self.config.deals.transport, &self.config.pacing)?;
        Ok(self.run_with(county, enrich, deals, stop).await)
    }

    /// Run one full pass over the given transports. Always returns run
    /// bookkeeping; a failed stage closes the run as failed rather than
    /// propagating, so partial results stay reported.
    pub async fn run_with(
        &self,
        county_transport: Arc<dyn Transport>,
        enrich_transport: Arc<dyn Transport>,
        deal_transport: Arc<dyn Transport>,
        mut stop: Option<watch::Receiver<bool>>,
    ) -> PipelineRun {
        let mut run = PipelineRun::start();
        info!("pipeline run started");

        let resolver = Arc::new(EnrichmentResolver::new(
            enrich_transport,
            self.config.enrich.clone(),
            self.config.pacing.clone(),
        ));
        let deals = Arc::new(DealResolver::new(
            deal_transport,
            self.config.deals.clone(),
            self.config.pacing.clone(),
        ));
        let mut navigator = RosterNavigator::new(
            county_transport,
            self.config.county.clone(),
            self.config.pacing.clone(),
        );

        match self
            .acquire_and_commit(&mut navigator, &resolver, &deals, &mut run, &mut stop)
            .await
        {
            Ok(()) => {
                run.finish(RunStatus::Succeeded);
                info!(
                    seen = run.records_seen,
                    new = run.records_new,
                    updated = run.records_updated,
                    anomalies = run.anomalies,
                    lookups = resolver.lookups_issued() + deals.lookups_issued(),
                    "pipeline run succeeded"
                );
            }
            Err(err) => {
                run.finish(RunStatus::Failed);
                error!(
                    error = %err,
                    seen = run.records_seen,
                    "pipeline run failed; earlier pages remain committed"
                );
            }
        }
        run
    }

    async fn acquire_and_commit(
        &self,
        navigator: &mut RosterNavigator,
        resolver: &Arc<EnrichmentResolver>,
        deals: &Arc<DealResolver>,
        run: &mut PipelineRun,
        stop: &mut Option<watch::Receiver<bool>>,
    ) -> Result<()> {
        let mut restarted = false;
        // Conflicts are recorded once per run per case, even when the same
        // case shows up on overlapping pages.
        let mut conflicted: HashSet<String> = HashSet::new();
        let mut cursor = navigator.start().await?;

        loop {
            if stop_requested(stop) {
                info!("stop requested; ending run at a page boundary");
                break;
            }

            match navigator.fetch_page(&cursor).await {
                Ok((cases, next)) => {
                    let batch = self.enrich_page(resolver, deals, cases).await;
                    let outcome = self.store.merge(batch)?;
                    run.records_seen += outcome.seen;
                    run.records_new += outcome.inserted;
                    run.records_updated += outcome.updated;
                    for conflict in &outcome.conflicts {
                        if !conflicted.insert(conflict.case_number.clone()) {
                            continue;
                        }
                        run.anomalies += 1;
                        warn!(
                            case = %conflict.case_number,
                            stored = %conflict.stored,
                            incoming = %conflict.incoming,
                            "filing date conflict; keeping stored value"
                        );
                    }
                    match next {
                        Some(n) => cursor = n,
                        None => break,
                    }
                }
                // One restart per run. A second expiry is a real failure.
                Err(ScrapeError::SessionExpired(reason)) if !restarted => {
                    warn!(%reason, "session expired; restarting the search once");
                    restarted = true;
                    navigator.reset_session();
                    cursor = navigator.start().await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Enrich one page of cases with a bounded worker pool. The resolver
    /// caches keep duplicate addresses down to a single lookup each.
    async fn enrich_page(
        &self,
        resolver: &Arc<EnrichmentResolver>,
        deals: &Arc<DealResolver>,
        cases: Vec<CaseRecord>,
    ) -> Vec<EnrichedCase> {
        let semaphore = Arc::new(Semaphore::new(self.config.enrich.concurrency.max(1)));
        let mut tasks = Vec::with_capacity(cases.len());

        for case in cases {
            let resolver = resolver.clone();
            let deals = deals.clone();
            let semaphore = semaphore.clone();
            tasks.push(tokio::spawn(async move {
                let (estimate, deal) = if case.property_address.has_street() {
                    let _permit = semaphore.acquire().await.expect("semaphore closed");
                    (
                        resolver.resolve(&case.property_address).await,
                        deals.resolve(&case.property_address).await,
                    )
                } else {
                    (None, None)
                };
                (case, estimate, deal)
            }));
        }

        let mut batch = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(row) => batch.push(row),
                Err(err) => warn!(error = %err, "enrichment task panicked; dropping row"),
            }
        }
        batch
    }
}

fn stop_requested(stop: &Option<watch::Receiver<bool>>) -> bool {
    stop.as_ref().is_some_and(|rx| *rx.borrow())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PacingConfig;
    use crate::error::ScrapeResult;
    use crate::scrapers::transport::{FetchResponse, Method, RequestSpec};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const DISCLAIMER: &str = r#"<html><form>
        <input type="hidden" name="__VIEWSTATE" value="vs-0" />
        <input type="submit" name="btnAccept" value="Accept" />
    </form></html>"#;

    const SEARCH_FORM: &str = r#"<html><form>
        <input type="hidden" name="__VIEWSTATE" value="vs-1" />
    </form></html>"#;

    const LISTING_PAGE: &str = r#"{"zestimate":225000,"bedrooms":3,"livingArea":1850}"#;

    fn results_page(case_number: &str, filing_date: &str, viewstate: &str, next_link: bool) -> String {
        let pager = if next_link {
            "<tr class=\"pagerRow\"><td><span>1</span> <a href=\"javascript:__doPostBack('gvRoster','Page$2')\">2</a></td></tr>"
        } else {
            ""
        };
        format!(
            r##"<html><form>
            <input type="hidden" name="__VIEWSTATE" value="{viewstate}" />
            <table class="searchResultsGrid">
              <tr class="standardRow">
                <td>1</td>
                <td><a href="#">{case_number}</a> Palmetto Bank VS Kenneth Roach, defendant</td>
                <td></td><td></td>
                <td>{filing_date}</td>
                <td>Foreclosure</td><td>Open</td><td></td>
                <td>Property Address: 875 Rolling Green Drive, Rock Hill, SC 29732</td>
              </tr>
              {pager}
            </table>
            </form></html>"##
        )
    }

    struct ScriptedTransport {
        responses: Mutex<VecDeque<ScrapeResult<FetchResponse>>>,
    }

    impl ScriptedTransport {
        fn new(scripted: Vec<ScrapeResult<FetchResponse>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(scripted.into()),
            })
        }

        fn ok(body: &str) -> ScrapeResult<FetchResponse> {
            Ok(FetchResponse {
                status: 200,
                body: body.to_string(),
                cookies: vec![],
                final_url: "https://portal.example/courtrosters/".to_string(),
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn fetch(&self, _spec: &RequestSpec) -> ScrapeResult<FetchResponse> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ScrapeError::transport("script exhausted")))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    struct ListingTransport;

    #[async_trait]
    impl Transport for ListingTransport {
        async fn fetch(&self, spec: &RequestSpec) -> ScrapeResult<FetchResponse> {
            assert_eq!(spec.method, Method::Get);
            Ok(FetchResponse {
                status: 200,
                body: LISTING_PAGE.to_string(),
                cookies: vec![],
                final_url: spec.url.clone(),
            })
        }

        fn name(&self) -> &'static str {
            "listing"
        }
    }

    fn pipeline(dir: &tempfile::TempDir) -> Pipeline {
        let mut config = AppConfig {
            pacing: PacingConfig::instant(),
            ..Default::default()
        };
        config.storage.data_dir = dir.path().to_path_buf();
        Pipeline::new(config).unwrap()
    }

    #[tokio::test]
    async fn full_pass_commits_and_enriches_both_pages() {
        let dir = tempdir().unwrap();
        let page1 = results_page("2025CP4601197", "06/10/2025", "vs-2", true);
        let page2 = results_page("2025CP4601204", "06/12/2025", "vs-3", false);
        let county = ScriptedTransport::new(vec![
            ScriptedTransport::ok(DISCLAIMER),
            ScriptedTransport::ok(SEARCH_FORM),
            ScriptedTransport::ok(&page1),
            ScriptedTransport::ok(&page2),
        ]);

        let pipeline = pipeline(&dir);
        let run = pipeline
            .run_with(county, Arc::new(ListingTransport), Arc::new(ListingTransport), None)
            .await;

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.records_seen, 2);
        assert_eq!(run.records_new, 2);
        assert_eq!(run.anomalies, 0);

        let report = pipeline.store().get("2025CP4601197").unwrap();
        assert_eq!(report.estimate.unwrap().estimate_value, Some(225000.0));
    }

    #[tokio::test]
    async fn failure_on_later_page_keeps_earlier_commits() {
        let dir = tempdir().unwrap();
        let page1 = results_page("2025CP4601197", "06/10/2025", "vs-2", true);
        let county = ScriptedTransport::new(vec![
            ScriptedTransport::ok(DISCLAIMER),
            ScriptedTransport::ok(SEARCH_FORM),
            ScriptedTransport::ok(&page1),
            // Page two hits the anti-bot wall.
            Err(ScrapeError::Blocked {
                status: 403,
                url: "https://portal.example/courtrosters/".to_string(),
            }),
        ]);

        let pipeline = pipeline(&dir);
        let run = pipeline
            .run_with(county, Arc::new(ListingTransport), Arc::new(ListingTransport), None)
            .await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.records_seen, 1);
        assert!(pipeline.store().get("2025CP4601197").is_some());
    }

    #[tokio::test]
    async fn session_expiry_restarts_exactly_once() {
        let dir = tempdir().unwrap();
        let page1 = results_page("2025CP4601197", "06/10/2025", "vs-2", false);
        let county = ScriptedTransport::new(vec![
            ScriptedTransport::ok(DISCLAIMER),
            ScriptedTransport::ok(SEARCH_FORM),
            // First page request bounces to the disclaimer: expired.
            ScriptedTransport::ok(DISCLAIMER),
            // Restart walks the gate again and succeeds.
            ScriptedTransport::ok(DISCLAIMER),
            ScriptedTransport::ok(SEARCH_FORM),
            ScriptedTransport::ok(&page1),
        ]);

        let pipeline = pipeline(&dir);
        let run = pipeline
            .run_with(county, Arc::new(ListingTransport), Arc::new(ListingTransport), None)
            .await;

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.records_new, 1);
    }

    #[tokio::test]
    async fn second_session_expiry_fails_the_run() {
        let dir = tempdir().unwrap();
        let county = ScriptedTransport::new(vec![
            ScriptedTransport::ok(DISCLAIMER),
            ScriptedTransport::ok(SEARCH_FORM),
            ScriptedTransport::ok(DISCLAIMER),
            ScriptedTransport::ok(DISCLAIMER),
            ScriptedTransport::ok(SEARCH_FORM),
            ScriptedTransport::ok(DISCLAIMER),
        ]);

        let pipeline = pipeline(&dir);
        let run = pipeline
            .run_with(county, Arc::new(ListingTransport), Arc::new(ListingTransport), None)
            .await;

        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn stop_signal_ends_run_between_pages() {
        let dir = tempdir().unwrap();
        let county = ScriptedTransport::new(vec![
            ScriptedTransport::ok(DISCLAIMER),
            ScriptedTransport::ok(SEARCH_FORM),
        ]);
        let (tx, rx) = watch::channel(true);

        let pipeline = pipeline(&dir);
        let run = pipeline
            .run_with(county, Arc::new(ListingTransport), Arc::new(ListingTransport), Some(rx))
            .await;
        drop(tx);

        // Stopped before any page was fetched; still a clean run.
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.records_seen, 0);
    }

    #[tokio::test]
    async fn conflict_on_overlapping_pages_counts_once_per_run() {
        let dir = tempdir().unwrap();
        let pipeline = pipeline(&dir);

        // Seed the store with the filing date of record.
        let seeded = pipeline
            .run_with(
                ScriptedTransport::new(vec![
                    ScriptedTransport::ok(DISCLAIMER),
                    ScriptedTransport::ok(SEARCH_FORM),
                    ScriptedTransport::ok(&results_page("2025CP4601197", "06/10/2025", "vs-2", false)),
                ]),
                Arc::new(ListingTransport),
                Arc::new(ListingTransport),
                None,
            )
            .await;
        assert_eq!(seeded.anomalies, 0);

        // Next run sees the case twice, on overlapping pages, with a
        // different filing date both times.
        let page1 = results_page("2025CP4601197", "07/01/2025", "vs-2", true);
        let page2 = results_page("2025CP4601197", "07/01/2025", "vs-3", false);
        let run = pipeline
            .run_with(
                ScriptedTransport::new(vec![
                    ScriptedTransport::ok(DISCLAIMER),
                    ScriptedTransport::ok(SEARCH_FORM),
                    ScriptedTransport::ok(&page1),
                    ScriptedTransport::ok(&page2),
                ]),
                Arc::new(ListingTransport),
                Arc::new(ListingTransport),
                None,
            )
            .await;

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.anomalies, 1);
        // The stored date stays untouched.
        assert_eq!(
            pipeline
                .store()
                .get("2025CP4601197")
                .unwrap()
                .case
                .filing_date
                .as_deref(),
            Some("06/10/2025")
        );
    }

    struct DeadListingTransport;

    #[async_trait]
    impl Transport for DeadListingTransport {
        async fn fetch(&self, _spec: &RequestSpec) -> ScrapeResult<FetchResponse> {
            Err(ScrapeError::transport("timed out"))
        }

        fn name(&self) -> &'static str {
            "dead-listing"
        }
    }

    #[tokio::test]
    async fn enrichment_outage_never_fails_the_run() {
        let dir = tempdir().unwrap();
        let page = results_page("2025CP4601197", "06/10/2025", "vs-2", false);
        let county = ScriptedTransport::new(vec![
            ScriptedTransport::ok(DISCLAIMER),
            ScriptedTransport::ok(SEARCH_FORM),
            ScriptedTransport::ok(&page),
        ]);

        let pipeline = pipeline(&dir);
        let run = pipeline
            .run_with(county, Arc::new(DeadListingTransport), Arc::new(DeadListingTransport), None)
            .await;

        assert_eq!(run.status, RunStatus::Succeeded);
        let report = pipeline.store().get("2025CP4601197").unwrap();
        assert!(report.estimate.is_none());
        assert!(report.deal.is_none());
    }

    struct DealSiteTransport;

    #[async_trait]
    impl Transport for DealSiteTransport {
        async fn fetch(&self, spec: &RequestSpec) -> ScrapeResult<FetchResponse> {
            let body = if spec.url.contains("/search?") {
                r#"<div class="deal-card"><a href="/listing/875-rolling-green">875 Rolling Green</a></div>"#
            } else {
                r#"<script type="application/ld+json">
                    {"@type":"Product","name":"875 Rolling Green","offers":{"price":"210000"}}
                </script>"#
            };
            Ok(FetchResponse {
                status: 200,
                body: body.to_string(),
                cookies: vec![],
                final_url: spec.url.clone(),
            })
        }

        fn name(&self) -> &'static str {
            "deal-site"
        }
    }

    #[tokio::test]
    async fn full_pass_attaches_deal_listings() {
        let dir = tempdir().unwrap();
        let page = results_page("2025CP4601197", "06/10/2025", "vs-2", false);
        let county = ScriptedTransport::new(vec![
            ScriptedTransport::ok(DISCLAIMER),
            ScriptedTransport::ok(SEARCH_FORM),
            ScriptedTransport::ok(&page),
        ]);

        let pipeline = pipeline(&dir);
        let run = pipeline
            .run_with(
                county,
                Arc::new(ListingTransport),
                Arc::new(DealSiteTransport),
                None,
            )
            .await;

        assert_eq!(run.status, RunStatus::Succeeded);
        let report = pipeline.store().get("2025CP4601197").unwrap();
        let deal = report.deal.unwrap();
        assert_eq!(deal.price, Some(210000.0));
        assert!(deal
            .listing_url
            .unwrap()
            .contains("/listing/875-rolling-green"));
    }

    #[tokio::test]
    async fn rerun_over_same_roster_reports_no_changes() {
        let dir = tempdir().unwrap();
        let page = results_page("2025CP4601197", "06/10/2025", "vs-2", false);
        let script = || {
            ScriptedTransport::new(vec![
                ScriptedTransport::ok(DISCLAIMER),
                ScriptedTransport::ok(SEARCH_FORM),
                ScriptedTransport::ok(&page),
            ])
        };

        let pipeline = pipeline(&dir);
        let first = pipeline
            .run_with(script(), Arc::new(ListingTransport), Arc::new(ListingTransport), None)
            .await;
        assert_eq!(first.records_new, 1);

        let second = pipeline
            .run_with(script(), Arc::new(ListingTransport), Arc::new(ListingTransport), None)
            .await;
        assert_eq!(second.records_new, 0);
        assert_eq!(second.records_updated, 0);
    }
}
