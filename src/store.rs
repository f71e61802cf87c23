//! Case store with merge-on-case-number semantics and export formats.
//!
//! Backed by a JSON file so runs are resumable and inspectable. Merging is
//! page-by-page: each committed batch is persisted before the next page is
//! fetched, so a failure later in a run never loses earlier pages.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{debug, info};

use crate::models::{CaseRecord, CaseReport, DealListing, EnrichmentEstimate};

/// One scraped case with its per-run enrichment results.
pub type EnrichedCase = (CaseRecord, Option<EnrichmentEstimate>, Option<DealListing>);

/// A scraped filing date disagreeing with the one already on record.
/// The stored value wins; the disagreement is surfaced, not silently fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilingDateConflict {
    pub case_number: String,
    pub stored: String,
    pub incoming: String,
}

/// What a merged batch did to the store.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    pub seen: usize,
    pub inserted: usize,
    pub updated: usize,
    pub conflicts: Vec<FilingDateConflict>,
}

pub struct CaseStore {
    path: PathBuf,
    reports: RwLock<BTreeMap<String, CaseReport>>,
}

impl CaseStore {
    /// Open the store file, creating parent directories as needed. A missing
    /// file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data dir {}", parent.display()))?;
        }

        let reports = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read store file {}", path.display()))?;
            let list: Vec<CaseReport> = serde_json::from_str(&raw)
                .with_context(|| format!("Store file {} is not valid JSON", path.display()))?;
            list.into_iter()
                .map(|report| (report.case.case_number.clone(), report))
                .collect()
        } else {
            BTreeMap::new()
        };

        debug!(path = %path.display(), cases = reports.len(), "case store opened");
        Ok(Self {
            path,
            reports: RwLock::new(reports),
        })
    }

    pub fn len(&self) -> usize {
        self.reports.read().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, case_number: &str) -> Option<CaseReport> {
        self.reports
            .read()
            .expect("store lock poisoned")
            .get(case_number)
            .cloned()
    }

    /// All reports, ordered by case number.
    pub fn snapshot(&self) -> Vec<CaseReport> {
        self.reports
            .read()
            .expect("store lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Merge one committed page of scraped cases and persist the result.
    ///
    /// Cases absent from the batch are left untouched; a case falling off the
    /// roster does not mean the filing went away.
    pub fn merge(&self, batch: Vec<EnrichedCase>) -> Result<MergeOutcome> {
        let mut outcome = MergeOutcome::default();
        {
            let mut reports = self.reports.write().expect("store lock poisoned");
            for (case, estimate, deal) in batch {
                outcome.seen += 1;
                apply(&mut reports, case, estimate, deal, &mut outcome);
            }
            self.persist(&reports)?;
        }
        debug!(
            seen = outcome.seen,
            inserted = outcome.inserted,
            updated = outcome.updated,
            conflicts = outcome.conflicts.len(),
            "batch merged"
        );
        Ok(outcome)
    }

    /// Write the snapshot to a sibling temp file, then rename over the live
    /// file, so a crash mid-write never leaves a truncated store.
    fn persist(&self, reports: &BTreeMap<String, CaseReport>) -> Result<()> {
        let list: Vec<&CaseReport> = reports.values().collect();
        let json = serde_json::to_string_pretty(&list)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write store file {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace store file {}", self.path.display()))?;
        Ok(())
    }

    /// Write a timestamped export plus the stable snapshot consumed by the
    /// report viewer. Returns the timestamped path.
    pub fn export(&self, format: &str, data_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create export dir {}", data_dir.display()))?;

        let reports = self.snapshot();
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = match format {
            "csv" => {
                let path = data_dir.join(format!("foreclosures_{stamp}.csv"));
                export_csv(&reports, &path)?;
                path
            }
            "xlsx" => {
                let path = data_dir.join(format!("foreclosures_{stamp}.xlsx"));
                export_xlsx(&reports, &path)?;
                path
            }
            "json" => {
                let path = data_dir.join(format!("foreclosures_{stamp}.json"));
                export_json(&reports, &path)?;
                path
            }
            other => bail!("Unknown export format: {other}"),
        };

        // Stable filename, overwritten every run.
        export_json(&reports, &data_dir.join("foreclosures_enriched.json"))?;

        info!(path = %path.display(), cases = reports.len(), "exported");
        Ok(path)
    }
}

fn apply(
    reports: &mut BTreeMap<String, CaseReport>,
    case: CaseRecord,
    estimate: Option<EnrichmentEstimate>,
    deal: Option<DealListing>,
    outcome: &mut MergeOutcome,
) {
    let now = Utc::now();
    let Some(existing) = reports.get_mut(&case.case_number) else {
        outcome.inserted += 1;
        reports.insert(
            case.case_number.clone(),
            CaseReport {
                case,
                estimate,
                deal,
                first_seen: now,
                updated_at: now,
            },
        );
        return;
    };

    let mut changed = false;

    match (&existing.case.filing_date, &case.filing_date) {
        (Some(stored), Some(incoming)) if stored != incoming => {
            outcome.conflicts.push(FilingDateConflict {
                case_number: case.case_number.clone(),
                stored: stored.clone(),
                incoming: incoming.clone(),
            });
        }
        (None, Some(incoming)) => {
            existing.case.filing_date = Some(incoming.clone());
            changed = true;
        }
        _ => {}
    }

    if case.hearing_date.is_some() && existing.case.hearing_date != case.hearing_date {
        existing.case.hearing_date = case.hearing_date;
        changed = true;
    }
    if case.court_room.is_some() && existing.case.court_room != case.court_room {
        existing.case.court_room = case.court_room;
        changed = true;
    }
    if estimate.is_some() && existing.estimate != estimate {
        existing.estimate = estimate;
        changed = true;
    }
    if deal.is_some() && existing.deal != deal {
        existing.deal = deal;
        changed = true;
    }

    // Freshness markers move regardless, but only real field changes count
    // as an update so a rerun over the same roster reads as a no-op.
    existing.case.scraped_at = case.scraped_at;
    if changed {
        existing.updated_at = now;
        outcome.updated += 1;
    }
}

fn export_csv(reports: &[CaseReport], path: &Path) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Always)
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut wrote_header = false;
    for report in reports {
        let row = report.to_flat_row();
        if !wrote_header {
            writer.write_record(row.iter().map(|(name, _)| *name))?;
            wrote_header = true;
        }
        writer.write_record(row.iter().map(|(_, value)| value.as_str()))?;
    }
    if !wrote_header {
        writer.write_record(CaseReport::flat_header())?;
    }
    writer.flush()?;
    Ok(())
}

fn export_xlsx(reports: &[CaseReport], path: &Path) -> Result<()> {
    use rust_xlsxwriter::Workbook;

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Foreclosures")?;

    for (col, name) in CaseReport::flat_header().iter().enumerate() {
        sheet.write_string(0, col as u16, *name)?;
    }
    for (row, report) in reports.iter().enumerate() {
        for (col, (_, value)) in report.to_flat_row().iter().enumerate() {
            sheet.write_string(row as u32 + 1, col as u16, value)?;
        }
    }

    workbook
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn export_json(reports: &[CaseReport], path: &Path) -> Result<()> {
    let rows: Vec<serde_json::Map<String, serde_json::Value>> = reports
        .iter()
        .map(|report| {
            report
                .to_flat_row()
                .into_iter()
                .map(|(name, value)| (name.to_string(), serde_json::Value::String(value)))
                .collect()
        })
        .collect();
    let json = serde_json::to_string_pretty(&rows)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
