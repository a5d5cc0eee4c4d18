//! Page and run statistics.
//!
//! Per-row failures never end a run; they are counted here and surfaced in
//! the run summary instead.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::enricher::{Outcome, WorkUnit};
use crate::store::UpsertReport;

/// Tally of one page's outcomes and writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSummary {
    /// 1-based page number within the run.
    pub page: u64,
    /// Watermark the page was read after.
    pub after: i64,
    /// Key of the last record on the page.
    pub last_id: i64,
    /// Records fetched.
    pub fetched: u64,
    /// Units with a value to write.
    pub succeeded: u64,
    /// Units that failed permanently or exhausted retries.
    pub failed: u64,
    /// Units not attempted.
    pub skipped: u64,
    /// Rows submitted and written per table.
    pub upserted: UpsertReport,
    /// Whether writes were suppressed.
    pub dry_run: bool,
}

impl PageSummary {
    /// Counts outcomes for a page of units.
    #[must_use]
    pub fn tally(page: u64, after: i64, last_id: i64, units: &[WorkUnit]) -> Self {
        let mut summary = Self {
            page,
            after,
            last_id,
            fetched: units.len() as u64,
            ..Self::default()
        };
        for unit in units {
            match unit.outcome {
                Outcome::Succeeded(_) => summary.succeeded += 1,
                Outcome::Failed(_) => summary.failed += 1,
                Outcome::Skipped(_) => summary.skipped += 1,
            }
        }
        summary
    }

    /// Sets the write report.
    #[must_use]
    pub const fn with_upserted(mut self, upserted: UpsertReport, dry_run: bool) -> Self {
        self.upserted = upserted;
        self.dry_run = dry_run;
        self
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The cursor found no eligible rows after the watermark.
    Exhausted,
    /// The record budget was used up.
    BudgetReached,
    /// An interrupt was honored at a page or chunk boundary.
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => f.write_str("exhausted"),
            Self::BudgetReached => f.write_str("budget_reached"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Aggregated statistics for one pipeline run.
///
/// Individual failures are logged as they happen; only their counts by code
/// are kept here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Run identifier.
    pub run_id: String,
    /// Pipeline key (`birthdates` or `demographics`).
    pub pipeline: String,
    /// Watermark at start.
    pub start_watermark: i64,
    /// Watermark after the last reconciled page.
    pub final_watermark: i64,
    /// Pages reconciled.
    pub pages: u64,
    /// Records fetched on reconciled pages.
    pub fetched: u64,
    /// Successful units.
    pub succeeded: u64,
    /// Failed units.
    pub failed: u64,
    /// Skipped units.
    pub skipped: u64,
    /// Rows written per table, summed over pages.
    pub upserted: UpsertReport,
    /// Fetch or reconcile errors absorbed by the cooldown.
    pub store_errors: u64,
    /// Failure counts by code.
    pub failure_codes: BTreeMap<String, u64>,
    /// Why the run ended.
    pub stop_reason: Option<StopReason>,
    /// Wall-clock duration.
    pub elapsed_ms: u64,
    /// Whether writes were suppressed.
    pub dry_run: bool,
}

impl RunStats {
    /// Creates empty statistics.
    #[must_use]
    pub fn new(run_id: impl Into<String>, pipeline: impl Into<String>, start_watermark: i64) -> Self {
        Self {
            run_id: run_id.into(),
            pipeline: pipeline.into(),
            start_watermark,
            final_watermark: start_watermark,
            ..Self::default()
        }
    }

    /// Folds a reconciled page into the totals.
    pub fn record_page(&mut self, summary: &PageSummary, units: &[WorkUnit]) {
        self.pages += 1;
        self.fetched += summary.fetched;
        self.succeeded += summary.succeeded;
        self.failed += summary.failed;
        self.skipped += summary.skipped;
        self.final_watermark = summary.last_id;
        self.dry_run |= summary.dry_run;
        add_writes(&mut self.upserted, &summary.upserted);

        for unit in units {
            if let Outcome::Failed(info) = &unit.outcome {
                *self.failure_codes.entry(info.code.clone()).or_insert(0) += 1;
            }
        }
    }

    /// Counts an absorbed store error.
    pub fn record_store_error(&mut self) {
        self.store_errors += 1;
    }

    /// Fraction of fetched records that produced a value.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.fetched == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.fetched as f64
    }

    /// Returns true if any unit failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    /// Compact summary for events and logs.
    #[must_use]
    pub fn summary_json(&self) -> serde_json::Value {
        serde_json::json!({
            "run_id": self.run_id,
            "pipeline": self.pipeline,
            "pages": self.pages,
            "fetched": self.fetched,
            "succeeded": self.succeeded,
            "failed": self.failed,
            "skipped": self.skipped,
            "upserted_birth_dates": self.upserted.birth_dates.written,
            "upserted_genders": self.upserted.genders.written,
            "upserted_languages": self.upserted.languages.written,
            "store_errors": self.store_errors,
            "failure_codes": self.failure_codes,
            "success_rate": self.success_rate(),
            "start_watermark": self.start_watermark,
            "final_watermark": self.final_watermark,
            "stop_reason": self.stop_reason.map(|r| r.to_string()),
            "elapsed_ms": self.elapsed_ms,
            "dry_run": self.dry_run,
        })
    }
}

fn add_writes(total: &mut UpsertReport, page: &UpsertReport) {
    for (sum, add) in [
        (&mut total.birth_dates, page.birth_dates),
        (&mut total.genders, page.genders),
        (&mut total.languages, page.languages),
    ] {
        sum.submitted += add.submitted;
        sum.written += add.written;
    }
}
