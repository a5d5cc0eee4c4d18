//! Single-record birth-date backfill.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::enricher::{BirthDateEnricher, Derived, Outcome, SkipReason, WorkUnit};
use super::reconcile::Reconciler;
use crate::errors::{FailureInfo, StoreError};
use crate::store::EnrichmentStore;

/// Result of backfilling one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackfillOutcome {
    /// No master record has this id.
    NotFound,
    /// The identifier decoded; `written` is false if the stored date already matched.
    Written {
        /// Decoded birth date.
        birth_date: NaiveDate,
        /// Whether a row was inserted or updated.
        written: bool,
    },
    /// The identifier did not decode.
    Failed(FailureInfo),
    /// Nothing to decode.
    Skipped(SkipReason),
}

/// Decodes one record's identifier and upserts its birth date with the same
/// writer the page loop uses.
pub async fn backfill_one<S>(
    store: &S,
    enricher: &BirthDateEnricher,
    id: i64,
) -> Result<BackfillOutcome, StoreError>
where
    S: EnrichmentStore + ?Sized,
{
    let Some(record) = store.master_record(id).await? else {
        return Ok(BackfillOutcome::NotFound);
    };

    let outcome = enricher.resolve(&record);
    match outcome {
        Outcome::Succeeded(Derived::BirthDate(birth_date)) => {
            let units = [WorkUnit::resolved(&record, outcome)];
            let batch = Reconciler::build_batch(&units, None);
            let report = Reconciler::new(false).apply(store, &batch).await?;
            let written = report.birth_dates.written > 0;
            info!(id, %birth_date, written, "Birth date backfilled");
            Ok(BackfillOutcome::Written { birth_date, written })
        }
        // the birth-date enricher never yields demographics
        Outcome::Succeeded(Derived::Demographics(_)) => Ok(BackfillOutcome::Skipped(
            SkipReason::MissingIdentifier,
        )),
        Outcome::Failed(info) => Ok(BackfillOutcome::Failed(info)),
        Outcome::Skipped(reason) => Ok(BackfillOutcome::Skipped(reason)),
    }
}
