//! Turns resolved work units into one set-based write per page.

use std::collections::BTreeMap;
use tracing::debug;

use super::enricher::{Derived, Outcome, WorkUnit};
use crate::errors::StoreError;
use crate::store::{EnrichmentStore, ReconcileBatch, TableWrite, UpsertReport, WatermarkUpdate};

/// Collects successful outcomes into a [`ReconcileBatch`] and applies it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reconciler {
    dry_run: bool,
}

impl Reconciler {
    /// Creates a reconciler. In dry-run mode nothing is written.
    #[must_use]
    pub const fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    /// Builds the write set for a page.
    ///
    /// Pairs are keyed by master id, so a record appearing twice contributes
    /// only its last outcome. Output is ascending by id.
    #[must_use]
    pub fn build_batch(units: &[WorkUnit], watermark: Option<WatermarkUpdate>) -> ReconcileBatch {
        let mut birth_dates = BTreeMap::new();
        let mut demographics = BTreeMap::new();
        for unit in units {
            match &unit.outcome {
                Outcome::Succeeded(Derived::BirthDate(date)) => {
                    birth_dates.insert(unit.id, *date);
                }
                Outcome::Succeeded(Derived::Demographics(prediction)) => {
                    demographics.insert(unit.id, *prediction);
                }
                Outcome::Failed(_) | Outcome::Skipped(_) => {}
            }
        }

        ReconcileBatch {
            birth_dates: birth_dates.into_iter().collect(),
            genders: demographics.iter().map(|(id, p)| (*id, p.gender)).collect(),
            languages: demographics.iter().map(|(id, p)| (*id, p.language)).collect(),
            watermark,
        }
    }

    /// Applies `batch` in one store transaction.
    ///
    /// In dry-run mode the store is not touched and every submitted pair is
    /// reported with zero rows written.
    pub async fn apply<S>(&self, store: &S, batch: &ReconcileBatch) -> Result<UpsertReport, StoreError>
    where
        S: EnrichmentStore + ?Sized,
    {
        if self.dry_run {
            debug!(
                birth_dates = ?batch.birth_dates,
                genders = ?batch.genders,
                languages = ?batch.languages,
                "Dry run, write set not applied"
            );
            return Ok(submitted_only(batch));
        }
        if batch.is_empty() {
            return Ok(UpsertReport::default());
        }
        store.reconcile(batch).await
    }
}

fn submitted_only(batch: &ReconcileBatch) -> UpsertReport {
    let submitted = |n: usize| TableWrite {
        submitted: u64::try_from(n).unwrap_or(u64::MAX),
        written: 0,
    };
    UpsertReport {
        birth_dates: submitted(batch.birth_dates.len()),
        genders: submitted(batch.genders.len()),
        languages: submitted(batch.languages.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureInfo;
    use crate::pipeline::enricher::SkipReason;
    use crate::prediction::{Gender, Language, Prediction};
    use crate::store::{InMemoryStore, MasterRecord};
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn unit(id: i64, outcome: Outcome) -> WorkUnit {
        WorkUnit::resolved(&MasterRecord::new(id, "First", "Last", None), outcome)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn demographics(language: Language, gender: Gender) -> Outcome {
        Outcome::Succeeded(Derived::Demographics(Prediction::new(language, gender, 0.8)))
    }

    #[test]
    fn test_batch_keeps_only_successes_sorted() {
        let units = vec![
            unit(9, demographics(Language::Sepedi, Gender::Male)),
            unit(3, Outcome::Failed(FailureInfo::new("RETRIES_EXHAUSTED", "gave up"))),
            unit(4, Outcome::Skipped(SkipReason::BlankName)),
            unit(2, demographics(Language::IsiZulu, Gender::Female)),
        ];
        let batch = Reconciler::build_batch(&units, None);

        assert!(batch.birth_dates.is_empty());
        assert_eq!(batch.genders, vec![(2, Gender::Female), (9, Gender::Male)]);
        assert_eq!(
            batch.languages,
            vec![(2, Language::IsiZulu), (9, Language::Sepedi)]
        );
    }

    #[test]
    fn test_duplicate_ids_collapse_to_last() {
        let units = vec![
            unit(1, Outcome::Succeeded(Derived::BirthDate(date(1990, 1, 1)))),
            unit(1, Outcome::Succeeded(Derived::BirthDate(date(1991, 2, 2)))),
        ];
        let batch = Reconciler::build_batch(&units, None);
        assert_eq!(batch.birth_dates, vec![(1, date(1991, 2, 2))]);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_write() {
        let store = InMemoryStore::with_records([MasterRecord::new(1, "A", "B", None)]);
        let batch = Reconciler::build_batch(
            &[unit(1, Outcome::Succeeded(Derived::BirthDate(date(1990, 1, 1))))],
            Some(WatermarkUpdate {
                pipeline: "birthdates".into(),
                last_processed_id: 1,
            }),
        );

        let report = Reconciler::new(true).apply(&store, &batch).await.unwrap();
        assert_eq!(report.birth_dates.submitted, 1);
        assert_eq!(report.total_written(), 0);
        assert_eq!(store.birth_date(1), None);
        assert_eq!(store.calls().reconciles, 0);
    }

    #[tokio::test]
    async fn test_apply_twice_writes_once() {
        let store = InMemoryStore::with_records([MasterRecord::new(1, "A", "B", None)]);
        let batch = Reconciler::build_batch(
            &[unit(1, demographics(Language::English, Gender::Male))],
            None,
        );

        let reconciler = Reconciler::new(false);
        let first = reconciler.apply(&store, &batch).await.unwrap();
        let second = reconciler.apply(&store, &batch).await.unwrap();
        assert_eq!(first.total_written(), 2);
        assert_eq!(second.total_written(), 0);
        assert_eq!(second.genders, TableWrite { submitted: 1, written: 0 });
    }

    #[tokio::test]
    async fn test_empty_batch_skips_store() {
        let store = InMemoryStore::new();
        let report = Reconciler::new(false)
            .apply(&store, &ReconcileBatch::default())
            .await
            .unwrap();
        assert_eq!(report, UpsertReport::default());
        assert_eq!(store.calls().reconciles, 0);
    }
}
