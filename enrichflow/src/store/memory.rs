//! In-memory [`EnrichmentStore`] with fault injection, for tests.

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::{
    shift_back_one_century, BirthDateChange, CorrectionMode, Eligibility, EnrichmentCounts,
    EnrichmentStore, MasterRecord, PageQuery, ReconcileBatch, TableWrite, UpsertReport,
};
use crate::errors::StoreError;
use crate::prediction::{Gender, Language};

#[derive(Debug, Default, Clone)]
struct State {
    masters: BTreeMap<i64, MasterRecord>,
    birth_dates: BTreeMap<i64, Option<NaiveDate>>,
    genders: BTreeMap<i64, Gender>,
    languages: BTreeMap<i64, Language>,
    watermarks: HashMap<String, i64>,
}

#[derive(Debug, Default)]
struct Faults {
    fetch: u32,
    reconcile: u32,
}

/// Calls observed by an [`InMemoryStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallLog {
    /// Watermark of every fetch, in call order.
    pub fetches: Vec<i64>,
    /// Number of reconcile calls, failed ones included.
    pub reconciles: u32,
    /// Rows inserted or updated across all successful reconciles.
    pub rows_written: u64,
}

/// A store held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    faults: Mutex<Faults>,
    calls: Mutex<CallLog>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `records`.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = MasterRecord>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.lock();
            for record in records {
                state.masters.insert(record.id, record);
            }
        }
        store
    }

    /// Seeds a birth-date row, `None` meaning present but unset.
    pub fn put_birth_date(&self, id: i64, date: Option<NaiveDate>) {
        self.state.lock().birth_dates.insert(id, date);
    }

    /// Makes the next `n` fetches fail with a connection error.
    pub fn fail_next_fetches(&self, n: u32) {
        self.faults.lock().fetch = n;
    }

    /// Makes the next `n` reconciles fail before writing anything.
    pub fn fail_next_reconciles(&self, n: u32) {
        self.faults.lock().reconcile = n;
    }

    /// Stored birth date for `id`.
    #[must_use]
    pub fn birth_date(&self, id: i64) -> Option<NaiveDate> {
        self.state.lock().birth_dates.get(&id).copied().flatten()
    }

    /// Number of rows in each destination: birth dates, genders, languages.
    #[must_use]
    pub fn row_counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (state.birth_dates.len(), state.genders.len(), state.languages.len())
    }

    /// Snapshot of the calls made so far.
    #[must_use]
    pub fn calls(&self) -> CallLog {
        self.calls.lock().clone()
    }

    fn take_fault(slot: &mut u32) -> bool {
        if *slot > 0 {
            *slot -= 1;
            true
        } else {
            false
        }
    }

    fn is_eligible(state: &State, record: &MasterRecord, eligibility: Eligibility) -> bool {
        match eligibility {
            Eligibility::MissingBirthDate => {
                record.raw_identifier.is_some()
                    && !matches!(state.birth_dates.get(&record.id), Some(Some(_)))
            }
            Eligibility::MissingGenderOrLanguage => {
                record.has_names()
                    && (!state.genders.contains_key(&record.id)
                        || !state.languages.contains_key(&record.id))
            }
        }
    }
}

fn merge<V: Copy + PartialEq>(table: &mut BTreeMap<i64, V>, rows: &[(i64, V)]) -> TableWrite {
    let mut written = 0;
    for (id, value) in rows {
        if table.get(id) != Some(value) {
            table.insert(*id, *value);
            written += 1;
        }
    }
    TableWrite {
        submitted: rows.len() as u64,
        written,
    }
}

#[async_trait]
impl EnrichmentStore for InMemoryStore {
    async fn fetch_page(&self, query: PageQuery) -> Result<Vec<MasterRecord>, StoreError> {
        self.calls.lock().fetches.push(query.after);
        if Self::take_fault(&mut self.faults.lock().fetch) {
            return Err(StoreError::Connection("injected fetch fault".to_string()));
        }

        let state = self.state.lock();
        Ok(state
            .masters
            .range(query.after.saturating_add(1)..)
            .map(|(_, r)| r)
            .filter(|r| Self::is_eligible(&state, r, query.eligibility))
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn reconcile(&self, batch: &ReconcileBatch) -> Result<UpsertReport, StoreError> {
        self.calls.lock().reconciles += 1;
        if Self::take_fault(&mut self.faults.lock().reconcile) {
            return Err(StoreError::Connection("injected reconcile fault".to_string()));
        }

        // stage on a copy so the page is all-or-nothing
        let mut staged = self.state.lock().clone();
        let dates: Vec<(i64, Option<NaiveDate>)> =
            batch.birth_dates.iter().map(|(id, d)| (*id, Some(*d))).collect();
        let report = UpsertReport {
            birth_dates: merge(&mut staged.birth_dates, &dates),
            genders: merge(&mut staged.genders, &batch.genders),
            languages: merge(&mut staged.languages, &batch.languages),
        };
        if let Some(update) = &batch.watermark {
            staged
                .watermarks
                .insert(update.pipeline.clone(), update.last_processed_id);
        }
        *self.state.lock() = staged;

        self.calls.lock().rows_written += report.total_written();
        Ok(report)
    }

    async fn load_watermark(&self, pipeline: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.state.lock().watermarks.get(pipeline).copied())
    }

    async fn save_watermark(&self, pipeline: &str, last_processed_id: i64) -> Result<(), StoreError> {
        self.state
            .lock()
            .watermarks
            .insert(pipeline.to_string(), last_processed_id);
        Ok(())
    }

    async fn master_record(&self, id: i64) -> Result<Option<MasterRecord>, StoreError> {
        Ok(self.state.lock().masters.get(&id).cloned())
    }

    async fn correct_birth_dates(
        &self,
        threshold: NaiveDate,
        mode: CorrectionMode,
    ) -> Result<Vec<BirthDateChange>, StoreError> {
        let mut state = self.state.lock();
        let mut changes = state
            .birth_dates
            .iter()
            .filter_map(|(id, date)| date.filter(|d| *d > threshold).map(|d| (*id, d)))
            .map(|(id, old)| {
                let new = shift_back_one_century(old).ok_or_else(|| {
                    StoreError::Integrity(format!("cannot shift birth date {old} of row {id}"))
                })?;
                Ok(BirthDateChange {
                    id,
                    master_item_id: id,
                    old_birth_date: old,
                    new_birth_date: new,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        changes.sort_by_key(|c| (c.old_birth_date, c.id));

        if mode == CorrectionMode::Commit {
            for change in &changes {
                state.birth_dates.insert(change.id, Some(change.new_birth_date));
            }
        }
        Ok(changes)
    }

    async fn enrichment_counts(&self) -> Result<EnrichmentCounts, StoreError> {
        let state = self.state.lock();
        let mut counts = EnrichmentCounts {
            total_records: state.masters.len() as u64,
            ..EnrichmentCounts::default()
        };
        for id in state.masters.keys() {
            let no_birth = !matches!(state.birth_dates.get(id), Some(Some(_)));
            let no_gender = !state.genders.contains_key(id);
            let no_language = !state.languages.contains_key(id);
            counts.missing_birth_date += u64::from(no_birth);
            counts.missing_gender += u64::from(no_gender);
            counts.missing_language += u64::from(no_language);
            counts.missing_gender_and_language += u64::from(no_gender && no_language);
        }
        Ok(counts)
    }

    async fn sample_missing_birth_dates(&self, limit: usize) -> Result<Vec<MasterRecord>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .masters
            .values()
            .filter(|r| !matches!(state.birth_dates.get(&r.id), Some(Some(_))))
            .take(limit)
            .cloned()
            .collect())
    }
}
