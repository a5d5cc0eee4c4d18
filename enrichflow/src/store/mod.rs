//! Store contract for master records and their derived attributes.
//!
//! The pipeline only talks to [`EnrichmentStore`]. [`SqliteStore`] is the
//! production implementation; [`InMemoryStore`] backs unit tests and supports
//! fault injection.

mod memory;
mod sqlite;

pub use memory::{CallLog, InMemoryStore};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::StoreError;
use crate::prediction::{Gender, Language};

/// A row of the master identity table. Never written by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRecord {
    /// Primary key.
    pub id: i64,
    /// Given names.
    pub full_name: String,
    /// Family name.
    pub surname: String,
    /// National identifier as captured upstream.
    pub raw_identifier: Option<String>,
}

impl MasterRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(
        id: i64,
        full_name: impl Into<String>,
        surname: impl Into<String>,
        raw_identifier: Option<&str>,
    ) -> Self {
        Self {
            id,
            full_name: full_name.into(),
            surname: surname.into(),
            raw_identifier: raw_identifier.map(String::from),
        }
    }

    /// Returns true if both name fields are non-blank after trimming.
    #[must_use]
    pub fn has_names(&self) -> bool {
        !self.full_name.trim().is_empty() && !self.surname.trim().is_empty()
    }
}

/// Which derived attribute a pipeline instance is filling in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Eligibility {
    /// No birth-date row, or a birth-date row whose date is still unset.
    MissingBirthDate,
    /// No gender row or no language row.
    MissingGenderOrLanguage,
}

impl Eligibility {
    /// Key under which this pipeline's watermark is persisted.
    #[must_use]
    pub const fn pipeline_name(self) -> &'static str {
        match self {
            Self::MissingBirthDate => "birthdates",
            Self::MissingGenderOrLanguage => "demographics",
        }
    }
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pipeline_name())
    }
}

/// One page request: rows with `id > after`, ascending, at most `limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery {
    /// Watermark; only keys strictly greater are returned.
    pub after: i64,
    /// Row ceiling.
    pub limit: usize,
    /// Missing-attribute predicate.
    pub eligibility: Eligibility,
}

/// A destination table for the set-based merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// `birth_dates`, keyed by the master id itself.
    BirthDates,
    /// `genders`, keyed by `master_item_id`.
    Genders,
    /// `languages`, keyed by `master_item_id`.
    Languages,
}

impl Destination {
    /// Table name in the relational schema.
    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::BirthDates => "birth_dates",
            Self::Genders => "genders",
            Self::Languages => "languages",
        }
    }
}

/// A watermark value to persist atomically with a page's writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkUpdate {
    /// Pipeline key.
    pub pipeline: String,
    /// Last processed master id.
    pub last_processed_id: i64,
}

/// All writes derived from one page. Applied in a single transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileBatch {
    /// `(master id, decoded date)` pairs.
    pub birth_dates: Vec<(i64, NaiveDate)>,
    /// `(master id, gender)` pairs.
    pub genders: Vec<(i64, Gender)>,
    /// `(master id, language)` pairs.
    pub languages: Vec<(i64, Language)>,
    /// Watermark to store alongside the writes.
    pub watermark: Option<WatermarkUpdate>,
}

impl ReconcileBatch {
    /// Returns true if there is nothing to write, watermark included.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.birth_dates.is_empty()
            && self.genders.is_empty()
            && self.languages.is_empty()
            && self.watermark.is_none()
    }

    /// Number of attribute rows submitted.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.birth_dates.len() + self.genders.len() + self.languages.len()
    }
}

/// Rows submitted and rows actually changed for one destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableWrite {
    /// Pairs submitted.
    pub submitted: u64,
    /// Rows inserted or updated. Identical values are not counted.
    pub written: u64,
}

/// Outcome of one reconcile call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertReport {
    /// Birth-date writes.
    pub birth_dates: TableWrite,
    /// Gender writes.
    pub genders: TableWrite,
    /// Language writes.
    pub languages: TableWrite,
}

impl UpsertReport {
    /// Total rows changed across all destinations.
    #[must_use]
    pub const fn total_written(&self) -> u64 {
        self.birth_dates.written + self.genders.written + self.languages.written
    }
}

/// One birth-date row touched by the correction pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BirthDateChange {
    /// Birth-date row id (equal to the master id).
    #[serde(rename = "Id")]
    pub id: i64,
    /// Owning master record.
    #[serde(rename = "MasterItemId")]
    pub master_item_id: i64,
    /// Stored value before the pass.
    #[serde(rename = "OldBirthDate")]
    pub old_birth_date: NaiveDate,
    /// Value after the pass.
    #[serde(rename = "NewBirthDate")]
    pub new_birth_date: NaiveDate,
}

/// Whether the correction transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrectionMode {
    /// Apply inside the transaction, then roll back.
    Rehearsal,
    /// Apply and commit.
    Commit,
}

impl CorrectionMode {
    /// Returns true for [`CorrectionMode::Rehearsal`].
    #[must_use]
    pub const fn is_rehearsal(self) -> bool {
        matches!(self, Self::Rehearsal)
    }
}

/// Enrichment coverage counts for the `report` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentCounts {
    /// Master records.
    pub total_records: u64,
    /// Records with no birth-date row or an unset date.
    pub missing_birth_date: u64,
    /// Records with no gender row.
    pub missing_gender: u64,
    /// Records with no language row.
    pub missing_language: u64,
    /// Records missing both gender and language.
    pub missing_gender_and_language: u64,
}

/// Read and write operations the pipeline needs from the relational store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EnrichmentStore: Send + Sync {
    /// Fetches the next page of eligible master records, ascending by id.
    ///
    /// Rows with blank names are excluded when the predicate requires names.
    async fn fetch_page(&self, query: PageQuery) -> Result<Vec<MasterRecord>, StoreError>;

    /// Applies a page's writes atomically. Identical values are no-ops.
    async fn reconcile(&self, batch: &ReconcileBatch) -> Result<UpsertReport, StoreError>;

    /// Reads the persisted watermark for `pipeline`.
    async fn load_watermark(&self, pipeline: &str) -> Result<Option<i64>, StoreError>;

    /// Stores a watermark outside of any page write.
    async fn save_watermark(&self, pipeline: &str, last_processed_id: i64) -> Result<(), StoreError>;

    /// Fetches one master record.
    async fn master_record(&self, id: i64) -> Result<Option<MasterRecord>, StoreError>;

    /// Shifts every birth date after `threshold` back one hundred years.
    ///
    /// Runs as a single transaction. Returns the change set ordered by old
    /// date then id. In [`CorrectionMode::Rehearsal`] nothing is committed.
    async fn correct_birth_dates(
        &self,
        threshold: NaiveDate,
        mode: CorrectionMode,
    ) -> Result<Vec<BirthDateChange>, StoreError>;

    /// Coverage counts.
    async fn enrichment_counts(&self) -> Result<EnrichmentCounts, StoreError>;

    /// Up to `limit` records still missing a birth date, ascending by id.
    async fn sample_missing_birth_dates(&self, limit: usize) -> Result<Vec<MasterRecord>, StoreError>;
}

/// Century offset applied by the correction pass.
pub const CORRECTION_MONTHS: u32 = 1200;

/// The corrected value for an implausible birth date.
///
/// February 29 maps to February 28 when the target year is not a leap year.
#[must_use]
pub fn shift_back_one_century(date: NaiveDate) -> Option<NaiveDate> {
    date.checked_sub_months(chrono::Months::new(CORRECTION_MONTHS))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_shift_back_one_century() {
        assert_eq!(shift_back_one_century(date(2009, 6, 1)), Some(date(1909, 6, 1)));
        assert_eq!(shift_back_one_century(date(2012, 2, 29)), Some(date(1912, 2, 29)));
        assert_eq!(shift_back_one_century(date(2000, 2, 29)), Some(date(1900, 2, 28)));
    }

    #[test]
    fn test_eligibility_names() {
        assert_eq!(Eligibility::MissingGenderOrLanguage.to_string(), "demographics");
        assert_eq!(Eligibility::MissingBirthDate.to_string(), "birthdates");
    }

    #[test]
    fn test_master_record_names() {
        assert!(MasterRecord::new(1, "Thandi", "Mokoena", None).has_names());
        assert!(!MasterRecord::new(2, "  ", "Mokoena", None).has_names());
        assert!(!MasterRecord::new(3, "Thandi", "", None).has_names());
    }

    #[test]
    fn test_batch_empty() {
        let mut batch = ReconcileBatch::default();
        assert!(batch.is_empty());
        batch.watermark = Some(WatermarkUpdate {
            pipeline: "demographics".into(),
            last_processed_id: 9,
        });
        assert!(!batch.is_empty());
        assert_eq!(batch.row_count(), 0);
    }
}
