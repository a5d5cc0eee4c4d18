//! Birth-date century correction.
//!
//! Dates after a plausibility threshold were decoded into the wrong century.
//! The pass shifts each one back 100 years inside a single store
//! transaction, writes a CSV audit trail of every row touched, and either
//! commits or rolls back depending on the [`CorrectionMode`].

use chrono::{DateTime, Local, NaiveDate};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::CorrectionConfig;
use crate::errors::CorrectionError;
use crate::events::{EventSink, NoOpEventSink, RunEvent};
use crate::store::{BirthDateChange, CorrectionMode, EnrichmentStore};

/// Base name of the audit export.
pub const EXPORT_STEM: &str = "birth_date_corrections";

/// Marker prefixed to rehearsal exports.
pub const DRY_RUN_MARKER: &str = "DRYRUN_";

/// Result of one correction pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionReport {
    /// Whether the transaction was committed.
    pub mode: CorrectionMode,
    /// Every row touched, ascending by old date then id.
    pub changes: Vec<BirthDateChange>,
    /// Where the audit CSV was written, if there was anything to write.
    pub export_path: Option<PathBuf>,
}

/// File name for an export taken at `at`.
#[must_use]
pub fn export_file_name(mode: CorrectionMode, at: DateTime<Local>) -> String {
    let marker = if mode.is_rehearsal() { DRY_RUN_MARKER } else { "" };
    format!("{marker}{EXPORT_STEM}_{}.csv", at.format("%Y%m%d_%H%M%S"))
}

/// Orders changes for export: ascending old date, then id.
pub fn sort_changes(changes: &mut [BirthDateChange]) {
    changes.sort_by_key(|c| (c.old_birth_date, c.id));
}

/// Writes `changes` as CSV with an `Id,MasterItemId,OldBirthDate,NewBirthDate` header.
pub fn write_changes<W: Write>(writer: W, changes: &[BirthDateChange]) -> Result<(), CorrectionError> {
    let mut csv = csv::Writer::from_writer(writer);
    if changes.is_empty() {
        csv.write_record(["Id", "MasterItemId", "OldBirthDate", "NewBirthDate"])?;
    }
    for change in changes {
        csv.serialize(change)?;
    }
    csv.flush()?;
    Ok(())
}

/// Runs the correction transaction against a store.
pub struct CorrectionPass<S: ?Sized> {
    store: Arc<S>,
    threshold: NaiveDate,
    export_dir: PathBuf,
    events: Arc<dyn EventSink>,
}

impl<S: EnrichmentStore + ?Sized> CorrectionPass<S> {
    /// Creates a pass with the configured threshold and export directory.
    #[must_use]
    pub fn new(store: Arc<S>, config: &CorrectionConfig) -> Self {
        Self {
            store,
            threshold: config.threshold,
            export_dir: config.export_dir.clone(),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Runs the transaction, then exports the change set.
    ///
    /// The store applies all shifts or none. In rehearsal mode the store is
    /// left as it was; the export still lists every row that would change.
    /// No file is written when nothing is above the threshold.
    pub async fn run(&self, mode: CorrectionMode) -> Result<CorrectionReport, CorrectionError> {
        let mut changes = self.store.correct_birth_dates(self.threshold, mode).await?;
        sort_changes(&mut changes);

        let export_path = if changes.is_empty() {
            None
        } else {
            let path = self.export_dir.join(export_file_name(mode, Local::now()));
            let file = BufWriter::new(File::create(&path)?);
            write_changes(file, &changes)?;
            Some(path)
        };

        info!(
            threshold = %self.threshold,
            rows = changes.len(),
            rehearsal = mode.is_rehearsal(),
            export = ?export_path,
            "Birth-date correction finished"
        );
        self.events
            .emit(
                RunEvent::CorrectionCompleted.as_str(),
                Some(serde_json::json!({
                    "threshold": self.threshold.to_string(),
                    "rows": changes.len(),
                    "committed": !mode.is_rehearsal(),
                    "export_path": export_path.as_ref().map(|p| p.display().to_string()),
                })),
            )
            .await;

        Ok(CorrectionReport {
            mode,
            changes,
            export_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::store::{InMemoryStore, MasterRecord};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn change(id: i64, old: NaiveDate, new: NaiveDate) -> BirthDateChange {
        BirthDateChange {
            id,
            master_item_id: id,
            old_birth_date: old,
            new_birth_date: new,
        }
    }

    fn store_with_dates(dates: &[(i64, NaiveDate)]) -> Arc<InMemoryStore> {
        let store = InMemoryStore::with_records(
            dates.iter().map(|(id, _)| MasterRecord::new(*id, "A", "B", None)),
        );
        for (id, d) in dates {
            store.put_birth_date(*id, Some(*d));
        }
        Arc::new(store)
    }

    #[test]
    fn test_export_file_name_marks_rehearsal() {
        let at = Local.with_ymd_and_hms(2026, 10, 15, 9, 30, 5).unwrap();
        assert_eq!(
            export_file_name(CorrectionMode::Rehearsal, at),
            "DRYRUN_birth_date_corrections_20261015_093005.csv"
        );
        assert_eq!(
            export_file_name(CorrectionMode::Commit, at),
            "birth_date_corrections_20261015_093005.csv"
        );
    }

    #[test]
    fn test_csv_is_sorted_and_reproducible() {
        let mut changes = vec![
            change(9, date(2010, 1, 1), date(1910, 1, 1)),
            change(3, date(2009, 6, 1), date(1909, 6, 1)),
            change(1, date(2010, 1, 1), date(1910, 1, 1)),
        ];
        sort_changes(&mut changes);

        let mut first = Vec::new();
        write_changes(&mut first, &changes).unwrap();
        let mut second = Vec::new();
        write_changes(&mut second, &changes).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            String::from_utf8(first).unwrap(),
            "Id,MasterItemId,OldBirthDate,NewBirthDate\n\
             3,3,2009-06-01,1909-06-01\n\
             1,1,2010-01-01,1910-01-01\n\
             9,9,2010-01-01,1910-01-01\n"
        );
    }

    #[test]
    fn test_empty_export_has_header() {
        let mut out = Vec::new();
        write_changes(&mut out, &[]).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Id,MasterItemId,OldBirthDate,NewBirthDate\n"
        );
    }

    #[tokio::test]
    async fn test_rehearsal_exports_without_changing_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_dates(&[(1, date(2009, 6, 1)), (2, date(1985, 3, 3))]);
        let config = CorrectionConfig {
            threshold: date(2008, 2, 23),
            export_dir: dir.path().to_path_buf(),
        };
        let events = Arc::new(CollectingEventSink::new());

        let report = CorrectionPass::new(store.clone(), &config)
            .with_event_sink(events.clone())
            .run(CorrectionMode::Rehearsal)
            .await
            .unwrap();

        assert_eq!(report.changes, vec![change(1, date(2009, 6, 1), date(1909, 6, 1))]);
        assert_eq!(store.birth_date(1), Some(date(2009, 6, 1)));

        let path = report.export_path.unwrap();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("DRYRUN_birth_date_corrections_"));
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("1,1,2009-06-01,1909-06-01"));

        let emitted = events.events_of_type("correction.completed");
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].1.as_ref().unwrap()["committed"], false);
    }

    #[tokio::test]
    async fn test_commit_applies_and_second_pass_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_dates(&[(4, date(2012, 2, 29)), (5, date(2009, 1, 1))]);
        let config = CorrectionConfig {
            threshold: date(2008, 2, 23),
            export_dir: dir.path().to_path_buf(),
        };
        let pass = CorrectionPass::new(store.clone(), &config);

        let report = pass.run(CorrectionMode::Commit).await.unwrap();
        assert_eq!(report.changes.len(), 2);
        assert_eq!(report.changes[0].id, 5);
        assert_eq!(store.birth_date(4), Some(date(1912, 2, 29)));
        assert_eq!(store.birth_date(5), Some(date(1909, 1, 1)));

        let again = pass.run(CorrectionMode::Commit).await.unwrap();
        assert!(again.changes.is_empty());
        assert_eq!(again.export_path, None);
    }
}
