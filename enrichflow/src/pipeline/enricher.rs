//! Per-record resolution for the two enrichment pipelines.
//!
//! An [`Enricher`] turns a fetched page of [`MasterRecord`]s into
//! [`WorkUnit`]s, each carrying exactly one terminal [`Outcome`]. Per-row
//! failures never escape as errors; they are tagged outcomes.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use super::retry::{with_retry, RetryPolicy};
use super::scheduler::{Scheduler, UnitPanic};
use crate::cancellation::CancellationToken;
use crate::decoder::BirthDateDecoder;
use crate::errors::FailureInfo;
use crate::prediction::{Prediction, PredictionClient};
use crate::store::{Eligibility, MasterRecord};

/// A value derived for one record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Derived {
    /// Decoded from the identifier.
    BirthDate(NaiveDate),
    /// Returned by the prediction service.
    Demographics(Prediction),
}

/// Why a record was passed over without an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// First name or surname is blank.
    BlankName,
    /// No identifier to decode.
    MissingIdentifier,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlankName => f.write_str("blank name"),
            Self::MissingIdentifier => f.write_str("missing identifier"),
        }
    }
}

/// Terminal state of one work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// A value to reconcile.
    Succeeded(Derived),
    /// Gave up on this record for this run.
    Failed(FailureInfo),
    /// Not attempted.
    Skipped(SkipReason),
}

impl Outcome {
    /// Returns true for [`Outcome::Succeeded`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}

/// One master record in flight through a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Master record key.
    pub id: i64,
    /// Given names.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Terminal outcome.
    pub outcome: Outcome,
}

impl WorkUnit {
    /// Creates a unit for `record` with its outcome.
    #[must_use]
    pub fn resolved(record: &MasterRecord, outcome: Outcome) -> Self {
        Self {
            id: record.id,
            first_name: record.full_name.clone(),
            last_name: record.surname.clone(),
            outcome,
        }
    }
}

/// Units produced for one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageResolution {
    /// One unit per record that was admitted, in page order.
    pub units: Vec<WorkUnit>,
    /// Records left unresolved because the run was cancelled mid-page.
    pub not_started: usize,
}

impl PageResolution {
    /// Returns true if every record on the page has a unit.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.not_started == 0
    }
}

/// Derives one kind of attribute for the records of a page.
#[async_trait]
pub trait Enricher: Send + Sync {
    /// The predicate selecting records this enricher fills in.
    fn eligibility(&self) -> Eligibility;

    /// Resolves every record on the page to a terminal outcome.
    async fn resolve_page(
        &self,
        records: &[MasterRecord],
        cancel: &CancellationToken,
    ) -> PageResolution;
}

/// Decodes birth dates from identifiers. No I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct BirthDateEnricher {
    decoder: BirthDateDecoder,
}

impl BirthDateEnricher {
    /// Creates an enricher using `decoder`.
    #[must_use]
    pub const fn new(decoder: BirthDateDecoder) -> Self {
        Self { decoder }
    }

    /// Outcome for a single record.
    #[must_use]
    pub fn resolve(&self, record: &MasterRecord) -> Outcome {
        let Some(raw) = record
            .raw_identifier
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
        else {
            return Outcome::Skipped(SkipReason::MissingIdentifier);
        };
        match self.decoder.decode(raw) {
            Ok(date) => Outcome::Succeeded(Derived::BirthDate(date)),
            Err(e) => {
                debug!(id = record.id, error = %e, "Identifier not decodable");
                Outcome::Failed(FailureInfo::from(&e))
            }
        }
    }
}

#[async_trait]
impl Enricher for BirthDateEnricher {
    fn eligibility(&self) -> Eligibility {
        Eligibility::MissingBirthDate
    }

    async fn resolve_page(
        &self,
        records: &[MasterRecord],
        _cancel: &CancellationToken,
    ) -> PageResolution {
        PageResolution {
            units: records
                .iter()
                .map(|record| WorkUnit::resolved(record, self.resolve(record)))
                .collect(),
            not_started: 0,
        }
    }
}

/// Predicts gender and language through the prediction service.
///
/// Calls fan out through the [`Scheduler`], each wrapped in the retry
/// envelope.
pub struct DemographicEnricher<C> {
    client: C,
    policy: RetryPolicy,
    scheduler: Scheduler,
}

impl<C: PredictionClient> DemographicEnricher<C> {
    /// Creates an enricher.
    #[must_use]
    pub const fn new(client: C, policy: RetryPolicy, scheduler: Scheduler) -> Self {
        Self {
            client,
            policy,
            scheduler,
        }
    }

    /// Outcome for a single record, retries included.
    pub async fn resolve(&self, record: &MasterRecord) -> Outcome {
        if !record.has_names() {
            return Outcome::Skipped(SkipReason::BlankName);
        }
        let key = record.id.to_string();
        let result = with_retry(&self.policy, &key, || {
            self.client.predict(&record.full_name, &record.surname)
        })
        .await;

        match result {
            Ok(prediction) => {
                if !prediction.confidence_in_range() {
                    warn!(
                        id = record.id,
                        confidence = prediction.confidence,
                        "Confidence outside [0, 1]"
                    );
                }
                Outcome::Succeeded(Derived::Demographics(prediction))
            }
            Err(e) => {
                warn!(id = record.id, error = %e, "Prediction failed");
                Outcome::Failed(FailureInfo::from(&e).with_context_entry("id", key))
            }
        }
    }
}

impl<C> fmt::Debug for DemographicEnricher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DemographicEnricher")
            .field("policy", &self.policy)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C: PredictionClient> Enricher for DemographicEnricher<C> {
    fn eligibility(&self) -> Eligibility {
        Eligibility::MissingGenderOrLanguage
    }

    async fn resolve_page(
        &self,
        records: &[MasterRecord],
        cancel: &CancellationToken,
    ) -> PageResolution {
        let outcome = self
            .scheduler
            .run(records.iter().map(|record| self.resolve(record)), cancel)
            .await;

        let units = records
            .iter()
            .zip(outcome.results)
            .map(|(record, result)| {
                let outcome = result.unwrap_or_else(|UnitPanic(message)| {
                    warn!(id = record.id, %message, "Prediction unit panicked");
                    Outcome::Failed(
                        FailureInfo::new("UNIT_PANIC", message)
                            .with_context_entry("id", record.id.to_string()),
                    )
                });
                WorkUnit::resolved(record, outcome)
            })
            .collect();

        PageResolution {
            units,
            not_started: outcome.not_started,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PredictionError;
    use crate::pipeline::SchedulingStrategy;
    use crate::prediction::{Gender, Language, MockPredictionClient};
    use crate::testing::ScriptedPredictionClient;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn record(id: i64, first: &str, last: &str, raw: Option<&str>) -> MasterRecord {
        MasterRecord::new(id, first, last, raw)
    }

    fn enricher<C: PredictionClient>(client: C) -> DemographicEnricher<C> {
        DemographicEnricher::new(
            client,
            RetryPolicy::default()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(1)),
            Scheduler::new(4, SchedulingStrategy::Chunked),
        )
    }

    #[test]
    fn test_birth_date_outcomes() {
        let enricher = BirthDateEnricher::new(BirthDateDecoder::with_pivot(25));

        assert_eq!(
            enricher.resolve(&record(1, "A", "B", Some("9704201234083"))),
            Outcome::Succeeded(Derived::BirthDate(
                NaiveDate::from_ymd_opt(1997, 4, 20).unwrap()
            ))
        );
        assert_eq!(
            enricher.resolve(&record(2, "A", "B", Some("  "))),
            Outcome::Skipped(SkipReason::MissingIdentifier)
        );
        assert_eq!(
            enricher.resolve(&record(3, "A", "B", None)),
            Outcome::Skipped(SkipReason::MissingIdentifier)
        );

        let Outcome::Failed(info) = enricher.resolve(&record(4, "A", "B", Some("023099xx"))) else {
            panic!("expected failure");
        };
        assert_eq!(info.code, "INVALID_DATE");
    }

    #[tokio::test]
    async fn test_birth_date_page_keeps_order() {
        let enricher = BirthDateEnricher::new(BirthDateDecoder::with_pivot(25));
        let records = vec![
            record(5, "A", "B", Some("0001015000088")),
            record(9, "A", "B", Some("no digits")),
        ];
        let page = enricher
            .resolve_page(&records, &CancellationToken::new())
            .await;
        assert!(page.is_complete());
        assert_eq!(page.units.iter().map(|u| u.id).collect::<Vec<_>>(), vec![5, 9]);
        assert!(page.units[0].outcome.is_success());
        assert!(matches!(&page.units[1].outcome, Outcome::Failed(info) if info.code == "NO_DIGIT_BLOCK"));
    }

    #[tokio::test]
    async fn test_blank_name_skipped_without_call() {
        let mut client = MockPredictionClient::new();
        client.expect_predict().never();

        let outcome = enricher(client).resolve(&record(1, " ", "Dube", None)).await;
        assert_eq!(outcome, Outcome::Skipped(SkipReason::BlankName));
    }

    #[tokio::test]
    async fn test_transient_failures_retried_to_success() {
        let client = ScriptedPredictionClient::new()
            .with_failures("Thabo", 2, PredictionError::TransportError("503".into()));

        let outcome = enricher(&client).resolve(&record(1, "Thabo", "Nkosi", None)).await;
        assert!(outcome.is_success());
        assert_eq!(client.calls_for("Thabo"), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_become_failed_unit() {
        let mut client = MockPredictionClient::new();
        client
            .expect_predict()
            .times(3)
            .returning(|_, _| Err(PredictionError::MalformedResponse("{".into())));

        let outcome = enricher(client).resolve(&record(7, "Lerato", "Dube", None)).await;
        let Outcome::Failed(info) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(info.code, "RETRIES_EXHAUSTED");
        assert_eq!(info.context.get("attempts").map(String::as_str), Some("3"));
        assert_eq!(info.context.get("id").map(String::as_str), Some("7"));
    }

    #[tokio::test]
    async fn test_panicking_call_isolated_from_page() {
        let client = ScriptedPredictionClient::new()
            .with_prediction(
                "Anna",
                Prediction::new(Language::Afrikaans, Gender::Female, 0.9),
            )
            .with_panic("Boom");

        let records = vec![
            record(1, "Anna", "Botha", None),
            record(2, "Boom", "Botha", None),
            record(3, "Anna", "Smit", None),
        ];
        let page = enricher(&client)
            .resolve_page(&records, &CancellationToken::new())
            .await;

        assert_eq!(page.units.len(), 3);
        assert!(page.units[0].outcome.is_success());
        assert!(matches!(&page.units[1].outcome, Outcome::Failed(info) if info.code == "UNIT_PANIC"));
        assert!(page.units[2].outcome.is_success());
    }
}
