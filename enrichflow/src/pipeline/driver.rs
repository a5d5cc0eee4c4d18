//! The page loop.
//!
//! ```text
//! Fetching -> Dispatching -> Reconciling -> Advancing -> (Fetching | Done)
//! Fetching -> BudgetExhausted -> Done
//! Fetching | Reconciling -> StoreError -> (cooldown) -> Fetching
//! ```
//!
//! The watermark is a plain value threaded through the loop. It moves only in
//! `Advancing`, after the page's writes have committed. A store error sends
//! the loop back to `Fetching` with the watermark unchanged, so the same page
//! is read again.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::cursor::{BatchCursor, CursorStep, Page};
use super::enricher::{Enricher, WorkUnit};
use super::reconcile::Reconciler;
use super::stats::{PageSummary, RunStats, StopReason};
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::errors::{EnrichflowError, StoreError};
use crate::events::{EventSink, NoOpEventSink, RunEvent};
use crate::store::{EnrichmentStore, UpsertReport, WatermarkUpdate};

/// Loop timing and failure limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    /// Rows per page.
    pub page_size: usize,
    /// Total rows to fetch across the run.
    pub max_records: Option<u64>,
    /// Compute writes without applying them.
    pub dry_run: bool,
    /// Read and write the watermark in the store.
    pub persist_watermark: bool,
    /// Ignore any persisted watermark and start at key 0.
    pub from_start: bool,
    /// Pause after each reconciled page.
    pub inter_page_pause: Duration,
    /// Pause after a store error before fetching again.
    pub store_error_cooldown: Duration,
    /// Consecutive store errors tolerated before the run fails.
    pub max_consecutive_store_errors: u32,
}

impl DriverSettings {
    /// Settings from the pipeline section of the configuration.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            page_size: config.page_size,
            max_records: config.max_records,
            dry_run: config.dry_run,
            persist_watermark: config.persist_watermark,
            from_start: false,
            inter_page_pause: config.inter_page_pause(),
            store_error_cooldown: config.store_error_cooldown(),
            max_consecutive_store_errors: config.max_consecutive_store_errors.max(1),
        }
    }

    /// Ignores the persisted watermark.
    #[must_use]
    pub const fn with_from_start(mut self, from_start: bool) -> Self {
        self.from_start = from_start;
        self
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

enum DriverState {
    Fetching,
    Dispatching(Page),
    Reconciling {
        page: Page,
        units: Vec<WorkUnit>,
    },
    Advancing {
        page: Page,
        units: Vec<WorkUnit>,
        upserted: UpsertReport,
    },
    StoreError(StoreError),
    BudgetExhausted,
    Done(StopReason),
}

/// Drives one enrichment pipeline to completion.
pub struct PipelineDriver<S: ?Sized, E> {
    store: Arc<S>,
    enricher: E,
    settings: DriverSettings,
    events: Arc<dyn EventSink>,
}

impl<S, E> PipelineDriver<S, E>
where
    S: EnrichmentStore + ?Sized,
    E: Enricher,
{
    /// Creates a driver.
    #[must_use]
    pub fn new(store: Arc<S>, enricher: E, settings: DriverSettings) -> Self {
        Self {
            store,
            enricher,
            settings,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Runs pages until the cursor is exhausted, the budget is used up, or
    /// `cancel` fires.
    ///
    /// Per-row failures are counted in the returned [`RunStats`]. Only a run
    /// of consecutive store errors longer than the configured limit, or a
    /// failure to read or reset the persisted watermark, ends the run with an
    /// error.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunStats, EnrichflowError> {
        let run_id = Uuid::now_v7().to_string();
        let pipeline = self.enricher.eligibility().pipeline_name();
        let span = info_span!("enrichment_run", run_id = %run_id, pipeline);
        self.run_loop(run_id, cancel).instrument(span).await
    }

    async fn run_loop(
        &self,
        run_id: String,
        cancel: &CancellationToken,
    ) -> Result<RunStats, EnrichflowError> {
        let started = Instant::now();
        let settings = self.settings;
        let eligibility = self.enricher.eligibility();
        let pipeline = eligibility.pipeline_name();
        let cursor = BatchCursor::new(eligibility, settings.page_size)
            .with_budget(settings.max_records);
        let reconciler = Reconciler::new(settings.dry_run);

        let start_watermark = self.start_watermark().await?;
        let mut stats = RunStats::new(run_id.clone(), pipeline, start_watermark);
        stats.dry_run = settings.dry_run;

        info!(
            start_watermark,
            page_size = settings.page_size,
            max_records = ?settings.max_records,
            dry_run = settings.dry_run,
            "Enrichment run started"
        );
        self.events
            .emit(
                RunEvent::RunStarted.as_str(),
                Some(serde_json::json!({
                    "run_id": run_id,
                    "pipeline": pipeline,
                    "start_watermark": start_watermark,
                    "dry_run": settings.dry_run,
                })),
            )
            .await;

        let mut watermark = start_watermark;
        let mut processed: u64 = 0;
        let mut page_number: u64 = 0;
        let mut consecutive_errors: u32 = 0;
        let mut state = DriverState::Fetching;

        let stop_reason = loop {
            state = match state {
                DriverState::Fetching => {
                    if cancel.is_cancelled() {
                        DriverState::Done(StopReason::Cancelled)
                    } else {
                        match cursor.next_page(self.store.as_ref(), watermark, processed).await {
                            Ok(CursorStep::Page(page)) => {
                                debug!(
                                    page = page_number + 1,
                                    watermark,
                                    fetched = page.len(),
                                    "Page fetched"
                                );
                                self.events
                                    .emit(
                                        RunEvent::PageFetched.as_str(),
                                        Some(serde_json::json!({
                                            "page": page_number + 1,
                                            "watermark": watermark,
                                            "fetched": page.len(),
                                        })),
                                    )
                                    .await;
                                DriverState::Dispatching(page)
                            }
                            Ok(CursorStep::Exhausted) => DriverState::Done(StopReason::Exhausted),
                            Ok(CursorStep::BudgetReached) => DriverState::BudgetExhausted,
                            Err(e) => DriverState::StoreError(e),
                        }
                    }
                }

                DriverState::Dispatching(page) => {
                    let resolution = self.enricher.resolve_page(&page.records, cancel).await;
                    if resolution.is_complete() {
                        DriverState::Reconciling {
                            page,
                            units: resolution.units,
                        }
                    } else {
                        info!(
                            watermark,
                            resolved = resolution.units.len(),
                            not_started = resolution.not_started,
                            "Cancelled mid-page, page discarded"
                        );
                        DriverState::Done(StopReason::Cancelled)
                    }
                }

                DriverState::Reconciling { page, units } => {
                    let update = settings.persist_watermark.then(|| WatermarkUpdate {
                        pipeline: pipeline.to_string(),
                        last_processed_id: page.last_id,
                    });
                    let batch = Reconciler::build_batch(&units, update);
                    match reconciler.apply(self.store.as_ref(), &batch).await {
                        Ok(upserted) => DriverState::Advancing {
                            page,
                            units,
                            upserted,
                        },
                        Err(e) => DriverState::StoreError(e),
                    }
                }

                DriverState::Advancing {
                    page,
                    units,
                    upserted,
                } => {
                    page_number += 1;
                    consecutive_errors = 0;
                    let summary = PageSummary::tally(page_number, watermark, page.last_id, &units)
                        .with_upserted(upserted, settings.dry_run);
                    stats.record_page(&summary, &units);
                    watermark = page.last_id;
                    processed += page.len() as u64;

                    info!(
                        page = page_number,
                        watermark,
                        fetched = summary.fetched,
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        skipped = summary.skipped,
                        upserted_birth_dates = upserted.birth_dates.written,
                        upserted_genders = upserted.genders.written,
                        upserted_languages = upserted.languages.written,
                        dry_run = settings.dry_run,
                        "Page reconciled"
                    );
                    self.events
                        .emit(
                            RunEvent::PageReconciled.as_str(),
                            serde_json::to_value(summary).ok(),
                        )
                        .await;

                    if cursor.limit(processed).is_none() {
                        DriverState::BudgetExhausted
                    } else if cancel.sleep(settings.inter_page_pause).await {
                        DriverState::Fetching
                    } else {
                        DriverState::Done(StopReason::Cancelled)
                    }
                }

                DriverState::StoreError(e) => {
                    consecutive_errors += 1;
                    stats.record_store_error();
                    self.events
                        .emit(
                            RunEvent::PageStoreError.as_str(),
                            Some(serde_json::json!({
                                "watermark": watermark,
                                "error": e.to_string(),
                                "consecutive": consecutive_errors,
                            })),
                        )
                        .await;

                    if consecutive_errors >= settings.max_consecutive_store_errors {
                        error!(
                            watermark,
                            consecutive_errors,
                            error = %e,
                            "Store errors exceeded limit, stopping run"
                        );
                        return Err(EnrichflowError::Store(e));
                    }
                    warn!(
                        watermark,
                        consecutive_errors,
                        cooldown_ms = u64::try_from(settings.store_error_cooldown.as_millis())
                            .unwrap_or(u64::MAX),
                        error = %e,
                        "Store error, page will be retried after cooldown"
                    );
                    if cancel.sleep(settings.store_error_cooldown).await {
                        DriverState::Fetching
                    } else {
                        DriverState::Done(StopReason::Cancelled)
                    }
                }

                DriverState::BudgetExhausted => {
                    info!(processed, "Record budget reached");
                    DriverState::Done(StopReason::BudgetReached)
                }

                DriverState::Done(reason) => break reason,
            };
        };

        if stop_reason == StopReason::Exhausted
            && settings.persist_watermark
            && !settings.dry_run
        {
            // Rows that failed this run are behind the watermark; start over next time.
            self.store.save_watermark(pipeline, 0).await?;
        }

        stats.stop_reason = Some(stop_reason);
        stats.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            pages = stats.pages,
            fetched = stats.fetched,
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            store_errors = stats.store_errors,
            final_watermark = stats.final_watermark,
            stop_reason = %stop_reason,
            "Enrichment run completed"
        );
        self.events
            .emit(RunEvent::RunCompleted.as_str(), Some(stats.summary_json()))
            .await;
        Ok(stats)
    }

    async fn start_watermark(&self) -> Result<i64, StoreError> {
        if !self.settings.persist_watermark || self.settings.from_start {
            return Ok(0);
        }
        let pipeline = self.enricher.eligibility().pipeline_name();
        let stored = self.store.load_watermark(pipeline).await?;
        if let Some(watermark) = stored {
            info!(watermark, "Resuming from persisted watermark");
        }
        Ok(stored.unwrap_or(0))
    }
}
