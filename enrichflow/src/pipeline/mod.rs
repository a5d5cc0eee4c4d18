//! Batch enrichment pipeline.
//!
//! This module provides:
//! - The retry envelope and backoff policies
//! - A bounded-concurrency scheduler (chunked or sliding)
//! - The watermark-driven batch cursor
//! - Enrichers that resolve a page into work units
//! - The reconciler that turns a page into one set-based write
//! - The page-loop driver and its run statistics

mod backfill;
mod cursor;
mod driver;
mod enricher;
mod reconcile;
mod retry;
mod scheduler;
mod stats;

#[cfg(test)]
mod integration_tests;

pub use backfill::{backfill_one, BackfillOutcome};
pub use cursor::{BatchCursor, CursorStep, Page};
pub use driver::{DriverSettings, PipelineDriver};
pub use enricher::{
    BirthDateEnricher, DemographicEnricher, Derived, Enricher, Outcome, PageResolution,
    SkipReason, WorkUnit,
};
pub use reconcile::Reconciler;
pub use retry::{with_retry, BackoffStrategy, JitterStrategy, RetryPolicy};
pub use scheduler::{ScheduleOutcome, Scheduler, SchedulingStrategy, UnitPanic};
pub use stats::{PageSummary, RunStats, StopReason};
