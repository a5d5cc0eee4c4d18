//! Bounded-concurrency execution of independent units.
//!
//! Two admission policies are available:
//! - [`SchedulingStrategy::Chunked`]: groups of at most `concurrency` units,
//!   each group fully settled before the next is admitted, with a pause in
//!   between.
//! - [`SchedulingStrategy::Sliding`]: a new unit is admitted whenever one
//!   settles, keeping up to `concurrency` in flight.
//!
//! Either way, results come back in submission order and a panicking unit
//! becomes a [`UnitPanic`] without disturbing its siblings.

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::errors::ConfigError;

/// Admission policy for concurrent units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingStrategy {
    /// Fixed groups with a pause between them.
    #[default]
    Chunked,
    /// Sliding window.
    Sliding,
}

impl FromStr for SchedulingStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chunked" => Ok(Self::Chunked),
            "sliding" => Ok(Self::Sliding),
            other => Err(ConfigError::invalid(
                "pipeline.strategy",
                format!("expected 'chunked' or 'sliding', got '{other}'"),
            )),
        }
    }
}

impl fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chunked => f.write_str("chunked"),
            Self::Sliding => f.write_str("sliding"),
        }
    }
}

/// A unit that panicked instead of settling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPanic(pub String);

impl fmt::Display for UnitPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit panicked: {}", self.0)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Results of one scheduling pass.
#[derive(Debug)]
pub struct ScheduleOutcome<T> {
    /// One entry per admitted unit, in submission order.
    pub results: Vec<Result<T, UnitPanic>>,
    /// Units never admitted because the run was cancelled.
    pub not_started: usize,
}

impl<T> ScheduleOutcome<T> {
    /// Returns true if every submitted unit was run.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.not_started == 0
    }
}

/// Runs units with a hard ceiling on how many are in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduler {
    concurrency: usize,
    strategy: SchedulingStrategy,
    chunk_pause: Duration,
}

impl Scheduler {
    /// Creates a scheduler. A ceiling of zero is treated as one.
    #[must_use]
    pub fn new(concurrency: usize, strategy: SchedulingStrategy) -> Self {
        Self {
            concurrency: concurrency.max(1),
            strategy,
            chunk_pause: Duration::ZERO,
        }
    }

    /// Builds the scheduler used by the enrichment pipeline.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.concurrency, config.strategy).with_chunk_pause(config.chunk_pause())
    }

    /// Sets the pause between chunks.
    #[must_use]
    pub const fn with_chunk_pause(mut self, pause: Duration) -> Self {
        self.chunk_pause = pause;
        self
    }

    /// The concurrency ceiling.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// The admission policy.
    #[must_use]
    pub const fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Runs every unit to a terminal result, stopping admission early only
    /// if `cancel` fires.
    pub async fn run<I, Fut, T>(&self, units: I, cancel: &CancellationToken) -> ScheduleOutcome<T>
    where
        I: IntoIterator<Item = Fut>,
        Fut: Future<Output = T>,
    {
        let units: Vec<Fut> = units.into_iter().collect();
        let total = units.len();
        let results = match self.strategy {
            SchedulingStrategy::Chunked => self.run_chunked(units, cancel).await,
            SchedulingStrategy::Sliding => self.run_sliding(units, cancel).await,
        };
        ScheduleOutcome {
            not_started: total - results.len(),
            results,
        }
    }

    async fn run_chunked<Fut, T>(
        &self,
        units: Vec<Fut>,
        cancel: &CancellationToken,
    ) -> Vec<Result<T, UnitPanic>>
    where
        Fut: Future<Output = T>,
    {
        let total = units.len();
        let mut results = Vec::with_capacity(total);
        let mut pending = units.into_iter().peekable();
        let mut chunk_index = 0usize;

        while pending.peek().is_some() {
            chunk_index += 1;
            let chunk: Vec<_> = pending
                .by_ref()
                .take(self.concurrency)
                .map(|unit| AssertUnwindSafe(unit).catch_unwind())
                .collect();
            let settled = join_all(chunk).await;
            results.extend(
                settled
                    .into_iter()
                    .map(|r| r.map_err(|payload| UnitPanic(panic_message(payload.as_ref())))),
            );
            debug!(chunk = chunk_index, settled = results.len(), total, "Chunk settled");

            if pending.peek().is_some() {
                info!(
                    settled = results.len(),
                    total,
                    pause_ms = u64::try_from(self.chunk_pause.as_millis()).unwrap_or(u64::MAX),
                    "Chunk complete, pausing before next chunk"
                );
                if !cancel.sleep(self.chunk_pause).await {
                    info!(settled = results.len(), total, "Cancelled between chunks");
                    break;
                }
            }
        }
        results
    }

    async fn run_sliding<Fut, T>(
        &self,
        units: Vec<Fut>,
        cancel: &CancellationToken,
    ) -> Vec<Result<T, UnitPanic>>
    where
        Fut: Future<Output = T>,
    {
        stream::iter(units)
            .take_while(|_| futures::future::ready(!cancel.is_cancelled()))
            .map(|unit| AssertUnwindSafe(unit).catch_unwind())
            .buffered(self.concurrency)
            .map(|r| r.map_err(|payload| UnitPanic(panic_message(payload.as_ref()))))
            .collect()
            .await
    }
}
