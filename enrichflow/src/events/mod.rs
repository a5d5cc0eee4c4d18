//! Run lifecycle events.
//!
//! The driver and the correction pass report progress through an
//! [`EventSink`]. Event names are fixed strings from [`RunEvent`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Events emitted by enrichment and correction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunEvent {
    /// A pipeline run began.
    RunStarted,
    /// A page was read from the store.
    PageFetched,
    /// A page's writes committed (or were computed, in dry-run).
    PageReconciled,
    /// A fetch or reconcile failed; the page will be retried.
    PageStoreError,
    /// A pipeline run ended.
    RunCompleted,
    /// The correction pass finished.
    CorrectionCompleted,
}

impl RunEvent {
    /// Wire name of the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::PageFetched => "page.fetched",
            Self::PageReconciled => "page.reconciled",
            Self::PageStoreError => "page.store_error",
            Self::RunCompleted => "run.completed",
            Self::CorrectionCompleted => "correction.completed",
        }
    }
}

impl std::fmt::Display for RunEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
