//! # Enrichflow
//!
//! Resumable batch enrichment of identity records.
//!
//! Enrichflow walks a master identity table in pages and fills in derived
//! attributes:
//!
//! - **Birth dates** decoded from national identifier numbers
//! - **Gender and language** predicted from names by a language-model service
//! - **Century correction** of implausible birth dates, rehearsed or committed,
//!   with a CSV audit trail
//!
//! Each page is fetched strictly after a watermark, resolved with bounded
//! concurrency and retries, and written back in one idempotent set-based
//! transaction. Stopping at any point and running again neither skips nor
//! duplicates work.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use enrichflow::prelude::*;
//! use std::sync::Arc;
//!
//! let config = AppConfig::load(None)?;
//! let store = Arc::new(SqliteStore::connect(&config.database).await?);
//! let driver = PipelineDriver::new(
//!     store,
//!     BirthDateEnricher::default(),
//!     DriverSettings::from_config(&config.pipeline),
//! );
//! let stats = driver.run(&CancellationToken::new()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod cli;
pub mod config;
pub mod correction;
pub mod decoder;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod prediction;
pub mod store;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{AppConfig, CorrectionConfig, DatabaseConfig, PipelineConfig, PredictionConfig};
    pub use crate::correction::{CorrectionPass, CorrectionReport};
    pub use crate::decoder::{BirthDateDecoder, GenderFilter, IdMask};
    pub use crate::errors::{
        ConfigError, CorrectionError, DecodeError, EnrichflowError, PredictionError, RetryError,
        StoreError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        BirthDateEnricher, DemographicEnricher, DriverSettings, Enricher, PipelineDriver,
        RetryPolicy, RunStats, Scheduler, SchedulingStrategy, StopReason,
    };
    pub use crate::prediction::{Gender, Language, OpenAiPredictionClient, Prediction, PredictionClient};
    pub use crate::store::{CorrectionMode, EnrichmentStore, InMemoryStore, SqliteStore};
}
