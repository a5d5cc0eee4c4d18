//! Testing utilities for enrichflow pipelines.
//!
//! This module provides:
//! - A scripted prediction client with per-name failures and panics
//! - Master-record fixtures with valid identifiers
//! - A seeded in-memory SQLite store

mod fixtures;
mod mocks;

pub use fixtures::{identifier_for, master_records, seeded_sqlite_store};
pub use mocks::ScriptedPredictionClient;
