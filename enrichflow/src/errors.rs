//! Error types for the enrichflow pipeline.
//!
//! Per-row failures ([`DecodeError`], [`PredictionError`], [`RetryError`]) are
//! contained by the pipeline and become tagged outcomes. Only store and
//! configuration failures are allowed to end a run.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for enrichflow operations.
#[derive(Debug, Error)]
pub enum EnrichflowError {
    /// A configuration error occurred.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A store error that could not be recovered by the page-level cooldown.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The correction pass failed.
    #[error("{0}")]
    Correction(#[from] CorrectionError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to derive a birth date from a raw identifier.
///
/// Both variants are permanent: the row is left unenriched and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The identifier has no run of six consecutive digits.
    #[error("No six-digit block in identifier '{raw}'")]
    NoDigitBlock {
        /// The identifier as stored.
        raw: String,
    },

    /// The six-digit block is not a real calendar date.
    #[error("Six-digit block '{block}' is not a valid date")]
    InvalidDate {
        /// The `YYMMDD` block that failed validation.
        block: String,
    },
}

impl DecodeError {
    /// Short machine-readable code for logs and statistics.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NoDigitBlock { .. } => "NO_DIGIT_BLOCK",
            Self::InvalidDate { .. } => "INVALID_DATE",
        }
    }
}

/// Failure of a single prediction call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PredictionError {
    /// First or last name is blank. Permanent.
    #[error("Missing first name or last name")]
    EmptyInput,

    /// The service answered, but not with the expected schema. Transient.
    #[error("Malformed prediction response: {0}")]
    MalformedResponse(String),

    /// Network, timeout or service fault. Transient.
    #[error("Prediction transport error: {0}")]
    TransportError(String),
}

impl PredictionError {
    /// Returns true if the retry envelope should try again.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::EmptyInput)
    }

    /// Short machine-readable code for logs and statistics.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::EmptyInput => "EMPTY_INPUT",
            Self::MalformedResponse(_) => "MALFORMED_RESPONSE",
            Self::TransportError(_) => "TRANSPORT_ERROR",
        }
    }
}

impl From<reqwest::Error> for PredictionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::MalformedResponse(err.to_string())
        } else {
            Self::TransportError(err.to_string())
        }
    }
}

/// Errors that know whether they are worth retrying.
pub trait Retryable {
    /// Returns true for transient faults.
    fn is_transient(&self) -> bool;
}

impl Retryable for PredictionError {
    fn is_transient(&self) -> bool {
        Self::is_transient(self)
    }
}

/// Terminal failure produced by the retry envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError<E> {
    /// The error was not retryable; returned after the first attempt.
    #[error("{0}")]
    Permanent(E),

    /// Every attempt failed with a transient error.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The error from the final attempt.
        last: E,
    },
}

/// Store-level faults. These abort the current page and trigger a cooldown.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not open or acquire a connection.
    #[error("Store connection error: {0}")]
    Connection(String),

    /// A statement failed; the enclosing transaction was rolled back.
    #[error("Store statement error: {0}")]
    Statement(#[source] sqlx::Error),

    /// The store returned data that violates an invariant.
    #[error("Store integrity error: {0}")]
    Integrity(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Connection(err.to_string())
            }
            other => Self::Statement(other),
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required credential is absent.
    #[error("Missing credential: {0}")]
    MissingCredential(String),

    /// A value failed validation.
    #[error("Invalid configuration: {field} - {reason}")]
    Invalid {
        /// Offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for [`crate::config::AppConfig`].
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    /// Creates an invalid-value error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the birth-date correction pass.
#[derive(Debug, Error)]
pub enum CorrectionError {
    /// The transaction failed and was rolled back.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// A live run was requested without confirmation.
    #[error("Live correction run was not confirmed")]
    NotConfirmed,

    /// The audit export could not be written.
    #[error("Failed to write correction export: {0}")]
    Export(String),
}

impl From<csv::Error> for CorrectionError {
    fn from(err: csv::Error) -> Self {
        Self::Export(err.to_string())
    }
}

impl From<std::io::Error> for CorrectionError {
    fn from(err: std::io::Error) -> Self {
        Self::Export(err.to_string())
    }
}

/// Serializable description of a per-row failure, used in run statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Machine-readable code (e.g. `RETRIES_EXHAUSTED`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl FailureInfo {
    /// Creates a new failure description.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
        }
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

impl From<&DecodeError> for FailureInfo {
    fn from(err: &DecodeError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<&RetryError<PredictionError>> for FailureInfo {
    fn from(err: &RetryError<PredictionError>) -> Self {
        match err {
            RetryError::Permanent(inner) => Self::new(inner.code(), inner.to_string()),
            RetryError::RetriesExhausted { attempts, last } => {
                Self::new("RETRIES_EXHAUSTED", err.to_string())
                    .with_context_entry("attempts", attempts.to_string())
                    .with_context_entry("last_error", last.code())
            }
        }
    }
}
