//! Run configuration.
//!
//! Values are layered, later layers winning:
//! 1. Built-in defaults
//! 2. Optional TOML file
//! 3. Environment variables (`ENRICHFLOW_*`, `OPENAI_API_KEY`)
//! 4. Command-line flags (applied by the binary through `cli::RunArgs`)

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;
use crate::pipeline::{BackoffStrategy, JitterStrategy, SchedulingStrategy};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Store connection settings.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Prediction service settings.
    #[serde(default)]
    pub prediction: PredictionConfig,
    /// Enrichment loop settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Birth-date correction settings.
    #[serde(default)]
    pub correction: CorrectionConfig,
}

impl AppConfig {
    /// Loads defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_toml_str(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML document. Missing sections and keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Overrides values from environment-style lookups.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("ENRICHFLOW_DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.prediction.api_key = Some(key);
        }
        if let Some(model) = lookup("ENRICHFLOW_MODEL") {
            self.prediction.model = model;
        }

        let p = &mut self.pipeline;
        if let Some(v) = lookup("ENRICHFLOW_PAGE_SIZE") {
            p.page_size = parse_env("ENRICHFLOW_PAGE_SIZE", &v)?;
        }
        if let Some(v) = lookup("ENRICHFLOW_CONCURRENCY") {
            p.concurrency = parse_env("ENRICHFLOW_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("ENRICHFLOW_RETRY_ATTEMPTS") {
            p.retry_attempts = parse_env("ENRICHFLOW_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("ENRICHFLOW_RETRY_BASE_DELAY_MS") {
            p.retry_base_delay_ms = parse_env("ENRICHFLOW_RETRY_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = lookup("ENRICHFLOW_CHUNK_PAUSE_MS") {
            p.chunk_pause_ms = parse_env("ENRICHFLOW_CHUNK_PAUSE_MS", &v)?;
        }
        if let Some(v) = lookup("ENRICHFLOW_MAX_RECORDS") {
            p.max_records = Some(parse_env("ENRICHFLOW_MAX_RECORDS", &v)?);
        }
        if let Some(v) = lookup("ENRICHFLOW_DRY_RUN") {
            p.dry_run = parse_env("ENRICHFLOW_DRY_RUN", &v)?;
        }
        if let Some(v) = lookup("ENRICHFLOW_STRATEGY") {
            p.strategy = v.parse()?;
        }
        if let Some(v) = lookup("ENRICHFLOW_CORRECTION_THRESHOLD") {
            self.correction.threshold = parse_date("ENRICHFLOW_CORRECTION_THRESHOLD", &v)?;
        }
        Ok(())
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline.validate()?;
        if self.database.max_connections == 0 {
            return Err(ConfigError::invalid("database.max_connections", "must be at least 1"));
        }
        if self.prediction.timeout_secs == 0 {
            return Err(ConfigError::invalid("prediction.timeout_secs", "must be at least 1"));
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, format!("'{value}': {e}")))
}

/// Parses an ISO `YYYY-MM-DD` date.
pub fn parse_date(field: &str, value: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|e| ConfigError::invalid(field, format!("'{value}': {e}")))
}

/// Store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection URL.
    pub url: String,
    /// Pool size.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://enrichflow.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Prediction service settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// Responses API endpoint.
    pub endpoint: String,
    /// Model name.
    pub model: String,
    /// API key. Usually supplied through `OPENAI_API_KEY`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Sampling temperature.
    pub temperature: f64,
    /// Output token ceiling.
    pub max_output_tokens: u32,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/responses".to_string(),
            model: "gpt-4.1-nano".to_string(),
            api_key: None,
            timeout_secs: 60,
            temperature: 0.7,
            max_output_tokens: 150,
        }
    }
}

// api_key stays out of logs
impl std::fmt::Debug for PredictionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionConfig")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .finish()
    }
}

/// Enrichment loop settings. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct PipelineConfig {
    /// Rows fetched per page.
    pub page_size: usize,
    /// Maximum prediction calls in flight.
    pub concurrency: usize,
    /// Attempts per prediction, including the first.
    pub retry_attempts: u32,
    /// Base delay; with linear backoff attempt `n` waits `n * base`.
    pub retry_base_delay_ms: u64,
    /// Upper bound on any single retry delay.
    pub retry_max_delay_ms: u64,
    /// How the retry delay grows: linear, exponential or constant.
    pub retry_backoff: BackoffStrategy,
    /// Randomisation on top of the retry delay: none, full or equal.
    pub retry_jitter: JitterStrategy,
    /// Pause between chunks of one page.
    pub chunk_pause_ms: u64,
    /// Pause between pages.
    pub inter_page_pause_ms: u64,
    /// Pause after a store fault before refetching the same page.
    pub store_error_cooldown_ms: u64,
    /// Consecutive store faults tolerated before the run fails.
    pub max_consecutive_store_errors: u32,
    /// Optional total-record budget.
    pub max_records: Option<u64>,
    /// Compute write sets without reconciling them.
    pub dry_run: bool,
    /// Admission policy for prediction calls.
    pub strategy: SchedulingStrategy,
    /// Persist the watermark with each page's writes.
    pub persist_watermark: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            page_size: 10_000,
            concurrency: 2_000,
            retry_attempts: 3,
            retry_base_delay_ms: 5_000,
            retry_max_delay_ms: 300_000,
            retry_backoff: BackoffStrategy::default(),
            retry_jitter: JitterStrategy::default(),
            chunk_pause_ms: 1_000,
            inter_page_pause_ms: 2_000,
            store_error_cooldown_ms: 30_000,
            max_consecutive_store_errors: 5,
            max_records: None,
            dry_run: false,
            strategy: SchedulingStrategy::default(),
            persist_watermark: true,
        }
    }
}

impl PipelineConfig {
    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::invalid("pipeline.page_size", "must be at least 1"));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::invalid("pipeline.concurrency", "must be at least 1"));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::invalid("pipeline.retry_attempts", "must be at least 1"));
        }
        if self.max_consecutive_store_errors == 0 {
            return Err(ConfigError::invalid(
                "pipeline.max_consecutive_store_errors",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Sets the page size.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the concurrency ceiling.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the retry attempt count.
    #[must_use]
    pub const fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Sets the retry base delay.
    #[must_use]
    pub const fn with_retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.retry_base_delay_ms = ms;
        self
    }

    /// Sets the record budget.
    #[must_use]
    pub const fn with_max_records(mut self, max_records: Option<u64>) -> Self {
        self.max_records = max_records;
        self
    }

    /// Enables or disables dry-run.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Sets the scheduling strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: SchedulingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Zeroes every pause and cooldown. Used by tests and small local runs.
    #[must_use]
    pub const fn without_pauses(mut self) -> Self {
        self.retry_base_delay_ms = 0;
        self.chunk_pause_ms = 0;
        self.inter_page_pause_ms = 0;
        self.store_error_cooldown_ms = 0;
        self
    }

    /// Retry base delay as a [`Duration`].
    #[must_use]
    pub const fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Retry delay cap as a [`Duration`].
    #[must_use]
    pub const fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// Inter-chunk pause as a [`Duration`].
    #[must_use]
    pub const fn chunk_pause(&self) -> Duration {
        Duration::from_millis(self.chunk_pause_ms)
    }

    /// Inter-page pause as a [`Duration`].
    #[must_use]
    pub const fn inter_page_pause(&self) -> Duration {
        Duration::from_millis(self.inter_page_pause_ms)
    }

    /// Store-fault cooldown as a [`Duration`].
    #[must_use]
    pub const fn store_error_cooldown(&self) -> Duration {
        Duration::from_millis(self.store_error_cooldown_ms)
    }
}

/// Birth-date correction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionConfig {
    /// Dates after this are implausible and get shifted back a century.
    pub threshold: NaiveDate,
    /// Directory the audit CSV is written to.
    pub export_dir: PathBuf,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            threshold: NaiveDate::from_ymd_opt(2008, 2, 23).unwrap_or(NaiveDate::MIN),
            export_dir: PathBuf::from("."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.pipeline.page_size, 10_000);
        assert_eq!(config.pipeline.concurrency, 2_000);
        assert_eq!(config.pipeline.retry_attempts, 3);
        assert_eq!(config.pipeline.retry_base_delay(), Duration::from_secs(5));
        assert_eq!(config.pipeline.chunk_pause(), Duration::from_secs(1));
        assert_eq!(config.pipeline.max_records, None);
        assert!(!config.pipeline.dry_run);
        assert!(config.pipeline.persist_watermark);
        assert_eq!(config.pipeline.strategy, SchedulingStrategy::Chunked);
        assert_eq!(config.prediction.model, "gpt-4.1-nano");
        assert_eq!(
            config.correction.threshold,
            NaiveDate::from_ymd_opt(2008, 2, 23).unwrap()
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [pipeline]
            page_size = 500
            strategy = "sliding"

            [correction]
            threshold = "2010-01-01"
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.page_size, 500);
        assert_eq!(config.pipeline.concurrency, 2_000);
        assert_eq!(config.pipeline.strategy, SchedulingStrategy::Sliding);
        assert_eq!(config.correction.threshold, NaiveDate::from_ymd_opt(2010, 1, 1).unwrap());
        assert_eq!(config.database.url, "sqlite://enrichflow.db");
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let err = AppConfig::from_toml_str("[pipeline]\npage_size = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = AppConfig::from_toml_str("[pipeline]\npage_size = 500").unwrap();
        config
            .apply_env(env(&[
                ("ENRICHFLOW_PAGE_SIZE", "250"),
                ("ENRICHFLOW_MAX_RECORDS", "1000"),
                ("ENRICHFLOW_DRY_RUN", "true"),
                ("OPENAI_API_KEY", "sk-env"),
                ("ENRICHFLOW_DATABASE_URL", "sqlite::memory:"),
            ]))
            .unwrap();

        assert_eq!(config.pipeline.page_size, 250);
        assert_eq!(config.pipeline.max_records, Some(1000));
        assert!(config.pipeline.dry_run);
        assert_eq!(config.prediction.api_key.as_deref(), Some("sk-env"));
        assert_eq!(config.database.url, "sqlite::memory:");
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = AppConfig::default();
        let err = config
            .apply_env(env(&[("ENRICHFLOW_CONCURRENCY", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("ENRICHFLOW_CONCURRENCY"));
    }

    #[test]
    fn test_validation() {
        let bad = PipelineConfig::default().with_page_size(0);
        assert!(bad.validate().is_err());

        let bad = PipelineConfig::default().with_concurrency(0);
        assert!(bad.validate().is_err());

        let bad = PipelineConfig::default().with_retry_attempts(0);
        assert!(bad.validate().is_err());

        // a zero budget is legal and means "process nothing"
        let ok = PipelineConfig::default().with_max_records(Some(0));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_api_key_redacted_in_debug() {
        let config = PredictionConfig {
            api_key: Some("sk-secret".into()),
            ..PredictionConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("threshold", "2008-02-23").unwrap(),
            NaiveDate::from_ymd_opt(2008, 2, 23).unwrap()
        );
        assert!(parse_date("threshold", "23/02/2008").is_err());
    }
}
