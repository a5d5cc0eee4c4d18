//! Tracing subscriber setup.
//!
//! Logs go to stdout, plain or JSON, and optionally to a per-run log file as
//! well. `RUST_LOG` overrides the default filter.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "enrichflow=info";

/// How logs are formatted and where they go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Emit JSON lines on stdout.
    pub json: bool,
    /// Also write plain-text logs to this file.
    pub log_file: Option<PathBuf>,
    /// Filter directive when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            json: false,
            log_file: None,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl LogSettings {
    /// Switches stdout to JSON.
    #[must_use]
    pub const fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Adds a log file.
    #[must_use]
    pub fn with_log_file(mut self, path: Option<PathBuf>) -> Self {
        self.log_file = path;
        self
    }

    /// The effective filter: `RUST_LOG` if set and valid, else the default.
    #[must_use]
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }
}

/// Installs the global subscriber.
///
/// Returns `Ok(false)` if a subscriber was already installed. Fails only if
/// the log file cannot be created.
pub fn init_tracing(settings: &LogSettings) -> std::io::Result<bool> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(if settings.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    });
    if let Some(path) = &settings.log_file {
        let file = Arc::new(File::create(path)?);
        layers.push(fmt::layer().with_ansi(false).with_writer(file).boxed());
    }

    Ok(tracing_subscriber::registry()
        .with(layers)
        .with(settings.env_filter())
        .try_init()
        .is_ok())
}
