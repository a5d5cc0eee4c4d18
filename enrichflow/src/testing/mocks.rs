//! Scripted prediction client for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::errors::PredictionError;
use crate::prediction::{normalize_names, Gender, Language, Prediction, PredictionClient};

/// A prediction client driven by a per-name script.
///
/// Responses are keyed by first name. A name with queued failures returns
/// them in order before succeeding; unknown names get the default prediction.
#[derive(Debug)]
pub struct ScriptedPredictionClient {
    predictions: HashMap<String, Prediction>,
    failures: Mutex<HashMap<String, (u32, PredictionError)>>,
    always_failing: HashMap<String, PredictionError>,
    panics: HashSet<String>,
    default: Prediction,
    delay: Duration,
    calls: Mutex<HashMap<String, u32>>,
}

impl Default for ScriptedPredictionClient {
    fn default() -> Self {
        Self {
            predictions: HashMap::new(),
            failures: Mutex::new(HashMap::new()),
            always_failing: HashMap::new(),
            panics: HashSet::new(),
            default: Prediction::new(Language::English, Gender::Female, 0.5),
            delay: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl ScriptedPredictionClient {
    /// Creates a client that answers every name with the default prediction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the answer for `first_name`.
    #[must_use]
    pub fn with_prediction(mut self, first_name: &str, prediction: Prediction) -> Self {
        self.predictions.insert(first_name.to_string(), prediction);
        self
    }

    /// Fails the first `times` calls for `first_name` with `error`.
    #[must_use]
    pub fn with_failures(self, first_name: &str, times: u32, error: PredictionError) -> Self {
        self.failures
            .lock()
            .insert(first_name.to_string(), (times, error));
        self
    }

    /// Fails every call for `first_name`.
    #[must_use]
    pub fn with_always_failing(mut self, first_name: &str, error: PredictionError) -> Self {
        self.always_failing.insert(first_name.to_string(), error);
        self
    }

    /// Panics on every call for `first_name`.
    #[must_use]
    pub fn with_panic(mut self, first_name: &str) -> Self {
        self.panics.insert(first_name.to_string());
        self
    }

    /// Suspends each call for `delay` before answering.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Calls made for `first_name`, blank-name rejections excluded.
    #[must_use]
    pub fn calls_for(&self, first_name: &str) -> u32 {
        self.calls.lock().get(first_name).copied().unwrap_or(0)
    }

    /// Calls made across all names.
    #[must_use]
    pub fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl PredictionClient for ScriptedPredictionClient {
    #[allow(clippy::panic)]
    async fn predict(&self, first_name: &str, last_name: &str) -> Result<Prediction, PredictionError> {
        let (first, _) = normalize_names(first_name, last_name)?;
        *self.calls.lock().entry(first.to_string()).or_insert(0) += 1;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panics.contains(first) {
            panic!("scripted panic for {first}");
        }
        if let Some(error) = self.always_failing.get(first) {
            return Err(error.clone());
        }
        {
            let mut failures = self.failures.lock();
            if let Some((remaining, error)) = failures.get_mut(first) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(error.clone());
                }
            }
        }
        Ok(self.predictions.get(first).copied().unwrap_or(self.default))
    }
}
