//! Name-based demographic prediction.
//!
//! The pipeline depends only on the [`PredictionClient`] trait; the
//! production implementation calls the OpenAI Responses API with a strict
//! JSON schema (see [`OpenAiPredictionClient`]).

mod openai;

pub use openai::{build_request_body, parse_response_body, OpenAiPredictionClient};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::PredictionError;

/// First languages the prediction service may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    /// Afrikaans.
    Afrikaans,
    /// English.
    English,
    /// isiNdebele.
    #[serde(rename = "isiNdebele")]
    IsiNdebele,
    /// isiXhosa.
    #[serde(rename = "isiXhosa")]
    IsiXhosa,
    /// isiZulu.
    #[serde(rename = "isiZulu")]
    IsiZulu,
    /// Sepedi.
    Sepedi,
    /// Sesotho.
    Sesotho,
    /// Setswana.
    Setswana,
    /// siSwati.
    #[serde(rename = "siSwati")]
    SiSwati,
    /// Tshivenda.
    Tshivenda,
    /// Xitsonga.
    Xitsonga,
}

impl Language {
    /// All languages, in schema order.
    pub const ALL: [Self; 11] = [
        Self::Afrikaans,
        Self::English,
        Self::IsiNdebele,
        Self::IsiXhosa,
        Self::IsiZulu,
        Self::Sepedi,
        Self::Sesotho,
        Self::Setswana,
        Self::SiSwati,
        Self::Tshivenda,
        Self::Xitsonga,
    ];

    /// The description stored in the languages table.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Afrikaans => "Afrikaans",
            Self::English => "English",
            Self::IsiNdebele => "isiNdebele",
            Self::IsiXhosa => "isiXhosa",
            Self::IsiZulu => "isiZulu",
            Self::Sepedi => "Sepedi",
            Self::Sesotho => "Sesotho",
            Self::Setswana => "Setswana",
            Self::SiSwati => "siSwati",
            Self::Tshivenda => "Tshivenda",
            Self::Xitsonga => "Xitsonga",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gender categories the prediction service may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Gender {
    /// FEMALE.
    Female,
    /// MALE.
    Male,
}

impl Gender {
    /// The description stored in the genders table.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Female => "FEMALE",
            Self::Male => "MALE",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured prediction for one person.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Most likely first language.
    pub language: Language,
    /// Most likely gender.
    pub gender: Gender,
    /// Confidence score, nominally in `[0, 1]`.
    pub confidence: f64,
}

impl Prediction {
    /// Creates a new prediction.
    #[must_use]
    pub const fn new(language: Language, gender: Gender, confidence: f64) -> Self {
        Self {
            language,
            gender,
            confidence,
        }
    }

    /// Returns true if the confidence lies in `[0, 1]`.
    ///
    /// The model is not bound to respect the range, so this is informational.
    #[must_use]
    pub fn confidence_in_range(&self) -> bool {
        (0.0..=1.0).contains(&self.confidence)
    }
}

/// Trims both names and rejects blanks.
pub fn normalize_names<'a>(
    first_name: &'a str,
    last_name: &'a str,
) -> Result<(&'a str, &'a str), PredictionError> {
    let first = first_name.trim();
    let last = last_name.trim();
    if first.is_empty() || last.is_empty() {
        return Err(PredictionError::EmptyInput);
    }
    Ok((first, last))
}

/// A service that predicts language and gender from a person's names.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PredictionClient: Send + Sync {
    /// Predicts language and gender for one person.
    ///
    /// Implementations must return [`PredictionError::EmptyInput`] for blank
    /// names without making a network call.
    async fn predict(&self, first_name: &str, last_name: &str) -> Result<Prediction, PredictionError>;
}

#[async_trait]
impl<T: PredictionClient + ?Sized> PredictionClient for std::sync::Arc<T> {
    async fn predict(&self, first_name: &str, last_name: &str) -> Result<Prediction, PredictionError> {
        (**self).predict(first_name, last_name).await
    }
}

#[async_trait]
impl<T: PredictionClient + ?Sized> PredictionClient for &T {
    async fn predict(&self, first_name: &str, last_name: &str) -> Result<Prediction, PredictionError> {
        (**self).predict(first_name, last_name).await
    }
}
