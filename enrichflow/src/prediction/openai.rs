//! OpenAI Responses API client for name-based predictions.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{normalize_names, Prediction, PredictionClient};
use crate::config::PredictionConfig;
use crate::errors::{ConfigError, PredictionError};

const SYSTEM_PROMPT: &str = "You are an expert linguist and an expert in name-based gender detection. \
Given the first name and last name, determine the most likely first language, gender, and a numerical \
confidence score for the person, assuming they are from South Africa. Respond with a JSON object strictly \
adhering to the provided schema. The JSON object must include 'language' (chosen from the official South \
African languages specified in the schema's enum), 'gender' (as 'FEMALE' or 'MALE' as specified in the \
schema's enum), and 'confidence' (a numerical score indicating the confidence level of the prediction, \
ideally between 0.0 and 1.0).";

/// Prediction client backed by the OpenAI Responses API.
#[derive(Debug, Clone)]
pub struct OpenAiPredictionClient {
    http: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_output_tokens: u32,
}

impl OpenAiPredictionClient {
    /// Builds a client from configuration.
    ///
    /// Fails with [`ConfigError::MissingCredential`] if no API key is set.
    pub fn from_config(config: &PredictionConfig) -> Result<Self, ConfigError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingCredential("OPENAI_API_KEY".to_string()))?;

        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConfigError::invalid("prediction", format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        })
    }

    /// The model requested on every call.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl PredictionClient for OpenAiPredictionClient {
    async fn predict(&self, first_name: &str, last_name: &str) -> Result<Prediction, PredictionError> {
        let (first, last) = normalize_names(first_name, last_name)?;
        let body = build_request_body(&self.model, first, last, self.temperature, self.max_output_tokens);

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            debug!(status = %status, "Prediction service returned an error status");
            return Err(PredictionError::TransportError(format!(
                "status {status}: {}",
                truncate(&text, 200)
            )));
        }

        parse_response_body(&text)
    }
}

/// Builds the Responses API request for one person.
#[must_use]
pub fn build_request_body(
    model: &str,
    first_name: &str,
    last_name: &str,
    temperature: f64,
    max_output_tokens: u32,
) -> serde_json::Value {
    let languages: Vec<&str> = super::Language::ALL.iter().map(|l| l.as_str()).collect();

    serde_json::json!({
        "model": model,
        "input": [
            {
                "role": "system",
                "content": [{"type": "input_text", "text": SYSTEM_PROMPT}]
            },
            {
                "role": "user",
                "content": [{
                    "type": "input_text",
                    "text": format!("first_name: {first_name} last_name: {last_name}")
                }]
            }
        ],
        "text": {
            "format": {
                "type": "json_schema",
                "name": "person_prediction",
                "strict": true,
                "schema": {
                    "type": "object",
                    "properties": {
                        "language": {
                            "type": "string",
                            "description": "Most likely first language",
                            "enum": languages
                        },
                        "gender": {
                            "type": "string",
                            "description": "Most likely gender",
                            "enum": ["FEMALE", "MALE"]
                        },
                        "confidence": {
                            "type": "number",
                            "description": "Prediction confidence (e.g., 0.0 to 1.0)"
                        }
                    },
                    "required": ["language", "gender", "confidence"],
                    "additionalProperties": false
                }
            }
        },
        "temperature": temperature,
        "max_output_tokens": max_output_tokens,
        "top_p": 1,
        "store": true
    })
}

#[derive(Debug, Deserialize)]
struct ResponsesEnvelope {
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: Option<String>,
}

/// Extracts the structured prediction from a Responses API body.
pub fn parse_response_body(body: &str) -> Result<Prediction, PredictionError> {
    let envelope: ResponsesEnvelope = serde_json::from_str(body)
        .map_err(|e| PredictionError::MalformedResponse(format!("envelope: {e}")))?;

    let text = envelope
        .output
        .iter()
        .flat_map(|item| item.content.iter())
        .find_map(|part| part.text.as_deref())
        .ok_or_else(|| {
            PredictionError::MalformedResponse("Unexpected response structure".to_string())
        })?;

    serde_json::from_str(text).map_err(|e| {
        PredictionError::MalformedResponse(format!("{e}. Raw: {}", truncate(text, 200)))
    })
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
