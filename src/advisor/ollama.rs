//! Ollama HTTP client
//!
//! Thin wrapper over the `/api/generate` and `/api/tags` endpoints with
//! exponential backoff on transient failures. Model selection and response
//! parsing live in the advisor; this layer only moves text in and out.

use crate::error::{Result, SunwardError};
use crate::logging::{get_logger, StructuredLogger};
use std::time::Duration;

const CONNECT_TIMEOUT_SECS: u64 = 15;
/// Generation can be slow on CPU-only hosts
const READ_TIMEOUT_SECS: u64 = 180;
const HEALTH_TIMEOUT_SECS: u64 = 10;

/// Seconds before the first retry; doubles on every subsequent attempt
const BACKOFF_BASE_SECS: u64 = 5;

#[derive(Clone)]
pub struct OllamaClient {
    host: String,
    client: reqwest::Client,
    health_client: reqwest::Client,
    logger: StructuredLogger,
}

impl OllamaClient {
    pub fn new(host: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .build()?;
        let health_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(HEALTH_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            host: host.into().trim_end_matches('/').to_string(),
            client,
            health_client,
            logger: get_logger("ollama"),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn generate_once(
        &self,
        model: &str,
        prompt: &str,
        temperature: f64,
        num_predict: u32,
        json_format: bool,
    ) -> Result<String> {
        let mut payload = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": temperature,
                "num_predict": num_predict,
            },
        });
        if json_format {
            payload["format"] = serde_json::json!("json");
        }

        let resp = self
            .client
            .post(format!("{}/api/generate", self.host))
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SunwardError::ai(format!(
                "Ollama HTTP {} from {}",
                status, model
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        let text = body
            .get("response")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SunwardError::ai("Ollama response missing 'response' field"))?;
        Ok(text.to_string())
    }

    /// Retrying eligibility: timeouts, connection errors and server-side
    /// failures may clear up; anything else is permanent for this call.
    fn is_transient(err: &SunwardError) -> bool {
        matches!(
            err,
            SunwardError::Timeout { .. } | SunwardError::Network { .. }
        ) || matches!(err, SunwardError::Ai { message } if message.contains("HTTP 5"))
    }

    /// Run a generation with up to `attempts` tries and exponential backoff
    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        temperature: f64,
        num_predict: u32,
        json_format: bool,
        attempts: u32,
    ) -> Result<String> {
        let attempts = attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self
                .generate_once(model, prompt, temperature, num_predict, json_format)
                .await
            {
                Ok(text) => return Ok(text),
                Err(e) => {
                    let transient = Self::is_transient(&e);
                    self.logger.warn(&format!(
                        "Ollama generate failed (model={}, attempt {}/{}): {}",
                        model, attempt, attempts, e
                    ));
                    last_err = Some(e);
                    if !transient || attempt == attempts {
                        break;
                    }
                    let wait = BACKOFF_BASE_SECS * 2u64.pow(attempt - 1);
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SunwardError::ai("Ollama generate failed")))
    }

    /// Health probe: list installed models and confirm the host answers
    pub async fn check_health(&self) -> (bool, String) {
        match self
            .health_client
            .get(format!("{}/api/tags", self.host))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                let names = resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| {
                        v.get("models").and_then(|m| m.as_array()).map(|models| {
                            models
                                .iter()
                                .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                                .map(String::from)
                                .collect::<Vec<_>>()
                        })
                    })
                    .unwrap_or_default();
                (true, format!("Reachable, {} model(s) installed", names.len()))
            }
            Ok(resp) => (false, format!("Ollama HTTP {}", resp.status())),
            Err(e) => (false, format!("Ollama unreachable: {}", e)),
        }
    }
}
