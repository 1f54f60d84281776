//! Telegram Bot API client
//!
//! The notification bot is opaque to the decision path; this client exists
//! for the credentials connectivity check.

use crate::clients::ProbeResult;
use crate::error::{Result, SunwardError};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const API_BASE: &str = "https://api.telegram.org";
const REQUEST_TIMEOUT_SECS: u64 = 10;

pub struct TelegramClient {
    http: Client,
    token: String,
}

/// Standard Bot API response wrapper
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BotProfile {
    username: Option<String>,
}

impl TelegramClient {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            token: token.into(),
        })
    }

    /// Validate the bot token against `getMe`
    pub async fn test_connection(&self) -> ProbeResult {
        match self.get_me().await {
            Ok(profile) => ProbeResult::ok(format!(
                "Bot @{} reachable",
                profile.username.unwrap_or_else(|| "unknown".to_string())
            )),
            Err(e) => ProbeResult::failed(e.to_string()),
        }
    }

    async fn get_me(&self) -> Result<BotProfile> {
        let url = format!("{}/bot{}/getMe", API_BASE, self.token);
        let response = self.http.get(&url).send().await?;
        let envelope: ApiEnvelope<BotProfile> = response.json().await?;
        unwrap_envelope(envelope)
    }
}

fn unwrap_envelope<T>(envelope: ApiEnvelope<T>) -> Result<T> {
    if !envelope.ok {
        return Err(SunwardError::api(
            envelope
                .description
                .unwrap_or_else(|| "Telegram API rejected the request".to_string()),
        ));
    }
    envelope
        .result
        .ok_or_else(|| SunwardError::api("Telegram API returned no result"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_extracts_bot_profile() {
        let raw = r#"{"ok": true, "result": {"id": 1, "username": "sunward_bot"}}"#;
        let envelope: ApiEnvelope<BotProfile> = serde_json::from_str(raw).unwrap();
        let profile = unwrap_envelope(envelope).unwrap();
        assert_eq!(profile.username.as_deref(), Some("sunward_bot"));
    }

    #[test]
    fn test_envelope_surfaces_api_rejection() {
        let raw = r#"{"ok": false, "description": "Unauthorized"}"#;
        let envelope: ApiEnvelope<BotProfile> = serde_json::from_str(raw).unwrap();
        let err = unwrap_envelope(envelope).unwrap_err();
        assert!(err.to_string().contains("Unauthorized"));
    }
}
