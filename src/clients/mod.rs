//! HTTP clients for the external collaborators
//!
//! Each service gets its own client module and a trait seam so the control
//! loop can be driven by mocks in tests. All calls carry bounded timeouts;
//! a slow cloud API degrades one cycle, never the loop.

pub mod solax;
pub mod telegram;
pub mod tessie;
pub mod weather;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::telemetry::{Forecast, InverterReading, VehicleState};

/// Outcome of a connectivity probe against one external service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub ok: bool,
    pub detail: String,
}

impl ProbeResult {
    pub fn ok<S: Into<String>>(detail: S) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn failed<S: Into<String>>(detail: S) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Solar inverter cloud API
#[async_trait::async_trait]
pub trait InverterApi: Send + Sync {
    async fn fetch(&self) -> Result<InverterReading>;
    async fn test_connection(&self) -> ProbeResult;
}

/// Vehicle cloud API
#[async_trait::async_trait]
pub trait VehicleApi: Send + Sync {
    async fn fetch_state(&self) -> Result<VehicleState>;
    async fn set_charging_amps(&self, amps: u32) -> Result<()>;
    async fn start_charging(&self) -> Result<()>;
    async fn stop_charging(&self) -> Result<()>;
    async fn test_connection(&self) -> ProbeResult;
}

/// Weather/irradiance forecast API
#[async_trait::async_trait]
pub trait ForecastApi: Send + Sync {
    async fn fetch(&self, lat: f64, lon: f64, timezone: &str) -> Result<Forecast>;
    async fn test_connection(&self) -> ProbeResult;
}

/// Stored API credentials for the external services
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub solax_token_id: String,
    pub solax_dongle_sn: String,
    pub tessie_api_key: String,
    pub tessie_vin: String,
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,
}

impl Credentials {
    /// Merge non-empty fields from an update into self
    pub fn merge(&mut self, update: &Credentials) {
        fn take(dst: &mut String, src: &str) {
            if !src.is_empty() {
                *dst = src.to_string();
            }
        }
        take(&mut self.solax_token_id, &update.solax_token_id);
        take(&mut self.solax_dongle_sn, &update.solax_dongle_sn);
        take(&mut self.tessie_api_key, &update.tessie_api_key);
        take(&mut self.tessie_vin, &update.tessie_vin);
        take(&mut self.telegram_bot_token, &update.telegram_bot_token);
        take(&mut self.telegram_chat_id, &update.telegram_chat_id);
    }

    /// Masked copy for API reads: secrets show only their last 4 characters
    pub fn masked(&self) -> Credentials {
        Credentials {
            solax_token_id: self.solax_token_id.clone(),
            solax_dongle_sn: self.solax_dongle_sn.clone(),
            tessie_api_key: mask(&self.tessie_api_key),
            tessie_vin: self.tessie_vin.clone(),
            telegram_bot_token: mask(&self.telegram_bot_token),
            telegram_chat_id: self.telegram_chat_id.clone(),
        }
    }
}

fn mask(val: &str) -> String {
    if val.len() < 5 {
        return val.to_string();
    }
    let visible = &val[val.len() - 4..];
    format!("{}{}", "•".repeat(val.chars().count() - 4), visible)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_short_values_untouched() {
        assert_eq!(mask(""), "");
        assert_eq!(mask("abcd"), "abcd");
    }

    #[test]
    fn test_mask_keeps_last_four() {
        assert_eq!(mask("secret-token"), "••••••••oken");
    }

    #[test]
    fn test_merge_skips_empty_fields() {
        let mut creds = Credentials {
            tessie_api_key: "old-key".to_string(),
            tessie_vin: "VIN123".to_string(),
            ..Default::default()
        };
        let update = Credentials {
            tessie_api_key: "new-key".to_string(),
            ..Default::default()
        };
        creds.merge(&update);
        assert_eq!(creds.tessie_api_key, "new-key");
        assert_eq!(creds.tessie_vin, "VIN123");
    }
}
