//! Tessie vehicle API client
//!
//! State reads use Tessie's cache so polling never wakes the car. Commands
//! use a longer timeout because Tessie retries against a sleeping vehicle.

use crate::clients::{ProbeResult, VehicleApi};
use crate::error::{Result, SunwardError};
use crate::logging::get_logger;
use crate::telemetry::{ChargingState, VehicleState};
use reqwest::header::AUTHORIZATION;

const TESSIE_BASE_URL: &str = "https://api.tessie.com";
const STATE_TIMEOUT_SECS: u64 = 15;
const COMMAND_TIMEOUT_SECS: u64 = 60;

/// Tessie API client
pub struct TessieClient {
    api_key: String,
    vin: String,
    state_client: reqwest::Client,
    command_client: reqwest::Client,
    logger: crate::logging::StructuredLogger,
}

impl TessieClient {
    pub fn new(api_key: String, vin: String) -> Result<Self> {
        let state_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(STATE_TIMEOUT_SECS))
            .build()?;
        let command_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(COMMAND_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            api_key,
            vin,
            state_client,
            command_client,
            logger: get_logger("tessie"),
        })
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    fn ensure_configured(&self) -> Result<()> {
        if self.api_key.trim().is_empty() || self.vin.trim().is_empty() {
            return Err(SunwardError::config("Tessie credentials not configured"));
        }
        Ok(())
    }

    fn parse_state(body: &serde_json::Value) -> VehicleState {
        let charge = body.get("charge_state").cloned().unwrap_or_default();
        let drive = body.get("drive_state").cloned().unwrap_or_default();

        let f = |obj: &serde_json::Value, key: &str| {
            obj.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0)
        };
        let amps = f(&charge, "charger_actual_current");
        let volts = f(&charge, "charger_voltage");

        VehicleState {
            charge_port_connected: charge
                .get("charge_port_door_open")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            charging_state: ChargingState::from(
                charge
                    .get("charging_state")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Disconnected")
                    .to_string(),
            ),
            soc: f(&charge, "battery_level") as u32,
            charging_amps: amps as u32,
            charging_kw: amps * volts / 1000.0,
            charge_energy_added: f(&charge, "charge_energy_added"),
            minutes_to_full_charge: f(&charge, "minutes_to_full_charge") as u32,
            latitude: f(&drive, "latitude"),
            longitude: f(&drive, "longitude"),
            saved_location: None,
        }
    }

    /// Fetch the named location ("Home", "Work", ...) if Tessie knows one
    async fn fetch_saved_location(&self) -> Result<Option<String>> {
        let resp = self
            .state_client
            .get(format!("{}/{}/location", TESSIE_BASE_URL, self.vin))
            .header(AUTHORIZATION, self.auth_header())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(SunwardError::vehicle(format!(
                "Tessie location HTTP {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp.json().await?;
        Ok(body
            .get("saved_location")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_lowercase()))
    }

    async fn command(&self, action: &str, amps: Option<u32>) -> Result<()> {
        self.ensure_configured()?;
        let mut req = self
            .command_client
            .post(format!(
                "{}/{}/command/{}",
                TESSIE_BASE_URL, self.vin, action
            ))
            .header(AUTHORIZATION, self.auth_header())
            .query(&[("retry_duration", "40"), ("wait_for_completion", "true")]);
        if let Some(a) = amps {
            req = req.query(&[("amps", a.to_string())]);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            self.logger
                .error(&format!("Tessie {} failed: HTTP {}", action, resp.status()));
            return Err(SunwardError::vehicle(format!(
                "Tessie {} HTTP {}",
                action,
                resp.status()
            )));
        }
        self.logger.info(&format!(
            "Tessie {}{}",
            action,
            amps.map(|a| format!(" ({}A)", a)).unwrap_or_default()
        ));
        Ok(())
    }
}

#[async_trait::async_trait]
impl VehicleApi for TessieClient {
    async fn fetch_state(&self) -> Result<VehicleState> {
        self.ensure_configured()?;
        let resp = self
            .state_client
            .get(format!("{}/{}/state", TESSIE_BASE_URL, self.vin))
            .header(AUTHORIZATION, self.auth_header())
            .query(&[("use_cache", "true")])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(SunwardError::vehicle(format!(
                "Tessie state HTTP {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        let mut state = Self::parse_state(&body);

        // Named-location lookup is best-effort; GPS fallback covers it
        match self.fetch_saved_location().await {
            Ok(loc) => state.saved_location = loc,
            Err(e) => self
                .logger
                .debug(&format!("Saved-location lookup failed: {}", e)),
        }

        Ok(state)
    }

    async fn set_charging_amps(&self, amps: u32) -> Result<()> {
        // Tesla refuses below 5 A; callers must stop instead
        if !(5..=32).contains(&amps) {
            return Err(SunwardError::validation(
                "amps".to_string(),
                format!("Amps must be 5-32, got {}", amps),
            ));
        }
        self.command("set_charging_amps", Some(amps)).await
    }

    async fn start_charging(&self) -> Result<()> {
        self.command("start_charging", None).await
    }

    async fn stop_charging(&self) -> Result<()> {
        self.command("stop_charging", None).await
    }

    async fn test_connection(&self) -> ProbeResult {
        match self.fetch_state().await {
            Ok(state) => ProbeResult::ok(format!(
                "Connected — SoC: {}%, state: {}",
                state.soc,
                state.charging_state.as_str()
            )),
            Err(e) => ProbeResult::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_state() {
        let body = json!({
            "charge_state": {
                "charge_port_door_open": true,
                "charging_state": "Charging",
                "battery_level": 55,
                "charger_actual_current": 12,
                "charger_voltage": 230,
                "charge_energy_added": 3.2,
                "minutes_to_full_charge": 95
            },
            "drive_state": {
                "latitude": 14.5995,
                "longitude": 120.9842
            }
        });
        let state = TessieClient::parse_state(&body);
        assert!(state.charge_port_connected);
        assert!(state.charging_state.is_charging());
        assert_eq!(state.soc, 55);
        assert_eq!(state.charging_amps, 12);
        assert!((state.charging_kw - 2.76).abs() < 0.001);
        assert_eq!(state.minutes_to_full_charge, 95);
        assert!((state.latitude - 14.5995).abs() < 1e-9);
    }

    #[test]
    fn test_parse_state_empty_body() {
        let state = TessieClient::parse_state(&json!({}));
        assert!(!state.charge_port_connected);
        assert_eq!(state.charging_state, ChargingState::Disconnected);
        assert_eq!(state.charging_amps, 0);
    }

    #[tokio::test]
    async fn test_set_amps_rejects_out_of_range() {
        let client = TessieClient::new("key".to_string(), "VIN".to_string()).unwrap();
        assert!(client.set_charging_amps(3).await.is_err());
        assert!(client.set_charging_amps(40).await.is_err());
    }
}
