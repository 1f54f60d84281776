//! SolaxCloud realtime inverter client

use crate::clients::{InverterApi, ProbeResult};
use crate::error::{Result, SunwardError};
use crate::logging::get_logger;
use crate::telemetry::InverterReading;

const SOLAX_BASE_URL: &str = "https://www.solaxcloud.com/proxyApp/proxy/api/getRealtimeInfo.do";
const TIMEOUT_SECS: u64 = 15;

/// SolaxCloud API client
pub struct SolaxClient {
    token_id: String,
    dongle_sn: String,
    client: reqwest::Client,
    logger: crate::logging::StructuredLogger,
}

impl SolaxClient {
    /// Create a new client; `dongle_sn` is the WiFi dongle serial, not the inverter serial
    pub fn new(token_id: String, dongle_sn: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            token_id,
            dongle_sn,
            client,
            logger: get_logger("solax"),
        })
    }

    fn parse_reading(body: &serde_json::Value) -> Result<InverterReading> {
        if !body
            .get("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            let detail = body
                .get("exception")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown error");
            return Err(SunwardError::inverter(format!(
                "SolaxCloud API error: {}",
                detail
            )));
        }

        let result = body
            .get("result")
            .ok_or_else(|| SunwardError::inverter("SolaxCloud response missing result"))?;

        let f = |key: &str| result.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);

        // PV power is the sum of all MPPT strings
        let solar_w = f("powerdc1") + f("powerdc2") + f("powerdc3") + f("powerdc4");

        // feedinpower: positive = export, negative = import
        let feedin = f("feedinpower");
        let (grid_import_w, grid_export_w) = if feedin < 0.0 {
            (-feedin, 0.0)
        } else {
            (0.0, feedin)
        };

        Ok(InverterReading {
            solar_w,
            grid_import_w,
            grid_export_w,
            battery_soc: f("soc") as u32,
            battery_w: f("batPower"),
            household_demand_w: solar_w - feedin,
            yield_today_kwh: f("yieldtoday"),
            consume_energy_kwh: f("consumeenergy"),
            upload_time: result
                .get("uploadTime")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        })
    }
}

#[async_trait::async_trait]
impl InverterApi for SolaxClient {
    async fn fetch(&self) -> Result<InverterReading> {
        if self.token_id.trim().is_empty() || self.dongle_sn.trim().is_empty() {
            return Err(SunwardError::config("Solax credentials not configured"));
        }

        let resp = self
            .client
            .get(SOLAX_BASE_URL)
            .query(&[("tokenId", &self.token_id), ("sn", &self.dongle_sn)])
            .send()
            .await?;

        if !resp.status().is_success() {
            self.logger
                .error(&format!("SolaxCloud HTTP error: {}", resp.status()));
            return Err(SunwardError::inverter(format!(
                "SolaxCloud HTTP {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        Self::parse_reading(&body)
    }

    async fn test_connection(&self) -> ProbeResult {
        match self.fetch().await {
            Ok(reading) => ProbeResult::ok(format!(
                "Connected — solar: {:.0}W, last update: {}",
                reading.solar_w, reading.upload_time
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
    fn test_parse_reading_import() {
        let body = json!({
            "success": true,
            "result": {
                "powerdc1": 1800.0,
                "powerdc2": 1200.0,
                "feedinpower": -350.0,
                "soc": 65,
                "batPower": -200.0,
                "yieldtoday": 12.4,
                "consumeenergy": 1042.7,
                "uploadTime": "2026-08-31 13:05:00"
            }
        });
        let reading = SolaxClient::parse_reading(&body).unwrap();
        assert_eq!(reading.solar_w, 3000.0);
        assert_eq!(reading.grid_import_w, 350.0);
        assert_eq!(reading.grid_export_w, 0.0);
        assert_eq!(reading.battery_soc, 65);
        // household = solar - feedin = 3000 - (-350)
        assert_eq!(reading.household_demand_w, 3350.0);
        assert_eq!(reading.consume_energy_kwh, 1042.7);
    }

    #[test]
    fn test_parse_reading_export() {
        let body = json!({
            "success": true,
            "result": {
                "powerdc1": 4200.0,
                "feedinpower": 900.0
            }
        });
        let reading = SolaxClient::parse_reading(&body).unwrap();
        assert_eq!(reading.grid_import_w, 0.0);
        assert_eq!(reading.grid_export_w, 900.0);
        assert_eq!(reading.household_demand_w, 3300.0);
    }

    #[test]
    fn test_parse_reading_api_failure() {
        let body = json!({"success": false, "exception": "Token invalid"});
        let err = SolaxClient::parse_reading(&body).unwrap_err();
        assert!(err.to_string().contains("Token invalid"));
    }
}
