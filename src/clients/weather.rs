//! Open-Meteo solar forecast client

use crate::clients::{ForecastApi, ProbeResult};
use crate::error::{Result, SunwardError};
use crate::logging::get_logger;
use crate::telemetry::{Forecast, ForecastHour};
use chrono::{NaiveTime, TimeZone, Utc};

const OPEN_METEO_URL: &str = "https://api.open-meteo.com/v1/forecast";
const TIMEOUT_SECS: u64 = 15;

/// Fraction of irradiance assumed to reach the panels as usable output
const PANEL_EFFICIENCY: f64 = 0.85;

/// Open-Meteo API client
pub struct OpenMeteoClient {
    client: reqwest::Client,
    logger: crate::logging::StructuredLogger,
}

impl OpenMeteoClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            logger: get_logger("weather"),
        })
    }

    fn parse_forecast(body: &serde_json::Value) -> Forecast {
        let daily = body.get("daily").cloned().unwrap_or_default();
        let hourly = body.get("hourly").cloned().unwrap_or_default();

        let first_str = |obj: &serde_json::Value, key: &str| {
            obj.get(key)
                .and_then(|v| v.as_array())
                .and_then(|a| a.first())
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        };

        // Open-Meteo returns local ISO timestamps; keep only HH:MM
        let hhmm = |s: &str| {
            s.split('T')
                .nth(1)
                .map(|t| t.chars().take(5).collect())
                .unwrap_or_else(|| s.to_string())
        };

        let arr_f64 = |key: &str| -> Vec<f64> {
            hourly
                .get(key)
                .and_then(|v| v.as_array())
                .map(|a| a.iter().map(|v| v.as_f64().unwrap_or(0.0)).collect())
                .unwrap_or_default()
        };

        let times: Vec<String> = hourly
            .get("time")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .map(|v| hhmm(v.as_str().unwrap_or("")))
                    .collect()
            })
            .unwrap_or_default();
        let irradiance = arr_f64("shortwave_radiation");
        let clouds = arr_f64("cloud_cover");
        let temps = arr_f64("temperature_2m");

        let mut hours = Vec::with_capacity(times.len());
        for (i, time) in times.iter().enumerate() {
            let irr = irradiance.get(i).copied().unwrap_or(0.0);
            hours.push(ForecastHour {
                time: time.clone(),
                irradiance_wm2: irr,
                estimated_w: (irr * PANEL_EFFICIENCY).round(),
                cloud_pct: clouds.get(i).copied().unwrap_or(0.0),
                temperature_c: temps.get(i).copied().unwrap_or(0.0),
            });
        }

        // Peak window: hours above 70% of the day's maximum irradiance
        let max_irr = hours.iter().map(|h| h.irradiance_wm2).fold(0.0, f64::max);
        let peak: Vec<&ForecastHour> = hours
            .iter()
            .filter(|h| max_irr > 0.0 && h.irradiance_wm2 > max_irr * 0.7)
            .collect();

        Forecast {
            sunrise: hhmm(&first_str(&daily, "sunrise")),
            sunset: hhmm(&first_str(&daily, "sunset")),
            peak_start: peak.first().map(|h| h.time.clone()).unwrap_or_default(),
            peak_end: peak.last().map(|h| h.time.clone()).unwrap_or_default(),
            hours,
        }
    }
}

#[async_trait::async_trait]
impl ForecastApi for OpenMeteoClient {
    async fn fetch(&self, lat: f64, lon: f64, timezone: &str) -> Result<Forecast> {
        let resp = self
            .client
            .get(OPEN_METEO_URL)
            .query(&[
                ("latitude", lat.to_string()),
                ("longitude", lon.to_string()),
                (
                    "hourly",
                    "cloud_cover,shortwave_radiation,temperature_2m".to_string(),
                ),
                ("daily", "sunrise,sunset".to_string()),
                ("timezone", timezone.to_string()),
                ("forecast_days", "1".to_string()),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            self.logger
                .error(&format!("Open-Meteo HTTP error: {}", resp.status()));
            return Err(SunwardError::api(format!(
                "Open-Meteo HTTP {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        Ok(Self::parse_forecast(&body))
    }

    async fn test_connection(&self) -> ProbeResult {
        // Manila coordinates; connectivity check only
        match self.fetch(14.5995, 120.9842, "Asia/Manila").await {
            Ok(f) => ProbeResult::ok(format!(
                "Connected — sunrise: {}, sunset: {}",
                f.sunrise, f.sunset
            )),
            Err(e) => ProbeResult::failed(e.to_string()),
        }
    }
}

/// Hours remaining until this forecast's sunset, in the given timezone
pub fn hours_until_sunset(forecast: &Forecast, tz: chrono_tz::Tz) -> f64 {
    let Ok(sunset_time) = NaiveTime::parse_from_str(&forecast.sunset, "%H:%M") else {
        return 0.0;
    };
    let now = Utc::now().with_timezone(&tz);
    let Some(sunset) = tz
        .from_local_datetime(&now.date_naive().and_time(sunset_time))
        .earliest()
    else {
        return 0.0;
    };
    let diff = (sunset - now).num_minutes() as f64 / 60.0;
    (diff.max(0.0) * 10.0).round() / 10.0
}

/// Irradiance-curve text for the model prompt: remaining daylight hours only
pub fn irradiance_curve(forecast: &Forecast, now_hhmm: &str) -> String {
    let future: Vec<&ForecastHour> = forecast
        .hours
        .iter()
        .filter(|h| h.time.as_str() >= now_hhmm && h.irradiance_wm2 > 0.0)
        .collect();
    if future.is_empty() {
        return "No remaining solar hours today.".to_string();
    }
    future
        .iter()
        .map(|h| {
            format!(
                "  {}: {:.0}W/m² (cloud: {:.0}%)",
                h.time, h.irradiance_wm2, h.cloud_pct
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
