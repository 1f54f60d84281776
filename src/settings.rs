//! User-tunable charging settings
//!
//! Settings are mutated only through explicit merge-updates from the web API
//! and persisted as part of the state file. The control loop never mutates
//! them implicitly. Updates are idempotent partial merges so rapid
//! successive saves from a debounced UI are safe.

use serde::{Deserialize, Serialize};

/// Charging strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChargingStrategy {
    /// Charge only from surplus solar, however long it takes
    SolarFirst,
    /// Charge to target SoC by the departure time, using grid if needed
    Departure,
}

/// User charging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Target vehicle state of charge (%)
    pub target_soc: u32,

    /// Default charging amps for manual/fallback use
    pub default_charging_amps: u32,

    /// Daily grid budget in kWh; 0 or negative disables enforcement
    pub daily_grid_budget_kwh: f64,

    /// Maximum grid import while charging (W); 0 or negative means unlimited
    pub max_grid_import_w: f64,

    /// Whether vehicle integration is enabled at all
    pub tessie_enabled: bool,

    /// Electricity rate per kWh, used for savings accounting
    pub electricity_rate: f64,

    /// Home latitude (unset until configured or learned)
    pub home_lat: Option<f64>,

    /// Home longitude
    pub home_lon: Option<f64>,

    /// Radius around home coordinates that still counts as home (meters)
    pub home_radius_m: f64,

    /// IANA timezone for daily resets and the daylight window
    pub timezone: String,

    /// Charging strategy
    pub charging_strategy: ChargingStrategy,

    /// Departure time in HH:MM local, empty when unset
    pub departure_time: String,

    /// Nominal circuit voltage used for watts-to-amps conversion
    pub circuit_voltage: f64,

    /// Whether AI-driven optimization is enabled
    pub ai_enabled: bool,

    /// Solar panel capacity in W (0 = unknown), prompt context only
    pub panel_capacity_w: u32,

    /// Whether the site has a home battery
    pub has_home_battery: bool,

    /// Whether the site has net metering
    pub has_net_metering: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_soc: 80,
            default_charging_amps: 8,
            daily_grid_budget_kwh: 25.0,
            max_grid_import_w: 7000.0,
            tessie_enabled: true,
            electricity_rate: 10.83,
            home_lat: None,
            home_lon: None,
            home_radius_m: 100.0,
            timezone: "Asia/Manila".to_string(),
            charging_strategy: ChargingStrategy::SolarFirst,
            departure_time: String::new(),
            circuit_voltage: 230.0,
            ai_enabled: false,
            panel_capacity_w: 0,
            has_home_battery: false,
            has_net_metering: false,
        }
    }
}

impl Settings {
    /// Parsed timezone; UTC if the configured string is invalid
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }

    /// Apply a partial update; only provided fields change
    pub fn apply_update(&mut self, update: &SettingsUpdate) {
        if let Some(v) = update.target_soc {
            self.target_soc = v.clamp(50, 100);
        }
        if let Some(v) = update.default_charging_amps {
            self.default_charging_amps = v.clamp(0, 32);
        }
        if let Some(v) = update.daily_grid_budget_kwh {
            self.daily_grid_budget_kwh = v;
        }
        if let Some(v) = update.max_grid_import_w {
            self.max_grid_import_w = v;
        }
        if let Some(v) = update.tessie_enabled {
            self.tessie_enabled = v;
        }
        if let Some(v) = update.electricity_rate {
            self.electricity_rate = v.max(0.0);
        }
        if let Some(v) = update.home_lat {
            self.home_lat = Some(v);
        }
        if let Some(v) = update.home_lon {
            self.home_lon = Some(v);
        }
        if let Some(v) = update.home_radius_m {
            self.home_radius_m = v.max(10.0);
        }
        if let Some(ref v) = update.timezone {
            if v.parse::<chrono_tz::Tz>().is_ok() {
                self.timezone = v.clone();
            }
        }
        if let Some(v) = update.charging_strategy {
            self.charging_strategy = v;
        }
        if let Some(ref v) = update.departure_time {
            self.departure_time = v.clone();
        }
        if let Some(v) = update.circuit_voltage {
            if v > 0.0 {
                self.circuit_voltage = v;
            }
        }
        if let Some(v) = update.panel_capacity_w {
            self.panel_capacity_w = v;
        }
        if let Some(v) = update.has_home_battery {
            self.has_home_battery = v;
        }
        if let Some(v) = update.has_net_metering {
            self.has_net_metering = v;
        }
    }
}

/// Partial settings update; `None` fields are left untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsUpdate {
    pub target_soc: Option<u32>,
    pub default_charging_amps: Option<u32>,
    pub daily_grid_budget_kwh: Option<f64>,
    pub max_grid_import_w: Option<f64>,
    pub tessie_enabled: Option<bool>,
    pub electricity_rate: Option<f64>,
    pub home_lat: Option<f64>,
    pub home_lon: Option<f64>,
    pub home_radius_m: Option<f64>,
    pub timezone: Option<String>,
    pub charging_strategy: Option<ChargingStrategy>,
    pub departure_time: Option<String>,
    pub circuit_voltage: Option<f64>,
    pub panel_capacity_w: Option<u32>,
    pub has_home_battery: Option<bool>,
    pub has_net_metering: Option<bool>,
}

/// AI tuning parameters, exposed via the admin endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettings {
    /// Primary model id
    pub ai_model: String,

    /// Smaller fallback model tried after the primary is exhausted
    pub ai_fallback_model: String,

    /// Sampling temperature
    pub ai_temperature: f64,

    /// Token cap per generation
    pub ai_max_tokens: u32,

    /// Lowest amperage the model may recommend (vehicle minimum)
    pub ai_min_amps: u32,

    /// Highest amperage the model may recommend
    pub ai_max_amps: u32,

    /// Baseline seconds between scheduled model calls
    pub ai_call_interval_secs: u64,

    /// Age after which a recommendation is flagged stale
    pub ai_stale_threshold_secs: u64,

    /// Attempts against the primary model before falling back
    pub ai_retry_attempts: u32,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            ai_model: "qwen2.5:7b".to_string(),
            ai_fallback_model: "qwen2.5:1.5b".to_string(),
            ai_temperature: 0.1,
            ai_max_tokens: 150,
            ai_min_amps: 5,
            ai_max_amps: 32,
            ai_call_interval_secs: 300,
            ai_stale_threshold_secs: 360,
            ai_retry_attempts: 3,
        }
    }
}

impl AiSettings {
    /// Apply a partial update; only provided fields change
    pub fn apply_update(&mut self, update: &AiSettingsUpdate) {
        if let Some(ref v) = update.ai_model {
            if !v.trim().is_empty() {
                self.ai_model = v.clone();
            }
        }
        if let Some(ref v) = update.ai_fallback_model {
            self.ai_fallback_model = v.clone();
        }
        if let Some(v) = update.ai_temperature {
            self.ai_temperature = v.clamp(0.0, 2.0);
        }
        if let Some(v) = update.ai_max_tokens {
            self.ai_max_tokens = v.clamp(16, 4096);
        }
        if let Some(v) = update.ai_min_amps {
            self.ai_min_amps = v.min(32);
        }
        if let Some(v) = update.ai_max_amps {
            self.ai_max_amps = v.clamp(1, 32);
        }
        if let Some(v) = update.ai_call_interval_secs {
            self.ai_call_interval_secs = v.max(30);
        }
        if let Some(v) = update.ai_stale_threshold_secs {
            self.ai_stale_threshold_secs = v.max(60);
        }
        if let Some(v) = update.ai_retry_attempts {
            self.ai_retry_attempts = v.clamp(1, 10);
        }
    }
}

/// Partial AI settings update
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AiSettingsUpdate {
    pub ai_model: Option<String>,
    pub ai_fallback_model: Option<String>,
    pub ai_temperature: Option<f64>,
    pub ai_max_tokens: Option<u32>,
    pub ai_min_amps: Option<u32>,
    pub ai_max_amps: Option<u32>,
    pub ai_call_interval_secs: Option<u64>,
    pub ai_stale_threshold_secs: Option<u64>,
    pub ai_retry_attempts: Option<u32>,
}
