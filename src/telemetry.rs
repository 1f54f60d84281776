//! Per-cycle telemetry snapshot types
//!
//! One `TelemetrySnapshot` is assembled at the top of every control cycle
//! from the inverter, vehicle, and forecast collectors. It is immutable for
//! the rest of the cycle and superseded by the next one; every downstream
//! component (budget, mode, advisor, engine, session accountant) reads from
//! the same snapshot so a cycle never mixes readings of different ages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Vehicle charging state as reported by the vehicle API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChargingState {
    Charging,
    Complete,
    Stopped,
    Disconnected,
    /// Unlisted state string, kept verbatim for display
    Other(String),
}

impl From<String> for ChargingState {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Charging" => ChargingState::Charging,
            "Complete" => ChargingState::Complete,
            "Stopped" => ChargingState::Stopped,
            "Disconnected" => ChargingState::Disconnected,
            _ => ChargingState::Other(s),
        }
    }
}

impl From<ChargingState> for String {
    fn from(s: ChargingState) -> Self {
        s.as_str().to_string()
    }
}

impl ChargingState {
    pub fn as_str(&self) -> &str {
        match self {
            ChargingState::Charging => "Charging",
            ChargingState::Complete => "Complete",
            ChargingState::Stopped => "Stopped",
            ChargingState::Disconnected => "Disconnected",
            ChargingState::Other(s) => s,
        }
    }

    pub fn is_charging(&self) -> bool {
        matches!(self, ChargingState::Charging)
    }
}

/// Parsed inverter reading from the solar cloud API
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InverterReading {
    /// PV generation across all strings (W)
    pub solar_w: f64,

    /// Grid import (W); 0 when exporting
    pub grid_import_w: f64,

    /// Grid export (W); 0 when importing
    pub grid_export_w: f64,

    /// Home battery state of charge (%)
    pub battery_soc: u32,

    /// Home battery power (W, positive = discharging)
    pub battery_w: f64,

    /// Household demand (W), derived as solar minus feed-in
    pub household_demand_w: f64,

    /// Today's PV yield (kWh)
    pub yield_today_kwh: f64,

    /// Cumulative grid import counter (kWh)
    pub consume_energy_kwh: f64,

    /// Upload timestamp string from the cloud, for display
    pub upload_time: String,
}

impl InverterReading {
    /// Solar surplus after household demand (W, never negative)
    pub fn surplus_w(&self) -> f64 {
        (self.solar_w - self.household_demand_w).max(0.0)
    }
}

/// Parsed vehicle state from the vehicle API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleState {
    /// Charge port connected flag
    pub charge_port_connected: bool,

    /// Reported charging state
    pub charging_state: ChargingState,

    /// Vehicle battery level (%)
    pub soc: u32,

    /// Actual charging amps
    pub charging_amps: u32,

    /// Charging power (kW)
    pub charging_kw: f64,

    /// Energy added this charge per the vehicle's own meter (kWh)
    pub charge_energy_added: f64,

    /// Vehicle-estimated minutes until the charge limit is reached
    pub minutes_to_full_charge: u32,

    /// GPS position
    pub latitude: f64,
    pub longitude: f64,

    /// Named location reported by the vehicle service, lowercased ("home")
    pub saved_location: Option<String>,
}

impl Default for VehicleState {
    fn default() -> Self {
        Self {
            charge_port_connected: false,
            charging_state: ChargingState::Disconnected,
            soc: 0,
            charging_amps: 0,
            charging_kw: 0.0,
            charge_energy_added: 0.0,
            minutes_to_full_charge: 0,
            latitude: 0.0,
            longitude: 0.0,
            saved_location: None,
        }
    }
}

/// One hour of the irradiance forecast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastHour {
    /// Local hour label, HH:MM
    pub time: String,

    /// Global horizontal irradiance (W/m²)
    pub irradiance_wm2: f64,

    /// Estimated PV output at this hour (W)
    pub estimated_w: f64,

    /// Cloud cover (%)
    pub cloud_pct: f64,

    /// Temperature (°C)
    pub temperature_c: f64,
}

/// Daily solar forecast summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Forecast {
    /// Sunrise in local time, HH:MM
    pub sunrise: String,

    /// Sunset in local time, HH:MM
    pub sunset: String,

    /// Start of the peak-production window, HH:MM
    pub peak_start: String,

    /// End of the peak-production window, HH:MM
    pub peak_end: String,

    /// Hourly series for the rest of the day
    pub hours: Vec<ForecastHour>,
}

/// Immutable per-cycle telemetry bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Latest inverter reading, if the fetch succeeded
    pub inverter: Option<InverterReading>,

    /// Latest vehicle state, if the fetch succeeded
    pub vehicle: Option<VehicleState>,

    /// Cached forecast; refreshed on its own slower cadence
    pub forecast: Option<Forecast>,

    /// When this snapshot was assembled
    pub fetched_at: DateTime<Utc>,
}

impl TelemetrySnapshot {
    pub fn new(
        inverter: Option<InverterReading>,
        vehicle: Option<VehicleState>,
        forecast: Option<Forecast>,
    ) -> Self {
        Self {
            inverter,
            vehicle,
            forecast,
            fetched_at: Utc::now(),
        }
    }

    /// Seconds since this snapshot was assembled
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.fetched_at).num_seconds().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charging_state_round_trip() {
        let s: ChargingState = "Charging".to_string().into();
        assert_eq!(s, ChargingState::Charging);
        assert!(s.is_charging());

        let s: ChargingState = "NoPower".to_string().into();
        assert_eq!(s, ChargingState::Other("NoPower".to_string()));
        assert_eq!(s.as_str(), "NoPower");
        assert!(!s.is_charging());
    }

    #[test]
    fn test_charging_state_serde_as_string() {
        let json = serde_json::to_string(&ChargingState::Complete).unwrap();
        assert_eq!(json, "\"Complete\"");
        let back: ChargingState = serde_json::from_str("\"Starting\"").unwrap();
        assert_eq!(back, ChargingState::Other("Starting".to_string()));
    }

    #[test]
    fn test_surplus_never_negative() {
        let reading = InverterReading {
            solar_w: 500.0,
            household_demand_w: 900.0,
            ..Default::default()
        };
        assert_eq!(reading.surplus_w(), 0.0);

        let reading = InverterReading {
            solar_w: 4200.0,
            household_demand_w: 750.0,
            ..Default::default()
        };
        assert_eq!(reading.surplus_w(), 3450.0);
    }

    #[test]
    fn test_snapshot_age() {
        let snap = TelemetrySnapshot::new(None, None, None);
        assert!(snap.age_secs() <= 1);
    }
}
