//! Operating mode derivation
//!
//! `derive_mode` is the single authority for "should we even be charging".
//! It is a pure total function over this cycle's inputs, evaluated with
//! strict precedence: the first matching rule wins and later rules are not
//! consulted. All mutation happens in the callers that react to the result.

use crate::location::ChargerLocation;
use crate::settings::ChargingStrategy;
use serde::{Deserialize, Serialize};

/// User-facing operating mode; exactly one holds per cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Mode {
    SolarOptimizing,
    SuspendedNight,
    SuspendedUnplugged,
    SuspendedChargingAway,
    SuspendedLocationUnknown,
    CutoffGridBudgetReached,
    ManualOverride,
    ChargingNoLimits,
    AiOptimizing,
    TessieDisconnected,
    /// Unlisted mode string, kept verbatim for forward compatibility
    Other(String),
}

impl Mode {
    pub fn as_str(&self) -> &str {
        match self {
            Mode::SolarOptimizing => "Solar Optimizing",
            Mode::SuspendedNight => "Suspended – Night",
            Mode::SuspendedUnplugged => "Suspended – Unplugged",
            Mode::SuspendedChargingAway => "Suspended – Charging Away",
            Mode::SuspendedLocationUnknown => "Suspended – Location Unknown",
            Mode::CutoffGridBudgetReached => "Cutoff – Grid Budget Reached",
            Mode::ManualOverride => "Manual Override",
            Mode::ChargingNoLimits => "Charging – No Limits",
            Mode::AiOptimizing => "AI Optimizing",
            Mode::TessieDisconnected => "Tessie Disconnected",
            Mode::Other(s) => s,
        }
    }

    /// Any suspension variant: pause without counting as a cutoff
    pub fn is_suspended(&self) -> bool {
        matches!(
            self,
            Mode::SuspendedNight
                | Mode::SuspendedUnplugged
                | Mode::SuspendedChargingAway
                | Mode::SuspendedLocationUnknown
        )
    }

    pub fn is_cutoff(&self) -> bool {
        matches!(self, Mode::CutoffGridBudgetReached)
    }
}

impl From<String> for Mode {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Solar Optimizing" => Mode::SolarOptimizing,
            "Suspended – Night" => Mode::SuspendedNight,
            "Suspended – Unplugged" => Mode::SuspendedUnplugged,
            "Suspended – Charging Away" => Mode::SuspendedChargingAway,
            "Suspended – Location Unknown" => Mode::SuspendedLocationUnknown,
            "Cutoff – Grid Budget Reached" => Mode::CutoffGridBudgetReached,
            "Manual Override" => Mode::ManualOverride,
            "Charging – No Limits" => Mode::ChargingNoLimits,
            "AI Optimizing" => Mode::AiOptimizing,
            "Tessie Disconnected" => Mode::TessieDisconnected,
            _ => Mode::Other(s),
        }
    }
}

impl From<Mode> for String {
    fn from(m: Mode) -> Self {
        m.as_str().to_string()
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything mode derivation looks at for one cycle
#[derive(Debug, Clone, Copy)]
pub struct ModeInputs {
    pub manual_override_active: bool,
    pub tessie_enabled: bool,
    pub location: ChargerLocation,
    /// Whether the current local time falls inside the daylight window
    pub within_daylight: bool,
    pub strategy: ChargingStrategy,
    pub budget_exhausted: bool,
    pub max_grid_import_w: f64,
    pub ai_enabled: bool,
    pub ai_healthy: bool,
}

/// Derive the operating mode with strict precedence; first match wins
pub fn derive_mode(inputs: &ModeInputs) -> Mode {
    if inputs.manual_override_active {
        return Mode::ManualOverride;
    }
    if !inputs.tessie_enabled {
        return Mode::TessieDisconnected;
    }
    match inputs.location {
        ChargerLocation::ChargingAtHome => {}
        ChargerLocation::NotConnected => return Mode::SuspendedUnplugged,
        ChargerLocation::ChargingAway => return Mode::SuspendedChargingAway,
        ChargerLocation::LocationUnknown => return Mode::SuspendedLocationUnknown,
    }
    if !inputs.within_daylight && inputs.strategy == ChargingStrategy::SolarFirst {
        return Mode::SuspendedNight;
    }
    if inputs.budget_exhausted {
        return Mode::CutoffGridBudgetReached;
    }
    if inputs.max_grid_import_w <= 0.0 && !inputs.ai_enabled {
        return Mode::ChargingNoLimits;
    }
    if inputs.ai_enabled && inputs.ai_healthy {
        return Mode::AiOptimizing;
    }
    Mode::SolarOptimizing
}
