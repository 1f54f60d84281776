//! Charge decision engine
//!
//! One `decide` call per cycle turns the derived mode, the latest AI
//! recommendation and the rule-based strategies into a single amperage
//! command. The engine is pure: it never talks to the vehicle and never
//! mutates state. Dispatch throttling (minimum delta / minimum interval)
//! belongs to the control loop.

use crate::advisor::AiRecommendation;
use crate::mode::Mode;
use crate::settings::{ChargingStrategy, Settings};

/// Assumed usable vehicle battery capacity for time-to-target math
const BATTERY_CAPACITY_KWH: f64 = 75.0;

/// Grid-import fraction below which ramping up is allowed
const GRID_HEADROOM_FRACTION: f64 = 0.8;

/// What the dispatcher should do this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmpCommand {
    /// Issue no command at all; keep whatever the vehicle is doing
    Hold,
    /// Stop charging
    Stop,
    /// Set the charger to this amperage
    Set(u32),
}

/// The engine's output for one cycle
#[derive(Debug, Clone)]
pub struct Decision {
    pub command: AmpCommand,
    pub reason: String,
    /// Whether this decision came from the rule-based path rather than AI
    pub rule_based: bool,
}

impl Decision {
    fn rule(command: AmpCommand, reason: impl Into<String>) -> Self {
        Self {
            command,
            reason: reason.into(),
            rule_based: true,
        }
    }
}

/// Everything `decide` looks at for one cycle
#[derive(Debug)]
pub struct DecisionInputs<'a> {
    pub mode: &'a Mode,
    pub settings: &'a Settings,
    /// Latest recommendation, if any
    pub ai: Option<&'a AiRecommendation>,
    /// Whether that recommendation is still within the stale threshold
    pub ai_fresh: bool,
    /// Smoothed solar yield (W)
    pub solar_w: f64,
    pub household_w: f64,
    /// Signed grid power (W); negative means exporting
    pub grid_import_w: f64,
    pub vehicle_soc: u32,
    /// Amps the vehicle is currently charging at
    pub current_amps: u32,
    /// Latched amps while in manual override
    pub manual_override_amps: u32,
    /// Minutes until configured departure, when that strategy is active
    pub minutes_to_departure: Option<i64>,
    pub min_amps: u32,
    pub max_amps: u32,
}

/// Produce the amperage command for this cycle
pub fn decide(inputs: &DecisionInputs<'_>) -> Decision {
    match inputs.mode {
        // Away or unknown location: issue nothing at all, so a vehicle at
        // someone else's charger is never touched.
        Mode::SuspendedChargingAway => {
            return Decision::rule(AmpCommand::Hold, "Charging away from home; not managed")
        }
        Mode::SuspendedLocationUnknown => {
            return Decision::rule(AmpCommand::Hold, "Location unknown; not managed")
        }
        Mode::SuspendedNight => {
            return Decision::rule(AmpCommand::Stop, "No solar expected; charging paused")
        }
        Mode::SuspendedUnplugged => {
            return Decision::rule(AmpCommand::Stop, "Charge port not connected")
        }
        Mode::CutoffGridBudgetReached => {
            return Decision::rule(AmpCommand::Stop, "Daily grid budget reached")
        }
        Mode::TessieDisconnected => {
            return Decision::rule(AmpCommand::Hold, "Vehicle integration disabled")
        }
        Mode::ManualOverride => {
            return Decision::rule(
                AmpCommand::Set(inputs.manual_override_amps.min(inputs.max_amps)),
                format!("Manual override at {}A", inputs.manual_override_amps),
            )
        }
        Mode::ChargingNoLimits => {
            return Decision::rule(AmpCommand::Hold, "No limits configured; not managed")
        }
        Mode::AiOptimizing => {
            if let Some(rec) = inputs.ai {
                if inputs.ai_fresh {
                    let amps = rec.amps.min(inputs.max_amps);
                    let command = if amps == 0 {
                        AmpCommand::Stop
                    } else {
                        AmpCommand::Set(amps)
                    };
                    return Decision {
                        command,
                        reason: rec.reasoning.clone(),
                        rule_based: false,
                    };
                }
            }
            // Stale or missing recommendation degrades to rules for this cycle
        }
        Mode::SolarOptimizing | Mode::Other(_) => {}
    }

    if inputs.vehicle_soc >= inputs.settings.target_soc {
        return Decision::rule(
            AmpCommand::Stop,
            format!("Target SoC {}% reached", inputs.settings.target_soc),
        );
    }

    match inputs.settings.charging_strategy {
        ChargingStrategy::SolarFirst => decide_solar_first(inputs),
        ChargingStrategy::Departure => decide_departure(inputs),
    }
}

/// Amps the current solar surplus can carry without grid draw
fn solar_amps(inputs: &DecisionInputs<'_>) -> u32 {
    let surplus = (inputs.solar_w - inputs.household_w).max(0.0);
    let amps = (surplus / inputs.settings.circuit_voltage).floor();
    (amps as u32).min(inputs.max_amps)
}

fn decide_solar_first(inputs: &DecisionInputs<'_>) -> Decision {
    let available = solar_amps(inputs);
    if available < inputs.min_amps {
        return Decision::rule(
            AmpCommand::Stop,
            format!(
                "Solar surplus supports only {}A, below the {}A minimum; pausing",
                available, inputs.min_amps
            ),
        );
    }
    let target = grid_limited(available, inputs);
    if target < inputs.min_amps {
        return Decision::rule(
            AmpCommand::Stop,
            format!(
                "Grid ceiling leaves only {}A, below the {}A minimum; pausing",
                target, inputs.min_amps
            ),
        );
    }
    Decision::rule(
        AmpCommand::Set(target),
        format!(
            "Solar surplus {:.0}W supports {}A",
            (inputs.solar_w - inputs.household_w).max(0.0),
            target
        ),
    )
}

fn decide_departure(inputs: &DecisionInputs<'_>) -> Decision {
    let soc_gap = inputs.settings.target_soc.saturating_sub(inputs.vehicle_soc);
    let kwh_needed = soc_gap as f64 / 100.0 * BATTERY_CAPACITY_KWH;

    let required = match inputs.minutes_to_departure {
        Some(mins) if mins > 0 => {
            let hours = mins as f64 / 60.0;
            let required_w = kwh_needed * 1000.0 / hours;
            (required_w / inputs.settings.circuit_voltage).ceil() as u32
        }
        // Departure already passed or unset: charge at whatever is needed
        _ => inputs.max_amps,
    };

    let available = solar_amps(inputs);
    // Ahead of pace: stay on solar. Behind: draw grid, but never trickle
    // below the vehicle minimum.
    let target = required
        .max(available)
        .clamp(inputs.min_amps, inputs.max_amps);
    let target = grid_limited(target, inputs);

    Decision::rule(
        AmpCommand::Set(target.max(inputs.min_amps)),
        format!(
            "Departure pace needs {}A, solar covers {}A; charging at {}A",
            required.min(inputs.max_amps),
            available,
            target.max(inputs.min_amps)
        ),
    )
}

/// Apply the grid-import ceiling bidirectionally.
///
/// Importing above the limit sheds amps to get back under it. Importing
/// below 80% of the limit allows ramping into the remaining headroom.
/// In between, the current rate is kept to avoid oscillation.
fn grid_limited(target: u32, inputs: &DecisionInputs<'_>) -> u32 {
    let max_import = inputs.settings.max_grid_import_w;
    if max_import <= 0.0 {
        return target;
    }
    let voltage = inputs.settings.circuit_voltage;

    if inputs.grid_import_w > max_import {
        let shed = ((inputs.grid_import_w - max_import) / voltage).ceil() as u32;
        return inputs.current_amps.saturating_sub(shed).min(target);
    }
    if inputs.grid_import_w < GRID_HEADROOM_FRACTION * max_import {
        let headroom =
            ((max_import - inputs.grid_import_w.max(0.0)) / voltage).floor() as u32;
        return target.min(inputs.current_amps.saturating_add(headroom));
    }
    inputs.current_amps.min(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::Confidence;
    use chrono::Utc;

    fn inputs<'a>(mode: &'a Mode, settings: &'a Settings) -> DecisionInputs<'a> {
        DecisionInputs {
            mode,
            settings,
            ai: None,
            ai_fresh: false,
            solar_w: 0.0,
            household_w: 0.0,
            grid_import_w: 0.0,
            vehicle_soc: 50,
            current_amps: 0,
            manual_override_amps: 0,
            minutes_to_departure: None,
            min_amps: 5,
            max_amps: 32,
        }
    }

    fn rec(amps: u32) -> AiRecommendation {
        AiRecommendation {
            amps,
            reasoning: "model says so".to_string(),
            confidence: Confidence::High,
            trigger: "scheduled".to_string(),
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_solar_first_basic_surplus() {
        let settings = Settings::default();
        let mode = Mode::SolarOptimizing;
        let mut i = inputs(&mode, &settings);
        i.solar_w = 4200.0;
        i.household_w = 750.0;
        // floor((4200-750)/230) = 15
        let d = decide(&i);
        assert_eq!(d.command, AmpCommand::Set(15));
        assert!(d.rule_based);
    }

    #[test]
    fn test_solar_first_pauses_below_minimum() {
        let settings = Settings::default();
        let mode = Mode::SolarOptimizing;
        let mut i = inputs(&mode, &settings);
        i.solar_w = 1500.0;
        i.household_w = 800.0;
        // floor(700/230) = 3 < 5 minimum
        let d = decide(&i);
        assert_eq!(d.command, AmpCommand::Stop);
        assert!(d.reason.contains("3A"));
    }

    #[test]
    fn test_suspended_modes() {
        let settings = Settings::default();
        for (mode, expected) in [
            (Mode::SuspendedChargingAway, AmpCommand::Hold),
            (Mode::SuspendedLocationUnknown, AmpCommand::Hold),
            (Mode::SuspendedNight, AmpCommand::Stop),
            (Mode::SuspendedUnplugged, AmpCommand::Stop),
            (Mode::CutoffGridBudgetReached, AmpCommand::Stop),
            (Mode::TessieDisconnected, AmpCommand::Hold),
            (Mode::ChargingNoLimits, AmpCommand::Hold),
        ] {
            let d = decide(&inputs(&mode, &settings));
            assert_eq!(d.command, expected, "mode {:?}", mode);
        }
    }

    #[test]
    fn test_manual_override_echoes_latched_amps() {
        let settings = Settings::default();
        let mode = Mode::ManualOverride;
        let mut i = inputs(&mode, &settings);
        i.manual_override_amps = 10;
        // Even with huge surplus the override wins
        i.solar_w = 8000.0;
        let d = decide(&i);
        assert_eq!(d.command, AmpCommand::Set(10));
    }

    #[test]
    fn test_ai_fresh_recommendation_used() {
        let settings = Settings::default();
        let mode = Mode::AiOptimizing;
        let r = rec(14);
        let mut i = inputs(&mode, &settings);
        i.ai = Some(&r);
        i.ai_fresh = true;
        let d = decide(&i);
        assert_eq!(d.command, AmpCommand::Set(14));
        assert!(!d.rule_based);
        assert_eq!(d.reason, "model says so");
    }

    #[test]
    fn test_ai_zero_recommendation_stops() {
        let settings = Settings::default();
        let mode = Mode::AiOptimizing;
        let r = rec(0);
        let mut i = inputs(&mode, &settings);
        i.ai = Some(&r);
        i.ai_fresh = true;
        assert_eq!(decide(&i).command, AmpCommand::Stop);
    }

    #[test]
    fn test_ai_stale_degrades_to_rules() {
        let settings = Settings::default();
        let mode = Mode::AiOptimizing;
        let r = rec(30);
        let mut i = inputs(&mode, &settings);
        i.ai = Some(&r);
        i.ai_fresh = false;
        i.solar_w = 4200.0;
        i.household_w = 750.0;
        let d = decide(&i);
        assert_eq!(d.command, AmpCommand::Set(15));
        assert!(d.rule_based);
    }

    #[test]
    fn test_target_soc_reached_stops() {
        let settings = Settings::default();
        let mode = Mode::SolarOptimizing;
        let mut i = inputs(&mode, &settings);
        i.vehicle_soc = 80;
        i.solar_w = 5000.0;
        assert_eq!(decide(&i).command, AmpCommand::Stop);
    }

    #[test]
    fn test_departure_behind_pace_draws_grid() {
        let settings = Settings {
            charging_strategy: ChargingStrategy::Departure,
            max_grid_import_w: 0.0,
            ..Default::default()
        };
        let mode = Mode::SolarOptimizing;
        let mut i = inputs(&mode, &settings);
        i.vehicle_soc = 50;
        i.minutes_to_departure = Some(120); // 2h for 22.5 kWh
        i.solar_w = 1000.0;
        // required: 22.5 kWh / 2h = 11250 W -> ceil(11250/230) = 49 -> clamp 32
        let d = decide(&i);
        assert_eq!(d.command, AmpCommand::Set(32));
    }

    #[test]
    fn test_departure_ahead_of_pace_stays_on_solar() {
        let settings = Settings {
            charging_strategy: ChargingStrategy::Departure,
            target_soc: 55,
            ..Default::default()
        };
        let mode = Mode::SolarOptimizing;
        let mut i = inputs(&mode, &settings);
        i.vehicle_soc = 50;
        i.minutes_to_departure = Some(600); // 10h for 3.75 kWh
        i.solar_w = 3000.0;
        i.household_w = 500.0;
        // required: ceil(375/230) = 2; solar: floor(2500/230) = 10
        let d = decide(&i);
        assert_eq!(d.command, AmpCommand::Set(10));
    }

    #[test]
    fn test_grid_limit_sheds_amps_when_over() {
        let settings = Settings {
            max_grid_import_w: 2000.0,
            ..Default::default()
        };
        let mode = Mode::SolarOptimizing;
        let mut i = inputs(&mode, &settings);
        i.solar_w = 4000.0;
        i.household_w = 500.0; // 15A of surplus
        i.current_amps = 15;
        i.grid_import_w = 2690.0; // 690 W over -> shed ceil(690/230) = 3
        let d = decide(&i);
        assert_eq!(d.command, AmpCommand::Set(12));
    }

    #[test]
    fn test_grid_limit_never_sets_below_minimum() {
        let settings = Settings {
            max_grid_import_w: 2000.0,
            ..Default::default()
        };
        let mode = Mode::SolarOptimizing;
        let mut i = inputs(&mode, &settings);
        i.solar_w = 4000.0;
        i.household_w = 500.0;
        i.current_amps = 6;
        i.grid_import_w = 2690.0; // shed ceil(690/230) = 3 -> 6-3 = 3 < 5 minimum
        let d = decide(&i);
        assert_eq!(d.command, AmpCommand::Stop);
        assert!(d.reason.contains("3A"));
    }

    #[test]
    fn test_departure_grid_limit_keeps_vehicle_minimum() {
        let settings = Settings {
            charging_strategy: ChargingStrategy::Departure,
            max_grid_import_w: 2000.0,
            ..Default::default()
        };
        let mode = Mode::SolarOptimizing;
        let mut i = inputs(&mode, &settings);
        i.vehicle_soc = 50;
        i.minutes_to_departure = Some(120);
        i.current_amps = 6;
        i.grid_import_w = 2690.0;
        // Behind pace with the ceiling shedding below 5A: the departure
        // path floors at the vehicle minimum instead of trickling lower.
        let d = decide(&i);
        assert_eq!(d.command, AmpCommand::Set(5));
    }

    #[test]
    fn test_grid_limit_holds_in_dead_band() {
        let settings = Settings {
            max_grid_import_w: 2000.0,
            ..Default::default()
        };
        let mode = Mode::SolarOptimizing;
        let mut i = inputs(&mode, &settings);
        i.solar_w = 4000.0;
        i.household_w = 500.0;
        i.current_amps = 8;
        i.grid_import_w = 1800.0; // between 80% and 100% of limit
        let d = decide(&i);
        assert_eq!(d.command, AmpCommand::Set(8));
    }
}
