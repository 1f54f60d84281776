//! Deterministic prompt construction for the charging advisor
//!
//! The prompt is a pure function of its context struct so the debug
//! endpoints can preview exactly what the model will see. Same inputs,
//! same prompt, byte for byte.

use crate::settings::ChargingStrategy;

/// Everything the prompt serializes for one advisory call
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub solar_w: f64,
    pub solar_trend: String,
    pub household_w: f64,
    pub grid_import_w: f64,
    pub battery_soc: u32,
    pub battery_w: f64,
    pub vehicle_soc: u32,
    pub target_soc: u32,
    pub current_amps: u32,
    pub grid_budget_remaining_kwh: f64,
    pub grid_budget_total_kwh: f64,
    pub max_grid_import_w: f64,
    pub hours_until_sunset: f64,
    pub irradiance_curve: String,
    pub trigger_reason: String,
    pub charging_strategy: ChargingStrategy,
    pub departure_time: String,
    pub session_elapsed_mins: i64,
    pub session_kwh_added: f64,
    pub session_solar_pct: f64,
    pub current_time: String,
    pub minutes_to_full_charge: u32,
    pub has_home_battery: bool,
    pub has_net_metering: bool,
    pub panel_capacity_w: u32,
    pub circuit_voltage: f64,
    pub min_amps: u32,
    pub max_amps: u32,
}

/// Usable vehicle battery capacity assumed for time-to-target estimates
const BATTERY_CAPACITY_KWH: f64 = 75.0;

fn hours_at(amps: u32, kwh_needed: f64, kwh_per_amp_hour: f64) -> f64 {
    if amps == 0 || kwh_needed <= 0.0 {
        return 0.0;
    }
    kwh_needed / (amps as f64 * kwh_per_amp_hour)
}

/// Minutes between two HH:MM times, rolling over midnight when needed
pub(crate) fn minutes_until(now_hhmm: &str, later_hhmm: &str) -> Option<i64> {
    let parse = |s: &str| -> Option<i64> {
        let mut parts = s.trim().split(':');
        let h: i64 = parts.next()?.parse().ok()?;
        let m: i64 = parts.next()?.parse().ok()?;
        if (0..24).contains(&h) && (0..60).contains(&m) {
            Some(h * 60 + m)
        } else {
            None
        }
    };
    let now = parse(now_hhmm)?;
    let mut later = parse(later_hhmm)?;
    if later <= now {
        later += 24 * 60;
    }
    Some(later - now)
}

/// Build the advisory prompt from one cycle's context
pub fn build_prompt(ctx: &PromptContext) -> String {
    let kwh_per_amp_hour = ctx.circuit_voltage / 1000.0;
    let soc_gap = ctx.target_soc.saturating_sub(ctx.vehicle_soc);
    let kwh_needed = soc_gap as f64 / 100.0 * BATTERY_CAPACITY_KWH;
    let solar_surplus_w = (ctx.solar_w - ctx.household_w).max(0.0);
    let max_solar_amps =
        (solar_surplus_w / ctx.circuit_voltage).floor().min(ctx.max_amps as f64) as u32;

    let hours_at_current = hours_at(ctx.current_amps, kwh_needed, kwh_per_amp_hour);
    let hours_at_max_solar = hours_at(max_solar_amps, kwh_needed, kwh_per_amp_hour);
    let hours_at_max = hours_at(ctx.max_amps, kwh_needed, kwh_per_amp_hour);

    let progress_pct = if kwh_needed > 0.0 {
        ctx.session_kwh_added / kwh_needed * 100.0
    } else {
        100.0
    };
    let kwh_remaining = (kwh_needed - ctx.session_kwh_added).max(0.0);
    let current_rate_kwh_h = ctx.current_amps as f64 * kwh_per_amp_hour;

    // Departure feasibility
    let mut hours_to_departure = 0.0;
    let mut min_amps_for_departure = 0;
    let mut departure_feasible = String::new();
    if ctx.charging_strategy == ChargingStrategy::Departure && !ctx.departure_time.is_empty() {
        if let Some(mins) = minutes_until(&ctx.current_time, &ctx.departure_time) {
            hours_to_departure = mins as f64 / 60.0;
            if kwh_remaining <= 0.0 {
                departure_feasible = "Already at or above target SoC".to_string();
            } else if hours_to_departure > 0.0 {
                min_amps_for_departure = ((kwh_remaining
                    / (hours_to_departure * kwh_per_amp_hour))
                    .ceil() as u32)
                    .clamp(ctx.min_amps, ctx.max_amps.max(ctx.min_amps));
                departure_feasible = if min_amps_for_departure <= max_solar_amps {
                    "Achievable with solar alone".to_string()
                } else if (kwh_remaining / (hours_to_departure * kwh_per_amp_hour)).ceil()
                    <= ctx.max_amps as f64
                {
                    format!(
                        "Needs grid draw — minimum {}A required",
                        min_amps_for_departure
                    )
                } else {
                    format!(
                        "CANNOT reach target before departure even at {}A",
                        ctx.max_amps
                    )
                };
            }
        }
    }

    // Solar feasibility
    let solar_can_finish = if max_solar_amps < ctx.min_amps {
        format!("No — solar surplus below minimum {}A", ctx.min_amps)
    } else if kwh_needed > 0.0 {
        if hours_at_max_solar <= ctx.hours_until_sunset {
            "Yes".to_string()
        } else {
            "No".to_string()
        }
    } else {
        "N/A".to_string()
    };

    let goal_summary = if soc_gap == 0 {
        "Target SoC already reached — consider stopping or reducing rate.".to_string()
    } else {
        match ctx.charging_strategy {
            ChargingStrategy::SolarFirst => {
                if solar_can_finish == "Yes" {
                    format!(
                        "Achievable with solar alone — {:.1}h at {}A, {:.1}h of sun left.",
                        hours_at_max_solar, max_solar_amps, ctx.hours_until_sunset
                    )
                } else {
                    format!(
                        "Cannot finish with solar before sunset — would need {:.1}h but only {:.1}h left. Solar-first mode: accept partial charge.",
                        hours_at_max_solar, ctx.hours_until_sunset
                    )
                }
            }
            ChargingStrategy::Departure if !departure_feasible.is_empty() => {
                departure_feasible.clone()
            }
            _ => format!(
                "Need {:.1} kWh more. At {}A: {:.1}h. At {}A: {:.1}h.",
                kwh_remaining, ctx.current_amps, hours_at_current, ctx.max_amps, hours_at_max
            ),
        }
    };

    // Vehicle's own ETA, when it reports one
    let eta_line = if ctx.minutes_to_full_charge > 0 {
        format!(
            "\nVehicle ETA to charge limit at current rate: {}h {}m ({} min)",
            ctx.minutes_to_full_charge / 60,
            ctx.minutes_to_full_charge % 60,
            ctx.minutes_to_full_charge
        )
    } else {
        String::new()
    };

    let strategy_block = match ctx.charging_strategy {
        ChargingStrategy::Departure if !ctx.departure_time.is_empty() => format!(
            "Mode: DEPARTURE — Ready by {}\nCurrent time: {}\nHours until departure: {:.1}h\nMinimum amps to reach target by departure: {}A\nFeasibility: {}{}",
            ctx.departure_time,
            ctx.current_time,
            hours_to_departure,
            min_amps_for_departure,
            departure_feasible,
            eta_line
        ),
        _ => format!(
            "Mode: SOLAR-FIRST — Maximize solar, avoid grid draw\nCurrent time: {}\nCan finish with solar before sunset: {}{}",
            ctx.current_time, solar_can_finish, eta_line
        ),
    };

    let net_metering_block = if ctx.has_net_metering {
        "NET METERING NOTE: This system can export surplus solar for grid credit.\n\
         Unused solar is not wasted — it earns a return. Balance charging against\n\
         exporting; optimise for overall solar value, not just charging speed."
    } else {
        "NET METERING NOTE: This system cannot export solar to the grid for credit.\n\
         Any solar energy not consumed locally is wasted entirely. Prioritise\n\
         consuming all available solar; when surplus exists, prefer higher amps.\n\
         Grid budget is still a hard constraint, but solar consumption is the\n\
         primary goal."
    };

    let battery_block = if ctx.has_home_battery {
        "BATTERY NOTE: This system has a home battery. Apparent surplus may be\n\
         battery discharge rather than live solar; consider home battery SoC\n\
         before recommending aggressive charging."
    } else {
        "BATTERY NOTE: This system has no home battery. Decisions should be made\n\
         purely on live solar availability vs vehicle charging need."
    };

    format!(
        "You are a solar EV charging optimizer for a home energy system.\n\
         Recommend a charging rate in amps ({min}-{max}A) or 0 to stop.\n\
         You autonomously manage amperage to maximize solar efficiency while respecting constraints.\n\
         \n\
         === CHARGING STRATEGY ===\n\
         {strategy_block}\n\
         \n\
         === GOAL STATUS ===\n\
         Target SoC: {target}% (currently {soc}%, gap: {gap}%, ~{kwh_needed:.1} kWh needed)\n\
         Session progress: {added:.1} of {kwh_needed:.1} kWh added ({progress:.0}% complete)\n\
         Remaining: {remaining:.1} kWh\n\
         Current rate: {amps}A → {rate:.1} kWh/h → {h_cur:.1}h to finish\n\
         At max solar ({max_solar}A): {h_solar:.1}h to finish\n\
         At max rate ({max}A): {h_max:.1}h to finish\n\
         Hours of sun left: {sunset:.1}h\n\
         ASSESSMENT: {goal_summary}\n\
         \n\
         === CONSTRAINTS ===\n\
         Grid import budget remaining: {budget_rem:.1} kWh (of {budget_total:.1} kWh daily limit)\n\
         Max grid import rate: {max_import:.0}W\n\
         Vehicle minimum charging rate: {min}A (never recommend 1-{below_min}A)\n\
         Vehicle maximum charging rate: {max}A\n\
         Each amp ≈ {volts:.0}W at {volts:.0}V circuit ({kwh_amp:.2} kWh/h per amp)\n\
         \n\
         === SYSTEM CONFIGURATION ===\n\
         Home battery present: {has_batt}\n\
         Net metering enabled: {has_net}\n\
         Installed panel capacity: {panel}W (0 = unknown)\n\
         \n\
         === ACTUAL CONDITIONS (inverter — ground truth) ===\n\
         Solar yield: {solar:.0}W  |  Trend (last 5 min): {trend}\n\
         Total load (incl. vehicle): {house:.0}W\n\
         Solar surplus (available for car): {surplus:.0}W → max {max_solar}A without grid draw\n\
         Grid import: {import:.0}W  (+ = importing, - = exporting)\n\
         Home battery SoC: {batt_soc}%  |  Battery power: {batt_w:.0}W\n\
         \n\
         === SOLAR FORECAST ===\n\
         {curve}\n\
         \n\
         === SESSION CONTEXT ===\n\
         Session elapsed: {elapsed} min  |  Solar subsidy this session: {solar_pct:.0}%\n\
         Trigger reason: {trigger}\n\
         \n\
         === DECISION RULES ===\n\
         - Weight actual inverter data most heavily for the next 5-15 minutes\n\
         - Use the forecast for planning decisions beyond 15 minutes\n\
         - If solar trend is \"falling\" but the forecast shows recovery within 30 min, consider holding current rate\n\
         - Recommend the IDEAL target amps — the system handles ramping. Do NOT limit to small increments.\n\
         - Your recommendation should be AT LEAST max solar amps when surplus exists and SoC gap remains\n\
         - DEPARTURE mode: if behind pace, draw from grid. If ahead, stay solar-only.\n\
         - SOLAR mode: minimize grid draw. Be patient. Accept partial charge if solar is insufficient.\n\
         \n\
         === GRID DRAW POLICY (overarching goal is to MINIMIZE grid draw) ===\n\
         - If grid budget is 0 (no budget set / unlimited): minimize grid draw as much as possible.\n\
         - If grid budget > 0: allow grid draw freely while budget remaining > 10%; throttle\n\
           aggressively to solar-only or minimum amps when remaining < 10%.\n\
         - Never exceed the max grid import rate ({max_import:.0}W) regardless of budget.\n\
         \n\
         === REASONING MESSAGE INSTRUCTIONS ===\n\
         The \"reasoning\" field is shown to the user. It MUST state the goal context,\n\
         whether on track with numbers, and the action with why. NEVER write generic\n\
         statements; ALWAYS include specific numbers (watts, amps, hours, kWh, %).\n\
         \n\
         === SYSTEM-SPECIFIC GUIDANCE ===\n\
         {net_block}\n\
         \n\
         {batt_block}\n\
         \n\
         Respond ONLY in JSON (no preamble, no explanation outside JSON):\n\
         {{\"recommended_amps\": <int 0-{max}>, \"reasoning\": \"<1-2 sentences with specific numbers>\", \"confidence\": \"low|medium|high\"}}",
        min = ctx.min_amps,
        max = ctx.max_amps,
        below_min = ctx.min_amps.saturating_sub(1),
        strategy_block = strategy_block,
        target = ctx.target_soc,
        soc = ctx.vehicle_soc,
        gap = soc_gap,
        kwh_needed = kwh_needed,
        added = ctx.session_kwh_added,
        progress = progress_pct,
        remaining = kwh_remaining,
        amps = ctx.current_amps,
        rate = current_rate_kwh_h,
        h_cur = hours_at_current,
        max_solar = max_solar_amps,
        h_solar = hours_at_max_solar,
        h_max = hours_at_max,
        sunset = ctx.hours_until_sunset,
        goal_summary = goal_summary,
        budget_rem = ctx.grid_budget_remaining_kwh,
        budget_total = ctx.grid_budget_total_kwh,
        max_import = ctx.max_grid_import_w,
        volts = ctx.circuit_voltage,
        kwh_amp = kwh_per_amp_hour,
        has_batt = ctx.has_home_battery,
        has_net = ctx.has_net_metering,
        panel = ctx.panel_capacity_w,
        solar = ctx.solar_w,
        trend = ctx.solar_trend,
        house = ctx.household_w,
        surplus = solar_surplus_w,
        import = ctx.grid_import_w,
        batt_soc = ctx.battery_soc,
        batt_w = ctx.battery_w,
        curve = ctx.irradiance_curve,
        elapsed = ctx.session_elapsed_mins,
        solar_pct = ctx.session_solar_pct,
        trigger = ctx.trigger_reason,
        net_block = net_metering_block,
        batt_block = battery_block,
    )
}

/// Prompt for the natural-language daily outlook
pub fn build_outlook_prompt(
    forecast_summary: &str,
    vehicle_soc: u32,
    target_soc: u32,
    budget_remaining_kwh: f64,
) -> String {
    format!(
        "You are a home solar charging assistant. Write a short, friendly 2-3 sentence\n\
         outlook for today's EV charging, based on this forecast:\n\
         \n\
         {}\n\
         \n\
         Vehicle battery: {}% (target {}%). Grid budget remaining: {:.1} kWh.\n\
         Mention the best charging window and whether the target looks reachable on\n\
         solar alone. Plain text only, no markdown, no lists.",
        forecast_summary, vehicle_soc, target_soc, budget_remaining_kwh
    )
}
