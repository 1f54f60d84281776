//! Charge controller main loop
//!
//! `ChargeController` owns all mutable state: settings, clients, the budget
//! ledger, the advisor, the session accountant and persistence. The loop in
//! `run` is the sole writer; web handlers read and mutate through the same
//! mutex, so every reader sees a consistent snapshot.
//!
//! Cycle ordering is fixed: telemetry, then budget, then mode, then the
//! decision, then dispatch, then session accounting. Dispatching before the
//! budget update could authorize a command the cutoff should have blocked.

use crate::advisor::{
    self, AiRecommendation, AiStatus, Advisor, OllamaClient, PromptContext, TriggerSignals,
};
use crate::budget::GridBudgetLedger;
use crate::clients::solax::SolaxClient;
use crate::clients::telegram::TelegramClient;
use crate::clients::tessie::TessieClient;
use crate::clients::weather::{self, OpenMeteoClient};
use crate::clients::{Credentials, ForecastApi, InverterApi, ProbeResult, VehicleApi};
use crate::config::Config;
use crate::engine::{self, AmpCommand, Decision, DecisionInputs};
use crate::error::Result;
use crate::location::{self, ChargerLocation, LocationFix};
use crate::logging::{get_logger, StructuredLogger};
use crate::mode::{derive_mode, Mode, ModeInputs};
use crate::persistence::PersistenceManager;
use crate::session::{SessionAccountant, SessionEvent, SessionRecord};
use crate::settings::{AiSettings, AiSettingsUpdate, ChargingStrategy, Settings, SettingsUpdate};
use crate::telemetry::{Forecast, InverterReading, TelemetrySnapshot, VehicleState};
use chrono::{DateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration};

/// Forecast refresh cadence
const FORECAST_TTL_SECS: i64 = 3600;
/// Outlook cache lifetime after a successful generation
const OUTLOOK_TTL_SECS: i64 = 3600;
/// Shorter retry window after a failed generation
const OUTLOOK_RETRY_TTL_SECS: i64 = 120;
/// Identical amps are re-sent at most this often (keep-alive)
const MIN_DISPATCH_INTERVAL_SECS: i64 = 300;
/// Ollama health probe cadence
const HEALTH_CHECK_INTERVAL_SECS: i64 = 60;

/// Commands delivered to the control loop
#[derive(Debug)]
pub enum ControllerCommand {
    OverrideAmps(u32),
    ClearOverride,
    SetAiEnabled(bool),
    UpdateSettings(SettingsUpdate),
    UpdateAiSettings(AiSettingsUpdate),
    RefreshNow,
    Shutdown,
}

/// AI block of the status response
#[derive(Debug, Clone, Serialize)]
pub struct AiStatusView {
    pub enabled: bool,
    pub status: String,
    pub healthy: bool,
    pub recommendation: Option<AiRecommendation>,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetView {
    pub total_kwh: f64,
    pub used_kwh: f64,
    pub remaining_kwh: f64,
    pub used_pct: f64,
    pub exhausted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_mins: i64,
    pub start_soc: u32,
    pub current_soc: u32,
    pub kwh_added: f64,
    pub solar_kwh: f64,
    pub grid_kwh: f64,
    pub solar_pct: f64,
    pub saved: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandView {
    pub action: String,
    pub amps: Option<u32>,
    pub reason: String,
}

/// Full status snapshot served to the UI
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub mode: Mode,
    pub location: Option<LocationFix>,
    pub inverter: Option<InverterReading>,
    pub vehicle: Option<VehicleState>,
    pub data_age_secs: i64,
    pub solar_avg_w: f64,
    pub solar_trend: String,
    pub ai: AiStatusView,
    pub session: Option<SessionView>,
    pub budget: BudgetView,
    pub forecast: Option<Forecast>,
    pub manual_override_amps: Option<u32>,
    pub last_command: Option<CommandView>,
    pub tessie_enabled: bool,
    pub timestamp: DateTime<Utc>,
}

/// Per-service connectivity report
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub solax: ProbeResult,
    pub tessie: ProbeResult,
    pub weather: ProbeResult,
    pub ollama: ProbeResult,
    pub telegram: ProbeResult,
}

/// Synthetic inputs for the debug dry-run endpoints. Every field is
/// optional on the wire; the defaults describe a sunny early afternoon
/// with a modest household load.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DryRunScenario {
    pub solar_w: f64,
    pub household_w: f64,
    pub grid_import_w: f64,
    pub battery_soc: u32,
    pub battery_w: f64,
    pub vehicle_soc: u32,
    pub target_soc: u32,
    pub current_amps: u32,
    pub charging_strategy: ChargingStrategy,
    pub departure_time: String,
    pub grid_budget_total_kwh: f64,
    pub grid_budget_used_kwh: f64,
    pub max_grid_import_w: f64,
    pub solar_trend: String,
    pub session_elapsed_mins: i64,
    pub session_kwh_added: f64,
    pub session_solar_pct: f64,
    pub hours_until_sunset: f64,
    pub current_time: String,
    pub irradiance_curve: String,
    pub minutes_to_full_charge: u32,
    pub has_home_battery: bool,
    pub has_net_metering: bool,
    pub panel_capacity_w: u32,
}

impl Default for DryRunScenario {
    fn default() -> Self {
        Self {
            solar_w: 2800.0,
            household_w: 900.0,
            grid_import_w: 150.0,
            battery_soc: 65,
            battery_w: -200.0,
            vehicle_soc: 55,
            target_soc: 80,
            current_amps: 10,
            charging_strategy: ChargingStrategy::SolarFirst,
            departure_time: String::new(),
            grid_budget_total_kwh: 25.0,
            grid_budget_used_kwh: 5.0,
            max_grid_import_w: 7000.0,
            solar_trend: "rising".to_string(),
            session_elapsed_mins: 45,
            session_kwh_added: 3.2,
            session_solar_pct: 82.0,
            hours_until_sunset: 5.5,
            current_time: "13:00".to_string(),
            irradiance_curve: "13:00: 820W/m² (cloud: 15%)\n\
                               14:00: 750W/m² (cloud: 20%)\n\
                               15:00: 580W/m² (cloud: 25%)\n\
                               16:00: 350W/m² (cloud: 30%)\n\
                               17:00: 120W/m² (cloud: 40%)"
                .to_string(),
            minutes_to_full_charge: 0,
            has_home_battery: true,
            has_net_metering: false,
            panel_capacity_w: 0,
        }
    }
}

/// Dry-run pipeline output for the debug endpoint
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub prompt: String,
    pub raw_response: Option<String>,
    pub recommendation: Option<AiRecommendation>,
    pub parse_error: Option<String>,
    pub simulated_command: String,
    pub message: String,
}

pub struct ChargeController {
    config: Config,
    settings: Settings,
    ai_settings: AiSettings,
    credentials: Credentials,

    inverter: Option<Box<dyn InverterApi>>,
    vehicle: Option<Box<dyn VehicleApi>>,
    forecast_api: Box<dyn ForecastApi>,

    advisor: Advisor,
    budget: GridBudgetLedger,
    accountant: SessionAccountant,
    persistence: PersistenceManager,

    manual_override_amps: Option<u32>,
    last_dispatched_amps: Option<u32>,
    last_dispatch_at: Option<DateTime<Utc>>,
    last_cycle_at: Option<DateTime<Utc>>,
    last_health_check_at: Option<DateTime<Utc>>,

    snapshot: TelemetrySnapshot,
    forecast: Option<Forecast>,
    forecast_fetched_at: Option<DateTime<Utc>>,
    location: Option<LocationFix>,
    mode: Mode,
    last_decision: Option<Decision>,
    last_ai_error_kind: Option<String>,

    outlook_text: Option<String>,
    outlook_fetched_at: Option<DateTime<Utc>>,
    outlook_ok: bool,

    ai_results_tx: mpsc::UnboundedSender<Result<AiRecommendation>>,
    logger: StructuredLogger,
}

impl ChargeController {
    /// Build the controller from config, loading persisted state and
    /// constructing clients for every service with credentials.
    pub fn new(
        config: Config,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Result<AiRecommendation>>)> {
        let mut persistence = PersistenceManager::new(&config.state_file);
        persistence.load();

        let settings = persistence.state.settings.clone();
        let ai_settings = persistence.state.ai_settings.clone();
        let credentials = persistence.state.credentials.clone();
        let manual_override_amps = persistence.state.manual_override_amps;

        let budget = persistence
            .state
            .budget
            .clone()
            .unwrap_or_else(|| {
                GridBudgetLedger::new(settings.daily_grid_budget_kwh, Utc::now(), settings.tz())
            });

        let mut accountant = SessionAccountant::new();
        accountant.restore(persistence.state.active_session.clone());

        let advisor = Advisor::new(config.ollama_host.clone())?;
        let (ai_results_tx, ai_results_rx) = mpsc::unbounded_channel();

        let mut controller = Self {
            settings,
            ai_settings,
            credentials,
            inverter: None,
            vehicle: None,
            forecast_api: Box::new(OpenMeteoClient::new()?),
            advisor,
            budget,
            accountant,
            persistence,
            manual_override_amps,
            last_dispatched_amps: None,
            last_dispatch_at: None,
            last_cycle_at: None,
            last_health_check_at: None,
            snapshot: TelemetrySnapshot::new(None, None, None),
            forecast: None,
            forecast_fetched_at: None,
            location: None,
            mode: Mode::SolarOptimizing,
            last_decision: None,
            last_ai_error_kind: None,
            outlook_text: None,
            outlook_fetched_at: None,
            outlook_ok: false,
            ai_results_tx,
            logger: get_logger("controller"),
            config,
        };
        controller.rebuild_clients()?;
        Ok((controller, ai_results_rx))
    }

    pub fn poll_interval_secs(&self) -> u64 {
        self.config.poll_interval_secs.max(5)
    }

    /// (Re)build service clients from the current credentials
    fn rebuild_clients(&mut self) -> Result<()> {
        self.inverter = if !self.credentials.solax_token_id.is_empty()
            && !self.credentials.solax_dongle_sn.is_empty()
        {
            Some(Box::new(SolaxClient::new(
                self.credentials.solax_token_id.clone(),
                self.credentials.solax_dongle_sn.clone(),
            )?))
        } else {
            None
        };
        self.vehicle = if !self.credentials.tessie_api_key.is_empty()
            && !self.credentials.tessie_vin.is_empty()
        {
            Some(Box::new(TessieClient::new(
                self.credentials.tessie_api_key.clone(),
                self.credentials.tessie_vin.clone(),
            )?))
        } else {
            None
        };
        Ok(())
    }

    /// One full control cycle. Collaborator failures degrade the cycle and
    /// are logged; they never escape this function.
    pub async fn poll_cycle(&mut self, now: DateTime<Utc>) -> Result<()> {
        let tz = self.settings.tz();

        // 1. Telemetry
        let inverter_reading = match &self.inverter {
            Some(client) => match client.fetch().await {
                Ok(reading) => Some(reading),
                Err(e) => {
                    self.logger.warn(&format!("Inverter fetch failed: {}", e));
                    None
                }
            },
            None => None,
        };
        let mut vehicle_fresh = true;
        let vehicle_state = match &self.vehicle {
            Some(client) => match client.fetch_state().await {
                Ok(state) => Some(state),
                Err(e) => {
                    self.logger.warn(&format!(
                        "Vehicle fetch failed, reusing last known state: {}",
                        e
                    ));
                    vehicle_fresh = false;
                    self.snapshot.vehicle.clone()
                }
            },
            None => None,
        };
        self.refresh_forecast_if_stale(now).await;
        self.snapshot = TelemetrySnapshot {
            inverter: inverter_reading.clone(),
            vehicle: vehicle_state.clone(),
            forecast: self.forecast.clone(),
            fetched_at: now,
        };

        // Auto-learn home coordinates from the vehicle's own "home" tag
        if let Some(ref vehicle) = vehicle_state {
            self.maybe_learn_home(vehicle);
        }

        self.location = vehicle_state
            .as_ref()
            .map(|v| location::classify(v, &self.settings));

        // 2. Budget
        if self.budget.reset_if_new_day(now, tz) {
            self.logger.info("Grid budget reset for the new local day");
            self.advisor.reset_latches();
        }
        self.budget.set_total(self.settings.daily_grid_budget_kwh);
        let elapsed_h = self
            .last_cycle_at
            .map(|t| ((now - t).num_seconds().max(0) as f64) / 3600.0)
            .unwrap_or(0.0);
        // Whole-house import counts against the budget every cycle, charging
        // or not. Export never offsets it.
        if let Some(ref inv) = inverter_reading {
            self.budget
                .accumulate(inv.grid_import_w.max(0.0) * elapsed_h / 1000.0);
        }

        // 3. Mode
        let within_daylight = self.within_daylight(now);
        self.mode = derive_mode(&ModeInputs {
            manual_override_active: self.manual_override_amps.is_some(),
            tessie_enabled: self.settings.tessie_enabled,
            location: self
                .location
                .map(|l| l.location)
                .unwrap_or(ChargerLocation::LocationUnknown),
            within_daylight,
            strategy: self.settings.charging_strategy,
            budget_exhausted: self.budget.exhausted(),
            max_grid_import_w: self.settings.max_grid_import_w,
            ai_enabled: self.settings.ai_enabled,
            ai_healthy: self.advisor.healthy(),
        });

        // 4. AI cadence
        if let Some(ref inv) = inverter_reading {
            self.advisor.observe_solar(inv.solar_w);
        }
        self.maybe_check_ai_health(now).await;
        if self.settings.ai_enabled && self.mode == Mode::AiOptimizing {
            let signals = TriggerSignals {
                vehicle_soc: vehicle_state.as_ref().map(|v| v.soc).unwrap_or(0),
                budget_used_pct: self.budget.used_pct(),
                minutes_to_departure: self.minutes_to_departure(now),
            };
            if let Some(trigger) = self.advisor.due_trigger(now, &self.ai_settings, &signals) {
                self.launch_ai_call(now, &trigger);
            }
        }

        // 5. Decision
        let decision = self.decide(now, &inverter_reading, &vehicle_state);

        // 6. Dispatch
        self.dispatch(now, &decision, &vehicle_state).await;
        self.last_decision = Some(decision);

        // 7. Session accounting. Skipped on a failed vehicle fetch so one
        // transient cloud error cannot close an open session.
        if vehicle_fresh {
            let at_home = matches!(
                self.location.map(|l| l.location),
                Some(ChargerLocation::ChargingAtHome)
            );
            let vehicle_for_session = vehicle_state.unwrap_or_default();
            let event = self.accountant.tick(
                now,
                at_home,
                &vehicle_for_session,
                inverter_reading.as_ref(),
                self.settings.electricity_rate,
            );
            self.apply_session_event(event);
        }

        self.last_cycle_at = Some(now);
        Ok(())
    }

    fn apply_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::None => {}
            SessionEvent::Started => {
                self.logger.info("Charging session started");
                self.persist_mutations();
            }
            SessionEvent::Updated => {
                self.persist_mutations();
            }
            SessionEvent::Ended(record) => {
                self.logger.info(&format!(
                    "Charging session ended: {:.2} kWh added, {:.0}% solar",
                    record.kwh_added, record.solar_pct
                ));
                self.advisor.reset_latches();
                self.persistence.push_session(*record);
                self.persist_mutations();
            }
            SessionEvent::Discarded => {
                self.logger.debug("Near-zero session discarded");
                self.persist_mutations();
            }
        }
    }

    /// Launch the model chain without blocking the cycle; the result comes
    /// back through the channel and is applied between cycles. A manual
    /// override set while the call is in flight wins automatically, because
    /// the stored recommendation is only consulted in `AI Optimizing` mode.
    fn launch_ai_call(&mut self, now: DateTime<Utc>, trigger: &str) {
        let prompt = self.build_live_prompt(now, trigger);
        let client = self.advisor.client();
        let ai = self.ai_settings.clone();
        let trigger = trigger.to_string();
        let tx = self.ai_results_tx.clone();
        self.advisor.mark_call_started(now);
        self.logger
            .debug(&format!("Launching model call (trigger={})", trigger));
        tokio::spawn(async move {
            let result = advisor::run_model_chain(&client, &prompt, &trigger, &ai).await;
            let _ = tx.send(result);
        });
    }

    /// Record a finished model-chain call
    pub fn apply_ai_result(&mut self, result: Result<AiRecommendation>) {
        if let Err(ref e) = result {
            self.last_ai_error_kind = Some(e.kind().to_string());
        } else {
            self.last_ai_error_kind = None;
        }
        self.advisor.record_result(&result);
    }

    fn decide(
        &self,
        now: DateTime<Utc>,
        inverter: &Option<InverterReading>,
        vehicle: &Option<VehicleState>,
    ) -> Decision {
        let solar_w = if self.advisor.solar_avg() > 0.0 {
            self.advisor.solar_avg()
        } else {
            inverter.as_ref().map(|i| i.solar_w).unwrap_or(0.0)
        };
        let inputs = DecisionInputs {
            mode: &self.mode,
            settings: &self.settings,
            ai: self.advisor.last_recommendation(),
            ai_fresh: self
                .advisor
                .last_recommendation()
                .map(|r| r.is_fresh(now, self.ai_settings.ai_stale_threshold_secs))
                .unwrap_or(false),
            solar_w,
            household_w: inverter
                .as_ref()
                .map(|i| i.household_demand_w)
                .unwrap_or(0.0),
            grid_import_w: inverter
                .as_ref()
                .map(|i| i.grid_import_w - i.grid_export_w)
                .unwrap_or(0.0),
            vehicle_soc: vehicle.as_ref().map(|v| v.soc).unwrap_or(0),
            current_amps: vehicle.as_ref().map(|v| v.charging_amps).unwrap_or(0),
            manual_override_amps: self.manual_override_amps.unwrap_or(0),
            minutes_to_departure: self.minutes_to_departure(now),
            min_amps: self.ai_settings.ai_min_amps,
            max_amps: self.ai_settings.ai_max_amps,
        };
        engine::decide(&inputs)
    }

    /// Issue the decided command, throttled so the rate-limited vehicle API
    /// is not hammered: a changed amperage goes out immediately, an
    /// unchanged one only after the keep-alive interval.
    async fn dispatch(
        &mut self,
        now: DateTime<Utc>,
        decision: &Decision,
        vehicle_state: &Option<VehicleState>,
    ) {
        if !self.settings.tessie_enabled {
            return;
        }
        let Some(vehicle) = &self.vehicle else {
            return;
        };
        let target = match decision.command {
            AmpCommand::Hold => return,
            AmpCommand::Stop => 0,
            AmpCommand::Set(a) => a,
        };

        let changed = self.last_dispatched_amps != Some(target);
        let interval_elapsed = self
            .last_dispatch_at
            .map(|t| (now - t).num_seconds() >= MIN_DISPATCH_INTERVAL_SECS)
            .unwrap_or(true);
        if !changed && !interval_elapsed {
            return;
        }

        let currently_charging = vehicle_state
            .as_ref()
            .map(|v| v.charging_state.is_charging())
            .unwrap_or(false);

        let outcome = if target == 0 {
            if !currently_charging {
                // Nothing to stop; do not burn an API call
                self.last_dispatched_amps = Some(0);
                return;
            }
            vehicle.stop_charging().await
        } else {
            match vehicle.set_charging_amps(target).await {
                Ok(()) if !currently_charging => vehicle.start_charging().await,
                other => other,
            }
        };

        match outcome {
            Ok(()) => {
                self.logger.info(&format!(
                    "Dispatched {}A: {}",
                    target, decision.reason
                ));
                self.last_dispatched_amps = Some(target);
                self.last_dispatch_at = Some(now);
            }
            Err(e) => {
                self.logger
                    .warn(&format!("Vehicle command failed ({}A): {}", target, e));
            }
        }
    }

    async fn refresh_forecast_if_stale(&mut self, now: DateTime<Utc>) {
        let stale = self
            .forecast_fetched_at
            .map(|t| (now - t).num_seconds() >= FORECAST_TTL_SECS)
            .unwrap_or(true);
        if !stale {
            return;
        }
        let (Some(lat), Some(lon)) = (self.settings.home_lat, self.settings.home_lon) else {
            return;
        };
        match self
            .forecast_api
            .fetch(lat, lon, &self.settings.timezone)
            .await
        {
            Ok(forecast) => {
                self.forecast = Some(forecast);
                self.forecast_fetched_at = Some(now);
            }
            Err(e) => {
                self.logger.warn(&format!("Forecast fetch failed: {}", e));
                // Back off a bit instead of retrying every cycle
                self.forecast_fetched_at =
                    Some(now - chrono::Duration::seconds(FORECAST_TTL_SECS - 300));
            }
        }
    }

    /// Model-host reachability is tracked even while AI mode is disabled,
    /// so toggling it on reflects the real host state immediately.
    async fn maybe_check_ai_health(&mut self, now: DateTime<Utc>) {
        let due = self
            .last_health_check_at
            .map(|t| (now - t).num_seconds() >= HEALTH_CHECK_INTERVAL_SECS)
            .unwrap_or(true);
        if due {
            self.advisor.check_health().await;
            self.last_health_check_at = Some(now);
        }
    }

    /// Adopt the vehicle's GPS position as home when the vehicle service
    /// tags the current location "home" and no home is configured yet.
    fn maybe_learn_home(&mut self, vehicle: &VehicleState) {
        if self.settings.home_lat.is_some() && self.settings.home_lon.is_some() {
            return;
        }
        let at_named_home = vehicle.saved_location.as_deref() == Some("home");
        let has_gps = vehicle.latitude != 0.0 || vehicle.longitude != 0.0;
        if at_named_home && has_gps {
            self.logger.info(&format!(
                "Learned home coordinates from vehicle: ({:.5}, {:.5})",
                vehicle.latitude, vehicle.longitude
            ));
            self.settings.home_lat = Some(vehicle.latitude);
            self.settings.home_lon = Some(vehicle.longitude);
            self.persist_mutations();
        }
    }

    /// Whether local time is inside the daylight window: the forecast's
    /// sunrise-to-sunset when available, 06:00-18:00 otherwise.
    fn within_daylight(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.settings.tz()).time();
        let (start, end) = self
            .forecast
            .as_ref()
            .and_then(|f| {
                let sunrise = NaiveTime::parse_from_str(&f.sunrise, "%H:%M").ok()?;
                let sunset = NaiveTime::parse_from_str(&f.sunset, "%H:%M").ok()?;
                Some((sunrise, sunset))
            })
            .unwrap_or((
                NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            ));
        local >= start && local <= end
    }

    fn local_hhmm(&self, now: DateTime<Utc>) -> String {
        let local = now.with_timezone(&self.settings.tz());
        format!("{:02}:{:02}", local.hour(), local.minute())
    }

    fn minutes_to_departure(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.settings.charging_strategy != ChargingStrategy::Departure
            || self.settings.departure_time.is_empty()
        {
            return None;
        }
        crate::advisor::prompt::minutes_until(
            &self.local_hhmm(now),
            &self.settings.departure_time,
        )
    }

    /// Build the advisory prompt from live state
    pub fn build_live_prompt(&self, now: DateTime<Utc>, trigger: &str) -> String {
        let inv = self.snapshot.inverter.clone().unwrap_or_default();
        let vehicle = self.snapshot.vehicle.clone().unwrap_or_default();
        let now_hhmm = self.local_hhmm(now);
        let (hours_sunset, curve) = match &self.forecast {
            Some(f) => (
                weather::hours_until_sunset(f, self.settings.tz()),
                weather::irradiance_curve(f, &now_hhmm),
            ),
            None => (0.0, "No forecast available.".to_string()),
        };
        let (elapsed, added, solar_pct) = self
            .accountant
            .active()
            .map(|s| (s.elapsed_mins(now), s.kwh_added, s.solar_pct()))
            .unwrap_or((0, 0.0, 0.0));

        let ctx = PromptContext {
            solar_w: if self.advisor.solar_avg() > 0.0 {
                self.advisor.solar_avg()
            } else {
                inv.solar_w
            },
            solar_trend: self.advisor.solar_trend().to_string(),
            household_w: inv.household_demand_w,
            grid_import_w: inv.grid_import_w - inv.grid_export_w,
            battery_soc: inv.battery_soc,
            battery_w: inv.battery_w,
            vehicle_soc: vehicle.soc,
            target_soc: self.settings.target_soc,
            current_amps: vehicle.charging_amps,
            grid_budget_remaining_kwh: self.budget.remaining_kwh(),
            grid_budget_total_kwh: self.budget.total_kwh(),
            max_grid_import_w: self.settings.max_grid_import_w,
            hours_until_sunset: hours_sunset,
            irradiance_curve: curve,
            trigger_reason: trigger.to_string(),
            charging_strategy: self.settings.charging_strategy,
            departure_time: self.settings.departure_time.clone(),
            session_elapsed_mins: elapsed,
            session_kwh_added: added,
            session_solar_pct: solar_pct,
            current_time: now_hhmm,
            minutes_to_full_charge: vehicle.minutes_to_full_charge,
            has_home_battery: self.settings.has_home_battery,
            has_net_metering: self.settings.has_net_metering,
            panel_capacity_w: self.settings.panel_capacity_w,
            circuit_voltage: self.settings.circuit_voltage,
            min_amps: self.ai_settings.ai_min_amps,
            max_amps: self.ai_settings.ai_max_amps,
        };
        advisor::build_prompt(&ctx)
    }

    /// Prompt for a synthetic scenario. Reads only the tuning bounds and
    /// circuit voltage, never live telemetry, so the debug endpoints work
    /// identically whether or not the loop has data.
    pub fn scenario_prompt(&self, scenario: &DryRunScenario) -> String {
        let ctx = PromptContext {
            solar_w: scenario.solar_w,
            solar_trend: scenario.solar_trend.clone(),
            household_w: scenario.household_w,
            grid_import_w: scenario.grid_import_w,
            battery_soc: scenario.battery_soc,
            battery_w: scenario.battery_w,
            vehicle_soc: scenario.vehicle_soc,
            target_soc: scenario.target_soc,
            current_amps: scenario.current_amps,
            grid_budget_remaining_kwh: (scenario.grid_budget_total_kwh
                - scenario.grid_budget_used_kwh)
                .max(0.0),
            grid_budget_total_kwh: scenario.grid_budget_total_kwh,
            max_grid_import_w: scenario.max_grid_import_w,
            hours_until_sunset: scenario.hours_until_sunset,
            irradiance_curve: scenario.irradiance_curve.clone(),
            trigger_reason: "manual_test".to_string(),
            charging_strategy: scenario.charging_strategy,
            departure_time: scenario.departure_time.clone(),
            session_elapsed_mins: scenario.session_elapsed_mins,
            session_kwh_added: scenario.session_kwh_added,
            session_solar_pct: scenario.session_solar_pct,
            current_time: scenario.current_time.clone(),
            minutes_to_full_charge: scenario.minutes_to_full_charge,
            has_home_battery: scenario.has_home_battery,
            has_net_metering: scenario.has_net_metering,
            panel_capacity_w: scenario.panel_capacity_w,
            circuit_voltage: self.settings.circuit_voltage,
            min_amps: self.ai_settings.ai_min_amps,
            max_amps: self.ai_settings.ai_max_amps,
        };
        advisor::build_prompt(&ctx)
    }

    /// Scenario prompt plus the client and tuning needed to run the model
    /// call without holding the controller lock.
    pub fn scenario_context(
        &self,
        scenario: &DryRunScenario,
    ) -> (String, OllamaClient, AiSettings) {
        (
            self.scenario_prompt(scenario),
            self.advisor.client(),
            self.ai_settings.clone(),
        )
    }

    /// Cached outlook text, if still within its TTL. Successful generations
    /// are kept for an hour; failures retry sooner.
    pub fn cached_outlook(&self, now: DateTime<Utc>) -> Option<String> {
        let ttl = if self.outlook_ok {
            OUTLOOK_TTL_SECS
        } else {
            OUTLOOK_RETRY_TTL_SECS
        };
        let fresh = self
            .outlook_fetched_at
            .map(|t| (now - t).num_seconds() < ttl)
            .unwrap_or(false);
        if fresh {
            self.outlook_text.clone()
        } else {
            None
        }
    }

    /// Prompt and client for regenerating the outlook off-lock
    pub fn outlook_context(&self) -> (String, OllamaClient, AiSettings) {
        let summary = match &self.forecast {
            Some(f) => format!(
                "Sunrise {}, sunset {}, peak window {}-{}.\n{}",
                f.sunrise,
                f.sunset,
                f.peak_start,
                f.peak_end,
                weather::irradiance_curve(f, "00:00")
            ),
            None => "No forecast available.".to_string(),
        };
        let soc = self.snapshot.vehicle.as_ref().map(|v| v.soc).unwrap_or(0);
        let prompt = advisor::build_outlook_prompt(
            &summary,
            soc,
            self.settings.target_soc,
            self.budget.remaining_kwh(),
        );
        (prompt, self.advisor.client(), self.ai_settings.clone())
    }

    /// Record an outlook regeneration and return the text to serve. A failed
    /// generation keeps serving the previous text when one exists.
    pub fn store_outlook(&mut self, now: DateTime<Utc>, result: Result<String>) -> String {
        self.outlook_fetched_at = Some(now);
        match result {
            Ok(text) => {
                self.outlook_text = Some(text.clone());
                self.outlook_ok = true;
                text
            }
            Err(e) => {
                self.logger.warn(&format!("Outlook generation failed: {}", e));
                self.outlook_ok = false;
                self.outlook_text
                    .clone()
                    .unwrap_or_else(|| "Outlook unavailable right now.".to_string())
            }
        }
    }

    /// Current AI status label for the UI
    fn ai_status(&self, now: DateTime<Utc>) -> AiStatus {
        if !self.settings.ai_enabled {
            return AiStatus::Standby;
        }
        match self.mode {
            Mode::SuspendedNight => return AiStatus::SuspendedNight,
            Mode::SuspendedChargingAway | Mode::SuspendedLocationUnknown => {
                return AiStatus::SuspendedAway
            }
            _ => {}
        }
        if !self.advisor.healthy() {
            return AiStatus::Offline;
        }
        if self.advisor.consecutive_failures() > 0 {
            // Parse failures degrade to the rule-based path; transport
            // failures carry their kind so a sick host is diagnosable.
            return match self.last_ai_error_kind.as_deref() {
                Some("parse") | None => AiStatus::Fallback,
                Some(kind) => AiStatus::Error(kind.to_string()),
            };
        }
        match self.advisor.last_recommendation() {
            Some(rec) if rec.is_fresh(now, self.ai_settings.ai_stale_threshold_secs) => {
                if rec.amps == 0
                    && self
                        .snapshot
                        .inverter
                        .as_ref()
                        .map(|i| {
                            i.surplus_w()
                                < self.ai_settings.ai_min_amps as f64
                                    * self.settings.circuit_voltage
                        })
                        .unwrap_or(false)
                {
                    AiStatus::SuspendedNoSolar
                } else {
                    AiStatus::Active
                }
            }
            _ => AiStatus::Fallback,
        }
    }

    /// Consistent status snapshot for the web layer
    pub fn status(&self) -> StatusResponse {
        let now = Utc::now();
        let rec = self.advisor.last_recommendation().cloned();
        let stale = rec
            .as_ref()
            .map(|r| !r.is_fresh(now, self.ai_settings.ai_stale_threshold_secs))
            .unwrap_or(false);
        StatusResponse {
            mode: self.mode.clone(),
            location: self.location,
            inverter: self.snapshot.inverter.clone(),
            vehicle: self.snapshot.vehicle.clone(),
            data_age_secs: self.snapshot.age_secs(),
            solar_avg_w: self.advisor.solar_avg(),
            solar_trend: self.advisor.solar_trend().to_string(),
            ai: AiStatusView {
                enabled: self.settings.ai_enabled,
                status: self.ai_status(now).as_string(),
                healthy: self.advisor.healthy(),
                recommendation: rec,
                stale,
            },
            session: self.accountant.active().map(|s| SessionView {
                id: s.id.clone(),
                started_at: s.started_at,
                elapsed_mins: s.elapsed_mins(now),
                start_soc: s.start_soc,
                current_soc: s.current_soc,
                kwh_added: s.kwh_added,
                solar_kwh: s.solar_kwh,
                grid_kwh: s.grid_kwh,
                solar_pct: s.solar_pct(),
                saved: s.saved,
            }),
            budget: BudgetView {
                total_kwh: self.budget.total_kwh(),
                used_kwh: self.budget.used_kwh(),
                remaining_kwh: self.budget.remaining_kwh(),
                used_pct: self.budget.used_pct(),
                exhausted: self.budget.exhausted(),
            },
            forecast: self.forecast.clone(),
            manual_override_amps: self.manual_override_amps,
            last_command: self.last_decision.as_ref().map(|d| CommandView {
                action: match d.command {
                    AmpCommand::Hold => "hold".to_string(),
                    AmpCommand::Stop => "stop".to_string(),
                    AmpCommand::Set(_) => "set_amps".to_string(),
                },
                amps: match d.command {
                    AmpCommand::Set(a) => Some(a),
                    AmpCommand::Stop => Some(0),
                    AmpCommand::Hold => None,
                },
                reason: d.reason.clone(),
            }),
            tessie_enabled: self.settings.tessie_enabled,
            timestamp: now,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn update_settings(&mut self, update: &SettingsUpdate) -> Settings {
        self.settings.apply_update(update);
        self.budget.set_total(self.settings.daily_grid_budget_kwh);
        self.persist_mutations();
        self.settings.clone()
    }

    pub fn ai_settings(&self) -> &AiSettings {
        &self.ai_settings
    }

    pub fn update_ai_settings(&mut self, update: &AiSettingsUpdate) -> AiSettings {
        self.ai_settings.apply_update(update);
        self.persist_mutations();
        self.ai_settings.clone()
    }

    /// Latch a manual override. The latch wins over everything, including
    /// AI recommendations that complete after this call.
    pub fn set_manual_override(&mut self, amps: u32) {
        self.logger.info(&format!("Manual override set: {}A", amps));
        self.manual_override_amps = Some(amps.min(32));
        self.persist_mutations();
    }

    pub fn clear_manual_override(&mut self) {
        self.logger.info("Manual override cleared");
        self.manual_override_amps = None;
        self.persist_mutations();
    }

    pub fn set_ai_enabled(&mut self, enabled: bool) {
        self.settings.ai_enabled = enabled;
        self.persist_mutations();
    }

    pub fn request_ai_refresh(&mut self) {
        self.advisor.request_refresh();
    }

    pub fn credentials_masked(&self) -> Credentials {
        self.credentials.masked()
    }

    pub fn update_credentials(&mut self, update: &Credentials) -> Result<()> {
        self.credentials.merge(update);
        self.rebuild_clients()?;
        self.persist_mutations();
        Ok(())
    }

    /// Probe every external service
    pub async fn test_credentials(&mut self) -> HealthReport {
        let solax = match &self.inverter {
            Some(client) => client.test_connection().await,
            None => ProbeResult::failed("Inverter credentials not configured"),
        };
        let tessie = match &self.vehicle {
            Some(client) => client.test_connection().await,
            None => ProbeResult::failed("Vehicle credentials not configured"),
        };
        let weather = self.forecast_api.test_connection().await;
        let telegram = if self.credentials.telegram_bot_token.is_empty() {
            ProbeResult::failed("Notification bot token not configured")
        } else {
            match TelegramClient::new(self.credentials.telegram_bot_token.clone()) {
                Ok(client) => client.test_connection().await,
                Err(e) => ProbeResult::failed(e.to_string()),
            }
        };
        let (ok, detail) = self.advisor.check_health().await;
        HealthReport {
            solax,
            tessie,
            weather,
            ollama: if ok {
                ProbeResult::ok(detail)
            } else {
                ProbeResult::failed(detail)
            },
            telegram,
        }
    }

    pub fn sessions_page(&self, limit: usize, offset: usize) -> Vec<SessionRecord> {
        self.persistence.sessions_page(limit, offset)
    }

    pub fn session_by_id(&self, id: &str) -> Option<SessionRecord> {
        self.persistence.session_by_id(id).cloned()
    }

    /// Write everything persistence tracks back to the state file
    fn persist_mutations(&mut self) {
        self.persistence.state.settings = self.settings.clone();
        self.persistence.state.ai_settings = self.ai_settings.clone();
        self.persistence.state.credentials = self.credentials.clone();
        self.persistence.state.budget = Some(self.budget.clone());
        self.persistence.state.active_session = self.accountant.active().cloned();
        self.persistence.state.manual_override_amps = self.manual_override_amps;
        if let Err(e) = self.persistence.save() {
            self.logger.warn(&format!("State save failed: {}", e));
        }
    }

    fn handle_command(&mut self, cmd: ControllerCommand) {
        match cmd {
            ControllerCommand::OverrideAmps(amps) => self.set_manual_override(amps),
            ControllerCommand::ClearOverride => self.clear_manual_override(),
            ControllerCommand::SetAiEnabled(enabled) => self.set_ai_enabled(enabled),
            ControllerCommand::UpdateSettings(update) => {
                self.update_settings(&update);
            }
            ControllerCommand::UpdateAiSettings(update) => {
                self.update_ai_settings(&update);
            }
            // Handled by the loop itself
            ControllerCommand::RefreshNow | ControllerCommand::Shutdown => {}
        }
    }
}

/// Control loop: periodic cycles, command handling, and AI results, with
/// the controller locked only for the duration of each step so web readers
/// interleave freely.
pub async fn run(
    controller: Arc<Mutex<ChargeController>>,
    mut commands_rx: mpsc::UnboundedReceiver<ControllerCommand>,
    mut ai_results_rx: mpsc::UnboundedReceiver<Result<AiRecommendation>>,
) {
    let logger = get_logger("controller");
    let interval_secs = controller.lock().await.poll_interval_secs();
    let mut ticker = interval(Duration::from_secs(interval_secs));
    logger.info(&format!(
        "Control loop started, {}s cycle interval",
        interval_secs
    ));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut c = controller.lock().await;
                if let Err(e) = c.poll_cycle(Utc::now()).await {
                    logger.error(&format!("Poll cycle failed: {}", e));
                }
            }
            Some(result) = ai_results_rx.recv() => {
                controller.lock().await.apply_ai_result(result);
            }
            cmd = commands_rx.recv() => {
                match cmd {
                    None | Some(ControllerCommand::Shutdown) => {
                        logger.info("Control loop shutting down");
                        break;
                    }
                    Some(ControllerCommand::RefreshNow) => {
                        // Skip the pending wait and run a cycle immediately
                        let mut c = controller.lock().await;
                        c.request_ai_refresh();
                        if let Err(e) = c.poll_cycle(Utc::now()).await {
                            logger.error(&format!("Poll cycle failed: {}", e));
                        }
                    }
                    Some(other) => {
                        controller.lock().await.handle_command(other);
                    }
                }
            }
        }
    }
}

/// Full model pipeline against captured live inputs with no side effects
/// on loop state: prompt, raw output, parse result, simulated command.
pub async fn dry_run(prompt: String, client: OllamaClient, ai: AiSettings) -> DryRunReport {
    let raw = client
        .generate(
            &ai.ai_model,
            &prompt,
            ai.ai_temperature,
            ai.ai_max_tokens,
            true,
            1,
        )
        .await;
    match raw {
        Ok(raw_text) => match advisor::parse_recommendation(&raw_text, &ai, "debug_test") {
            Ok(rec) => DryRunReport {
                prompt,
                raw_response: Some(raw_text),
                simulated_command: if rec.amps == 0 {
                    "stop_charging".to_string()
                } else {
                    format!("set_charging_amps({})", rec.amps)
                },
                message: rec.reasoning.clone(),
                recommendation: Some(rec),
                parse_error: None,
            },
            Err(e) => DryRunReport {
                prompt,
                raw_response: Some(raw_text),
                recommendation: None,
                parse_error: Some(e.to_string()),
                simulated_command: "none (rule-based fallback)".to_string(),
                message: "Model output failed validation".to_string(),
            },
        },
        Err(e) => DryRunReport {
            prompt,
            raw_response: None,
            recommendation: None,
            parse_error: Some(e.to_string()),
            simulated_command: "none (rule-based fallback)".to_string(),
            message: "Model call failed".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ChargingState;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FixedInverter(InverterReading);

    #[async_trait::async_trait]
    impl InverterApi for FixedInverter {
        async fn fetch(&self) -> Result<InverterReading> {
            Ok(self.0.clone())
        }

        async fn test_connection(&self) -> ProbeResult {
            ProbeResult::ok("fixed")
        }
    }

    /// Vehicle client whose fetches fail while the flag is set
    struct FlakyVehicle {
        state: VehicleState,
        fail: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl VehicleApi for FlakyVehicle {
        async fn fetch_state(&self) -> Result<VehicleState> {
            if self.fail.load(Ordering::SeqCst) {
                Err(crate::error::SunwardError::network(
                    "vehicle cloud unreachable",
                ))
            } else {
                Ok(self.state.clone())
            }
        }

        async fn set_charging_amps(&self, _amps: u32) -> Result<()> {
            Ok(())
        }

        async fn start_charging(&self) -> Result<()> {
            Ok(())
        }

        async fn stop_charging(&self) -> Result<()> {
            Ok(())
        }

        async fn test_connection(&self) -> ProbeResult {
            ProbeResult::ok("fixed")
        }
    }

    /// Mid-morning instant in the default settings timezone, away from the
    /// midnight reset boundary
    fn morning(minute_offset: i64) -> DateTime<Utc> {
        chrono_tz::Asia::Manila
            .with_ymd_and_hms(2026, 6, 1, 10, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
            + chrono::Duration::minutes(minute_offset)
    }

    fn controller() -> ChargeController {
        let config = Config {
            state_file: tempfile::NamedTempFile::new()
                .unwrap()
                .into_temp_path()
                .keep()
                .unwrap()
                .to_str()
                .unwrap()
                .to_string(),
            ..Default::default()
        };
        ChargeController::new(config).unwrap().0
    }

    #[tokio::test]
    async fn test_cycle_without_clients_degrades() {
        let mut c = controller();
        // No credentials configured: cycle still completes
        c.poll_cycle(Utc::now()).await.unwrap();
        let status = c.status();
        assert!(status.inverter.is_none());
        assert!(status.vehicle.is_none());
        // No vehicle data classifies as unknown, which suspends
        assert_eq!(status.mode, Mode::SuspendedLocationUnknown);
    }

    #[tokio::test]
    async fn test_manual_override_latch_beats_late_ai_result() {
        let mut c = controller();
        c.set_manual_override(10);
        c.poll_cycle(Utc::now()).await.unwrap();
        assert_eq!(c.status().mode, Mode::ManualOverride);

        // A recommendation arriving after the override is stored but the
        // decision still echoes the override.
        let rec = AiRecommendation {
            amps: 32,
            reasoning: "late".to_string(),
            confidence: crate::advisor::Confidence::High,
            trigger: "scheduled".to_string(),
            generated_at: Utc::now(),
        };
        c.apply_ai_result(Ok(rec));
        c.poll_cycle(Utc::now()).await.unwrap();
        let status = c.status();
        assert_eq!(status.mode, Mode::ManualOverride);
        let cmd = status.last_command.unwrap();
        assert_eq!(cmd.amps, Some(10));
    }

    #[tokio::test]
    async fn test_budget_accumulates_household_import_while_idle() {
        let mut c = controller();
        c.inverter = Some(Box::new(FixedInverter(InverterReading {
            grid_import_w: 2000.0,
            ..Default::default()
        })));
        // No vehicle at all: household draw alone must count
        c.poll_cycle(morning(0)).await.unwrap();
        assert_eq!(c.status().budget.used_kwh, 0.0);
        c.poll_cycle(morning(60)).await.unwrap();
        assert!((c.status().budget.used_kwh - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_export_does_not_offset_budget_import() {
        let mut c = controller();
        c.inverter = Some(Box::new(FixedInverter(InverterReading {
            grid_import_w: 1000.0,
            grid_export_w: 3000.0,
            ..Default::default()
        })));
        c.poll_cycle(morning(0)).await.unwrap();
        c.poll_cycle(morning(60)).await.unwrap();
        // Import counts in full; the simultaneous export is ignored
        assert!((c.status().budget.used_kwh - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_vehicle_fetch_failure_keeps_session_open() {
        let mut c = controller();
        c.settings.home_lat = Some(14.5995);
        c.settings.home_lon = Some(120.9842);
        let fail = Arc::new(AtomicBool::new(false));
        c.vehicle = Some(Box::new(FlakyVehicle {
            state: VehicleState {
                charge_port_connected: true,
                charging_state: ChargingState::Charging,
                soc: 50,
                charging_amps: 16,
                charging_kw: 3.68,
                latitude: 14.5995,
                longitude: 120.9842,
                ..Default::default()
            },
            fail: fail.clone(),
        }));

        c.poll_cycle(morning(0)).await.unwrap();
        assert!(c.status().session.is_some());

        // One failed poll must not close the session
        fail.store(true, Ordering::SeqCst);
        c.poll_cycle(morning(1)).await.unwrap();
        assert!(c.status().session.is_some());

        fail.store(false, Ordering::SeqCst);
        c.poll_cycle(morning(2)).await.unwrap();
        assert!(c.status().session.is_some());
    }

    #[tokio::test]
    async fn test_health_check_runs_while_ai_disabled() {
        let mut c = controller();
        assert!(!c.settings.ai_enabled);
        c.poll_cycle(morning(0)).await.unwrap();
        assert!(c.last_health_check_at.is_some());
    }

    #[tokio::test]
    async fn test_settings_update_flows_to_budget() {
        let mut c = controller();
        let update = SettingsUpdate {
            daily_grid_budget_kwh: Some(5.0),
            ..Default::default()
        };
        let settings = c.update_settings(&update);
        assert_eq!(settings.daily_grid_budget_kwh, 5.0);
        assert_eq!(c.status().budget.total_kwh, 5.0);
    }

    #[tokio::test]
    async fn test_credentials_report_includes_notification_bot() {
        let mut c = controller();
        let report = c.test_credentials().await;
        assert!(!report.telegram.ok);
        assert!(report.telegram.detail.contains("not configured"));
    }

    #[tokio::test]
    async fn test_ai_status_standby_when_disabled() {
        let c = controller();
        assert_eq!(c.status().ai.status, "standby");
    }

    #[test]
    fn test_within_daylight_default_window() {
        let c = controller();
        // Settings default to Asia/Manila, so build the instants in that zone
        let tz = c.settings.tz();
        let noon = tz
            .with_ymd_and_hms(2026, 8, 31, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let midnight = tz
            .with_ymd_and_hms(2026, 8, 31, 0, 30, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert!(c.within_daylight(noon));
        assert!(!c.within_daylight(midnight));
    }

    #[test]
    fn test_prompt_preview_is_deterministic() {
        let c = controller();
        let now = Utc::now();
        assert_eq!(
            c.build_live_prompt(now, "preview"),
            c.build_live_prompt(now, "preview")
        );
    }
}
