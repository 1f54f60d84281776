//! Charging session accounting
//!
//! Two-state machine (Idle/Active) fed once per cycle. While a session is
//! open, energy is accumulated as charging power times elapsed time and
//! partitioned into solar vs grid from the instantaneous surplus fraction.
//! The accumulated ledger is the authoritative split; any live percentage
//! shown elsewhere is display-only. Savings are the grid energy avoided,
//! priced at the configured electricity rate.

use crate::telemetry::{InverterReading, VehicleState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sessions below this energy are connector-bump noise, not charges
const MIN_SESSION_KWH: f64 = 0.05;

/// Per-session aggregates accumulated every cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub samples: u32,
    pub avg_solar_w: f64,
    pub peak_solar_w: f64,
    pub avg_grid_w: f64,
    pub avg_amps: f64,
    sum_solar_w: f64,
    sum_grid_w: f64,
    sum_amps: f64,
}

impl SessionStats {
    fn observe(&mut self, solar_w: f64, grid_w: f64, amps: u32) {
        self.samples += 1;
        self.sum_solar_w += solar_w;
        self.sum_grid_w += grid_w;
        self.sum_amps += amps as f64;
        self.peak_solar_w = self.peak_solar_w.max(solar_w);
        let n = self.samples as f64;
        self.avg_solar_w = self.sum_solar_w / n;
        self.avg_grid_w = self.sum_grid_w / n;
        self.avg_amps = self.sum_amps / n;
    }
}

/// An open charging session; persisted so a restart keeps its ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub start_soc: u32,
    pub current_soc: u32,
    pub kwh_added: f64,
    pub solar_kwh: f64,
    pub grid_kwh: f64,
    pub saved: f64,
    pub stats: SessionStats,
}

impl ActiveSession {
    pub fn elapsed_mins(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_minutes().max(0)
    }

    /// Ledger-based solar share of the energy added so far
    pub fn solar_pct(&self) -> f64 {
        if self.kwh_added > 0.0 {
            (self.solar_kwh / self.kwh_added * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        }
    }
}

/// A closed session as handed to persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_mins: i64,
    pub start_soc: u32,
    pub end_soc: u32,
    pub kwh_added: f64,
    pub solar_kwh: f64,
    pub grid_kwh: f64,
    pub solar_pct: f64,
    pub saved: f64,
    pub stats: SessionStats,
}

/// What happened to the session this cycle
#[derive(Debug, Clone)]
pub enum SessionEvent {
    None,
    Started,
    Updated,
    Ended(Box<SessionRecord>),
    /// Session closed below the energy threshold and was dropped
    Discarded,
}

/// Session accountant: sole owner of the open session
#[derive(Debug, Default)]
pub struct SessionAccountant {
    active: Option<ActiveSession>,
    last_tick: Option<DateTime<Utc>>,
}

impl SessionAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a previously open session after a restart
    pub fn restore(&mut self, active: Option<ActiveSession>) {
        self.active = active;
        self.last_tick = None;
    }

    pub fn active(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    /// Advance the state machine with this cycle's telemetry.
    ///
    /// `at_home` must already reflect the location classification; a
    /// vehicle charging away never opens a session here.
    pub fn tick(
        &mut self,
        now: DateTime<Utc>,
        at_home: bool,
        vehicle: &VehicleState,
        inverter: Option<&InverterReading>,
        electricity_rate: f64,
    ) -> SessionEvent {
        let charging_at_home =
            at_home && vehicle.charge_port_connected && vehicle.charging_state.is_charging();

        let event = match (&mut self.active, charging_at_home) {
            (None, false) => SessionEvent::None,
            (None, true) => {
                self.active = Some(ActiveSession {
                    id: Uuid::new_v4().to_string(),
                    started_at: now,
                    start_soc: vehicle.soc,
                    current_soc: vehicle.soc,
                    kwh_added: 0.0,
                    solar_kwh: 0.0,
                    grid_kwh: 0.0,
                    saved: 0.0,
                    stats: SessionStats::default(),
                });
                SessionEvent::Started
            }
            (Some(session), true) => {
                let elapsed_h = self
                    .last_tick
                    .map(|t| ((now - t).num_seconds().max(0) as f64) / 3600.0)
                    .unwrap_or(0.0);
                let delta_kwh = vehicle.charging_kw.max(0.0) * elapsed_h;
                if delta_kwh > 0.0 {
                    let solar_frac = inverter
                        .map(|inv| solar_fraction(inv, vehicle))
                        .unwrap_or(0.0);
                    session.kwh_added += delta_kwh;
                    session.solar_kwh += delta_kwh * solar_frac;
                    session.grid_kwh += delta_kwh * (1.0 - solar_frac);
                    session.saved = session.solar_kwh * electricity_rate;
                }
                session.current_soc = vehicle.soc;
                if let Some(inv) = inverter {
                    session
                        .stats
                        .observe(inv.solar_w, inv.grid_import_w, vehicle.charging_amps);
                }
                SessionEvent::Updated
            }
            (Some(_), false) => match self.active.take() {
                Some(session) if session.kwh_added < MIN_SESSION_KWH => SessionEvent::Discarded,
                Some(session) => {
                    let solar_pct = session.solar_pct();
                    SessionEvent::Ended(Box::new(SessionRecord {
                        id: session.id,
                        started_at: session.started_at,
                        ended_at: now,
                        duration_mins: (now - session.started_at).num_minutes().max(0),
                        start_soc: session.start_soc,
                        end_soc: vehicle.soc.max(session.current_soc),
                        kwh_added: session.kwh_added,
                        solar_kwh: session.solar_kwh,
                        grid_kwh: session.grid_kwh,
                        solar_pct,
                        saved: session.saved,
                        stats: session.stats,
                    }))
                }
                None => SessionEvent::None,
            },
        };

        self.last_tick = Some(now);
        event
    }
}

/// Instantaneous share of the vehicle's draw covered by solar surplus.
/// Household demand includes the vehicle itself, so it is subtracted out
/// before computing what solar has left over for the car.
fn solar_fraction(inverter: &InverterReading, vehicle: &VehicleState) -> f64 {
    let vehicle_w = vehicle.charging_kw.max(0.0) * 1000.0;
    if vehicle_w <= 0.0 {
        return 0.0;
    }
    let other_load = (inverter.household_demand_w - vehicle_w).max(0.0);
    let surplus = (inverter.solar_w - other_load).max(0.0);
    (surplus.min(vehicle_w) / vehicle_w).clamp(0.0, 1.0)
}
