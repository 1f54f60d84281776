//! # Sunward - Solar-aware EV charging controller
//!
//! Charges an EV from surplus solar by steering the vehicle's charging
//! amperage once per polling cycle, based on live inverter telemetry,
//! vehicle state, an irradiance forecast, and (optionally) a local LLM
//! advisor with strict output validation.
//!
//! ## Architecture
//!
//! The application follows a modular architecture with clear separation of concerns:
//!
//! - `config`: Process configuration (YAML) and validation
//! - `logging`: Structured logging and tracing
//! - `settings`: User-tunable charging settings with partial updates
//! - `telemetry`: Per-cycle snapshot types for inverter/vehicle/forecast
//! - `clients`: HTTP clients for the inverter, vehicle, and forecast APIs
//! - `location`: Home/away classification from named location and GPS
//! - `mode`: Operating-mode derivation (pure, strict precedence)
//! - `budget`: Daily grid-import budget ledger with zoned midnight reset
//! - `advisor`: LLM prompt construction, validation, cadence, model chain
//! - `engine`: Per-cycle amperage decision
//! - `session`: Charging session accounting and solar/grid partition
//! - `controller`: The control loop tying everything together
//! - `persistence`: JSON state file for settings, sessions, and budget
//! - `web`: HTTP server and REST API

pub mod advisor;
pub mod budget;
pub mod clients;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod location;
pub mod logging;
pub mod mode;
pub mod persistence;
pub mod session;
pub mod settings;
pub mod telemetry;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use controller::{ChargeController, ControllerCommand};
pub use error::{Result, SunwardError};
