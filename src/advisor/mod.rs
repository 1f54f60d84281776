//! AI charging advisor
//!
//! Wraps the local Ollama host behind a strict contract: the model is asked
//! for JSON, its output is validated hard, and anything malformed or
//! out-of-range is treated as a failed call rather than trusted. The
//! advisor also owns call cadence — a baseline interval plus event
//! triggers, each latched so one crossing produces one extra call.

pub mod ollama;
pub mod prompt;

use crate::error::{Result, SunwardError};
use crate::logging::{get_logger, StructuredLogger};
use crate::settings::AiSettings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub use ollama::OllamaClient;
pub use prompt::{build_outlook_prompt, build_prompt, PromptContext};

/// Model self-reported confidence; anything unrecognized collapses to low
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    fn from_label(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "medium" => Confidence::Medium,
            "high" => Confidence::High,
            _ => Confidence::Low,
        }
    }
}

/// One validated model recommendation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRecommendation {
    pub amps: u32,
    pub reasoning: String,
    pub confidence: Confidence,
    /// What prompted this call (scheduled, solar_trend, soc_threshold, ...)
    pub trigger: String,
    pub generated_at: DateTime<Utc>,
}

impl AiRecommendation {
    pub fn age_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.generated_at).num_seconds().max(0) as u64
    }

    /// Whether the recommendation is still recent enough to act on
    pub fn is_fresh(&self, now: DateTime<Utc>, stale_threshold_secs: u64) -> bool {
        self.age_secs(now) < stale_threshold_secs
    }
}

/// Advisor state reported to the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AiStatus {
    /// Fresh recommendation driving the charger
    Active,
    /// Model unavailable or stale; rule-based logic driving
    Fallback,
    SuspendedNight,
    SuspendedNoSolar,
    SuspendedAway,
    /// AI disabled in settings
    Standby,
    /// Model host unreachable
    Offline,
    /// Last call failed; carries the error kind label
    Error(String),
}

impl AiStatus {
    pub fn as_string(&self) -> String {
        match self {
            AiStatus::Active => "active".to_string(),
            AiStatus::Fallback => "fallback".to_string(),
            AiStatus::SuspendedNight => "suspended_night".to_string(),
            AiStatus::SuspendedNoSolar => "suspended_no_solar".to_string(),
            AiStatus::SuspendedAway => "suspended_away".to_string(),
            AiStatus::Standby => "standby".to_string(),
            AiStatus::Offline => "offline".to_string(),
            AiStatus::Error(kind) => format!("error:{}", kind),
        }
    }
}

impl Serialize for AiStatus {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.as_string())
    }
}

impl std::fmt::Display for AiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_string())
    }
}

/// Strip markdown code fences some models wrap around their JSON
fn strip_fences(raw: &str) -> &str {
    let s = raw.trim();
    let s = s
        .strip_prefix("```json")
        .or_else(|| s.strip_prefix("```"))
        .unwrap_or(s);
    s.strip_suffix("```").unwrap_or(s).trim()
}

/// Validate raw model output into a recommendation.
///
/// Amps outside `0..=ai_max_amps` are a parse failure, not something to
/// silently clamp: a model that recommends 500 A is confused, and a
/// confused model should lose the cycle to the rule-based path. Amps in
/// `1..ai_min_amps` are physically unchargeable, so they coerce to 0 with
/// an explanatory reasoning.
pub fn parse_recommendation(
    raw: &str,
    ai: &AiSettings,
    trigger: &str,
) -> Result<AiRecommendation> {
    let body: serde_json::Value = serde_json::from_str(strip_fences(raw))
        .map_err(|e| SunwardError::ai_parse(format!("model output is not JSON: {}", e)))?;

    let amps_value = body
        .get("recommended_amps")
        .ok_or_else(|| SunwardError::ai_parse("missing 'recommended_amps'"))?;
    let amps = amps_value
        .as_i64()
        .ok_or_else(|| SunwardError::ai_parse("'recommended_amps' is not an integer"))?;
    if amps < 0 || amps > ai.ai_max_amps as i64 {
        return Err(SunwardError::ai_parse(format!(
            "recommended_amps {} outside 0..={}",
            amps, ai.ai_max_amps
        )));
    }

    let mut amps = amps as u32;
    let mut reasoning = body
        .get("reasoning")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let confidence = Confidence::from_label(
        body.get("confidence").and_then(|v| v.as_str()).unwrap_or(""),
    );

    if amps > 0 && amps < ai.ai_min_amps {
        reasoning = format!(
            "Solar surplus only supports {}A, below the vehicle's {}A minimum. Pausing until conditions improve.",
            amps, ai.ai_min_amps
        );
        amps = 0;
    }

    Ok(AiRecommendation {
        amps,
        reasoning,
        confidence,
        trigger: trigger.to_string(),
        generated_at: Utc::now(),
    })
}

/// Reasoning prefix marking output from the fallback model
pub const FALLBACK_PREFIX: &str = "[fallback model] ";

/// Run one advisory call through the model chain.
///
/// Primary model first with its retry budget, then the fallback model with
/// two attempts. Parse failures burn attempts the same as network failures;
/// a model that returns garbage repeatedly does not get to drive the
/// charger.
pub async fn run_model_chain(
    client: &OllamaClient,
    prompt: &str,
    trigger: &str,
    ai: &AiSettings,
) -> Result<AiRecommendation> {
    let mut chain: Vec<(String, u32, bool)> =
        vec![(ai.ai_model.clone(), ai.ai_retry_attempts, false)];
    if !ai.ai_fallback_model.trim().is_empty() && ai.ai_fallback_model != ai.ai_model {
        chain.push((ai.ai_fallback_model.clone(), 2, true));
    }

    let mut last_err = None;
    for (model, attempts, is_fallback) in chain {
        match client
            .generate(&model, prompt, ai.ai_temperature, ai.ai_max_tokens, true, attempts)
            .await
            .and_then(|raw| parse_recommendation(&raw, ai, trigger))
        {
            Ok(mut rec) => {
                if is_fallback {
                    rec.reasoning = format!("{}{}", FALLBACK_PREFIX, rec.reasoning);
                }
                return Ok(rec);
            }
            Err(e) => {
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| SunwardError::ai("no models configured")))
}

/// Natural-language generation for the daily outlook; plain text, slightly
/// warmer sampling than the decision calls. A free function so callers can
/// run it off-loop on a cloned client.
pub async fn run_outlook(client: &OllamaClient, prompt: &str, ai: &AiSettings) -> Result<String> {
    client
        .generate(&ai.ai_model, prompt, 0.3, 200, false, 1)
        .await
        .map(|s| s.trim().to_string())
}

/// Per-cycle signals the trigger logic watches
#[derive(Debug, Clone, Copy)]
pub struct TriggerSignals {
    pub vehicle_soc: u32,
    pub budget_used_pct: f64,
    /// Minutes until configured departure, if a departure time is set
    pub minutes_to_departure: Option<i64>,
}

const TREND_SAMPLES: usize = 5;
const SOLAR_AVG_SAMPLES: usize = 3;
/// Relative change over the trend window that counts as a shift
const TREND_BAND: f64 = 0.10;

pub struct Advisor {
    client: OllamaClient,
    logger: StructuredLogger,

    last_call_at: Option<DateTime<Utc>>,
    last_recommendation: Option<AiRecommendation>,
    healthy: bool,
    consecutive_failures: u32,
    /// Set when the active recommendation came from the fallback model
    used_fallback_model: bool,

    solar_avg_buf: VecDeque<f64>,
    trend_buf: VecDeque<f64>,
    last_trend: String,

    refresh_requested: bool,
    soc_high_fired: bool,
    soc_full_fired: bool,
    budget_warn_fired: bool,
    budget_crit_fired: bool,
    departure_fired: bool,
}

impl Advisor {
    pub fn new(ollama_host: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: OllamaClient::new(ollama_host)?,
            logger: get_logger("advisor"),
            last_call_at: None,
            last_recommendation: None,
            healthy: false,
            consecutive_failures: 0,
            used_fallback_model: false,
            solar_avg_buf: VecDeque::with_capacity(SOLAR_AVG_SAMPLES),
            trend_buf: VecDeque::with_capacity(TREND_SAMPLES),
            last_trend: "stable".to_string(),
            refresh_requested: false,
            soc_high_fired: false,
            soc_full_fired: false,
            budget_warn_fired: false,
            budget_crit_fired: false,
            departure_fired: false,
        })
    }

    pub fn healthy(&self) -> bool {
        self.healthy
    }

    pub fn used_fallback_model(&self) -> bool {
        self.used_fallback_model
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_recommendation(&self) -> Option<&AiRecommendation> {
        self.last_recommendation.as_ref()
    }

    /// Feed one cycle's smoothed solar reading into the trend buffers
    pub fn observe_solar(&mut self, solar_w: f64) {
        if self.solar_avg_buf.len() == SOLAR_AVG_SAMPLES {
            self.solar_avg_buf.pop_front();
        }
        self.solar_avg_buf.push_back(solar_w);
        if self.trend_buf.len() == TREND_SAMPLES {
            self.trend_buf.pop_front();
        }
        self.trend_buf.push_back(solar_w);
    }

    /// Short-window average used for display and decisions
    pub fn solar_avg(&self) -> f64 {
        if self.solar_avg_buf.is_empty() {
            return 0.0;
        }
        self.solar_avg_buf.iter().sum::<f64>() / self.solar_avg_buf.len() as f64
    }

    /// Trend over the longer window: rising, falling, or stable within band
    pub fn solar_trend(&self) -> &'static str {
        if self.trend_buf.len() < TREND_SAMPLES {
            return "stable";
        }
        let first = self.trend_buf.front().copied().unwrap_or(0.0);
        let last = self.trend_buf.back().copied().unwrap_or(0.0);
        if first <= 0.0 {
            return if last > 0.0 { "rising" } else { "stable" };
        }
        let ratio = last / first;
        if ratio > 1.0 + TREND_BAND {
            "rising"
        } else if ratio < 1.0 - TREND_BAND {
            "falling"
        } else {
            "stable"
        }
    }

    /// Request an immediate model call from the UI
    pub fn request_refresh(&mut self) {
        self.refresh_requested = true;
    }

    /// Clear session-scoped latches when a charging session ends or a new
    /// day starts, so thresholds can fire again.
    pub fn reset_latches(&mut self) {
        self.soc_high_fired = false;
        self.soc_full_fired = false;
        self.budget_warn_fired = false;
        self.budget_crit_fired = false;
        self.departure_fired = false;
    }

    /// Decide whether a model call is due this cycle and why.
    ///
    /// Event triggers beat the schedule; every threshold trigger latches so
    /// it fires once per crossing, not every cycle it remains true.
    pub fn due_trigger(
        &mut self,
        now: DateTime<Utc>,
        ai: &AiSettings,
        signals: &TriggerSignals,
    ) -> Option<String> {
        if self.refresh_requested {
            self.refresh_requested = false;
            return Some("manual_refresh".to_string());
        }

        let trend = self.solar_trend().to_string();
        if trend != self.last_trend && self.trend_buf.len() == TREND_SAMPLES {
            self.last_trend = trend.clone();
            return Some(format!("solar_trend_{}", trend));
        }
        self.last_trend = trend;

        if signals.vehicle_soc >= 95 && !self.soc_full_fired {
            self.soc_full_fired = true;
            return Some("soc_95".to_string());
        }
        if signals.vehicle_soc >= 75 && !self.soc_high_fired {
            self.soc_high_fired = true;
            return Some("soc_75".to_string());
        }

        if signals.budget_used_pct >= 95.0 && !self.budget_crit_fired {
            self.budget_crit_fired = true;
            return Some("budget_95pct".to_string());
        }
        if signals.budget_used_pct >= 80.0 && !self.budget_warn_fired {
            self.budget_warn_fired = true;
            return Some("budget_80pct".to_string());
        }

        if let Some(mins) = signals.minutes_to_departure {
            if mins <= 60 && mins > 0 && !self.departure_fired {
                self.departure_fired = true;
                return Some("departure_soon".to_string());
            }
        }

        match self.last_call_at {
            None => Some("startup".to_string()),
            Some(at) => {
                if (now - at).num_seconds() >= ai.ai_call_interval_secs as i64 {
                    Some("scheduled".to_string())
                } else {
                    None
                }
            }
        }
    }

    /// Record the outcome of a model-chain call launched from this advisor
    pub fn record_result(&mut self, result: &Result<AiRecommendation>) {
        match result {
            Ok(rec) => {
                self.logger.info(&format!(
                    "Recommendation: {}A ({:?}, trigger={})",
                    rec.amps, rec.confidence, rec.trigger
                ));
                self.last_call_at = Some(rec.generated_at);
                self.used_fallback_model = rec.reasoning.starts_with(FALLBACK_PREFIX);
                self.last_recommendation = Some(rec.clone());
                self.consecutive_failures = 0;
                self.healthy = true;
            }
            Err(e) => {
                self.logger.warn(&format!("Model chain failed: {}", e));
                self.consecutive_failures += 1;
                self.last_call_at = Some(Utc::now());
            }
        }
    }

    /// Mark that a call has been launched, so the schedule does not fire
    /// again while the chain is still in flight.
    pub fn mark_call_started(&mut self, now: DateTime<Utc>) {
        self.last_call_at = Some(now);
    }

    /// Clone of the underlying client, for running the chain off-loop
    pub fn client(&self) -> OllamaClient {
        self.client.clone()
    }

    /// Probe the model host and update the advisor's health flag
    pub async fn check_health(&mut self) -> (bool, String) {
        let (ok, detail) = self.client.check_health().await;
        if ok != self.healthy {
            self.logger
                .info(&format!("Ollama health changed: {} ({})", ok, detail));
        }
        self.healthy = ok;
        (ok, detail)
    }
}
