//! Daily grid-budget ledger
//!
//! Tracks grid-imported energy against a daily cap, accumulated as grid
//! power times elapsed time each cycle. Resets once per local calendar day
//! in the configured timezone; the comparison is on the zoned date so DST
//! transitions cannot double-reset or skip a day. `total <= 0` is the
//! "no budget" sentinel: accumulation still runs for display, but cutoff
//! is never signaled.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Daily grid-budget state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridBudgetLedger {
    /// Budget for the day (kWh); `<= 0` disables enforcement
    total_kwh: f64,

    /// Grid energy attributed so far today (kWh)
    used_kwh: f64,

    /// Local calendar date of the last reset
    last_reset_date: NaiveDate,
}

impl GridBudgetLedger {
    pub fn new(total_kwh: f64, now: DateTime<Utc>, tz: chrono_tz::Tz) -> Self {
        Self {
            total_kwh,
            used_kwh: 0.0,
            last_reset_date: now.with_timezone(&tz).date_naive(),
        }
    }

    /// Update the daily cap from settings without touching today's usage
    pub fn set_total(&mut self, total_kwh: f64) {
        self.total_kwh = total_kwh;
    }

    /// Add grid-attributable energy since the last sample.
    /// Exports do not reduce the budget, so negative deltas are ignored.
    pub fn accumulate(&mut self, delta_kwh: f64) {
        if delta_kwh > 0.0 {
            self.used_kwh += delta_kwh;
        }
    }

    /// Zero the used counter when the local calendar date changes.
    /// Idempotent: repeated calls within one day mutate state at most once.
    /// Returns true when a reset happened.
    pub fn reset_if_new_day(&mut self, now: DateTime<Utc>, tz: chrono_tz::Tz) -> bool {
        let today = now.with_timezone(&tz).date_naive();
        if today != self.last_reset_date {
            self.used_kwh = 0.0;
            self.last_reset_date = today;
            true
        } else {
            false
        }
    }

    /// Whether the cap is enforced at all
    pub fn enforced(&self) -> bool {
        self.total_kwh > 0.0
    }

    /// Whether charging should be cut off
    pub fn exhausted(&self) -> bool {
        self.enforced() && self.used_kwh >= self.total_kwh
    }

    pub fn total_kwh(&self) -> f64 {
        self.total_kwh
    }

    pub fn used_kwh(&self) -> f64 {
        self.used_kwh
    }

    /// Remaining budget, never negative; unlimited budgets report 0
    pub fn remaining_kwh(&self) -> f64 {
        if self.enforced() {
            (self.total_kwh - self.used_kwh).max(0.0)
        } else {
            0.0
        }
    }

    /// Percentage of the budget consumed; 0 when unenforced
    pub fn used_pct(&self) -> f64 {
        if self.enforced() {
            (self.used_kwh / self.total_kwh * 100.0).min(100.0)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(tz: chrono_tz::Tz, y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        tz.with_ymd_and_hms(y, m, d, h, 0, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_accumulate_clamps_negative() {
        let tz = chrono_tz::UTC;
        let mut ledger = GridBudgetLedger::new(5.0, Utc::now(), tz);
        ledger.accumulate(1.5);
        ledger.accumulate(-0.4);
        assert_eq!(ledger.used_kwh(), 1.5);
    }

    #[test]
    fn test_exhaustion() {
        let tz = chrono_tz::UTC;
        let mut ledger = GridBudgetLedger::new(5.0, Utc::now(), tz);
        ledger.accumulate(4.9);
        assert!(!ledger.exhausted());
        ledger.accumulate(0.1);
        assert!(ledger.exhausted());
        assert_eq!(ledger.remaining_kwh(), 0.0);
        assert_eq!(ledger.used_pct(), 100.0);
    }

    #[test]
    fn test_disabled_sentinel() {
        let tz = chrono_tz::UTC;
        let mut ledger = GridBudgetLedger::new(0.0, Utc::now(), tz);
        ledger.accumulate(999.0);
        assert!(!ledger.enforced());
        assert!(!ledger.exhausted());
        assert_eq!(ledger.used_kwh(), 999.0);
        assert_eq!(ledger.used_pct(), 0.0);
    }

    #[test]
    fn test_reset_once_per_day() {
        let tz = chrono_tz::Asia::Manila;
        let day1 = at(tz, 2026, 8, 30, 10);
        let mut ledger = GridBudgetLedger::new(5.0, day1, tz);
        ledger.accumulate(3.0);

        // Repeated calls within the same local day never mutate
        assert!(!ledger.reset_if_new_day(at(tz, 2026, 8, 30, 15), tz));
        assert!(!ledger.reset_if_new_day(at(tz, 2026, 8, 30, 23), tz));
        assert_eq!(ledger.used_kwh(), 3.0);

        // First call after local midnight resets exactly once
        assert!(ledger.reset_if_new_day(at(tz, 2026, 8, 31, 0), tz));
        assert_eq!(ledger.used_kwh(), 0.0);
        assert!(!ledger.reset_if_new_day(at(tz, 2026, 8, 31, 1), tz));
    }

    #[test]
    fn test_reset_uses_zoned_date_not_utc() {
        let tz = chrono_tz::Asia::Manila; // UTC+8
        // 20:00 UTC on Aug 30 is already 04:00 Aug 31 in Manila
        let start = Utc.with_ymd_and_hms(2026, 8, 30, 2, 0, 0).unwrap();
        let mut ledger = GridBudgetLedger::new(5.0, start, tz);
        ledger.accumulate(2.0);
        let later = Utc.with_ymd_and_hms(2026, 8, 30, 20, 0, 0).unwrap();
        assert!(ledger.reset_if_new_day(later, tz));
        assert_eq!(ledger.used_kwh(), 0.0);
    }

    #[test]
    fn test_reset_across_dst_transition() {
        // Europe/Amsterdam falls back on 2026-10-25; the zoned date still
        // advances exactly once.
        let tz = chrono_tz::Europe::Amsterdam;
        let before = at(tz, 2026, 10, 24, 22);
        let mut ledger = GridBudgetLedger::new(5.0, before, tz);
        ledger.accumulate(1.0);
        assert!(ledger.reset_if_new_day(at(tz, 2026, 10, 25, 1), tz));
        assert!(!ledger.reset_if_new_day(at(tz, 2026, 10, 25, 23), tz));
    }
}
