//! Persistence layer for settings and controller state
//!
//! One JSON state file holding everything that must survive a restart:
//! settings, AI tuning, credentials, the budget ledger, the open session
//! and the closed-session history. Loading is best-effort — a missing or
//! corrupt file falls back to defaults so the control loop always starts.

use crate::budget::GridBudgetLedger;
use crate::clients::Credentials;
use crate::error::Result;
use crate::logging::get_logger;
use crate::session::{ActiveSession, SessionRecord};
use crate::settings::{AiSettings, Settings};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Oldest closed sessions are dropped beyond this count
const MAX_SESSION_HISTORY: usize = 200;

/// Everything written to the state file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentState {
    pub settings: Settings,
    pub ai_settings: AiSettings,
    pub credentials: Credentials,
    pub budget: Option<GridBudgetLedger>,
    pub active_session: Option<ActiveSession>,
    pub sessions: Vec<SessionRecord>,
    pub manual_override_amps: Option<u32>,
}

/// Persistence manager
pub struct PersistenceManager {
    file_path: String,
    pub state: PersistentState,
    logger: crate::logging::StructuredLogger,
}

impl PersistenceManager {
    pub fn new(file_path: &str) -> Self {
        Self {
            file_path: file_path.to_string(),
            state: PersistentState::default(),
            logger: get_logger("persistence"),
        }
    }

    /// Load state from disk. Missing file means first run; a corrupt file
    /// is logged and replaced with defaults rather than stopping startup.
    pub fn load(&mut self) {
        let path = Path::new(&self.file_path);
        if !path.exists() {
            self.logger
                .info("No persistent state file found, using defaults");
            return;
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(state) => {
                    self.state = state;
                    self.logger.info("Loaded persistent state from disk");
                }
                Err(e) => {
                    self.logger
                        .error(&format!("Corrupt state file, using defaults: {}", e));
                    self.state = PersistentState::default();
                }
            },
            Err(e) => {
                self.logger
                    .error(&format!("Cannot read state file, using defaults: {}", e));
            }
        }
    }

    /// Save state to disk
    pub fn save(&self) -> Result<()> {
        let contents = serde_json::to_string_pretty(&self.state)?;
        std::fs::write(&self.file_path, contents)?;
        self.logger.debug("Saved persistent state to disk");
        Ok(())
    }

    /// Append a closed session, trimming the oldest beyond the cap
    pub fn push_session(&mut self, record: SessionRecord) {
        self.state.sessions.push(record);
        if self.state.sessions.len() > MAX_SESSION_HISTORY {
            let excess = self.state.sessions.len() - MAX_SESSION_HISTORY;
            self.state.sessions.drain(..excess);
        }
    }

    /// Newest-first page of closed sessions
    pub fn sessions_page(&self, limit: usize, offset: usize) -> Vec<SessionRecord> {
        self.state
            .sessions
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn session_by_id(&self, id: &str) -> Option<&SessionRecord> {
        self.state.sessions.iter().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            duration_mins: 30,
            start_soc: 50,
            end_soc: 60,
            kwh_added: 5.0,
            solar_kwh: 4.0,
            grid_kwh: 1.0,
            solar_pct: 80.0,
            saved: 43.3,
            stats: Default::default(),
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let path_str = path.to_str().unwrap();

        let mut mgr = PersistenceManager::new(path_str);
        mgr.state.settings.target_soc = 90;
        mgr.state.manual_override_amps = Some(10);
        mgr.push_session(record("abc"));
        mgr.save().unwrap();

        let mut loaded = PersistenceManager::new(path_str);
        loaded.load();
        assert_eq!(loaded.state.settings.target_soc, 90);
        assert_eq!(loaded.state.manual_override_amps, Some(10));
        assert_eq!(loaded.state.sessions.len(), 1);
        assert!(loaded.session_by_id("abc").is_some());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let mut mgr = PersistenceManager::new("/nonexistent/dir/state.json");
        mgr.load();
        assert_eq!(mgr.state.settings.target_soc, 80);
        assert!(mgr.state.sessions.is_empty());
    }

    #[test]
    fn test_corrupt_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        let mut mgr = PersistenceManager::new(path.to_str().unwrap());
        mgr.load();
        assert_eq!(mgr.state.settings.target_soc, 80);
    }

    #[test]
    fn test_pagination_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut mgr = PersistenceManager::new(path.to_str().unwrap());
        for i in 0..5 {
            mgr.push_session(record(&format!("s{}", i)));
        }
        let page = mgr.sessions_page(2, 1);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, "s3");
        assert_eq!(page[1].id, "s2");
    }
}
