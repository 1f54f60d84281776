//! Configuration management for Sunward
//!
//! This module handles loading, validation, and management of the process
//! configuration from YAML files. User-tunable charging settings live in
//! `settings.rs` and are persisted separately; this file covers the values
//! an operator sets once at deploy time.

use crate::error::{Result, SunwardError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Process configuration, read once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listener settings
    pub web: WebConfig,

    /// Log sink settings
    pub logging: LoggingConfig,

    /// Ollama model host base URL
    pub ollama_host: String,

    /// Control loop tick interval in seconds
    pub poll_interval_secs: u64,

    /// Path to the JSON state file (settings, sessions, budget)
    pub state_file: String,

    /// IANA timezone used for daily budget resets and the daylight window
    pub timezone: String,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Interface to bind
    pub host: String,

    /// Listener port
    pub port: u16,
}

/// Log sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub level: String,

    /// Optional console-specific level override
    pub console_level: Option<String>,

    /// Optional file-specific level override
    pub file_level: Option<String>,

    /// Path to log file (or directory for rotated files)
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Mirror log lines to stdout
    pub console_output: bool,

    /// Emit JSON lines instead of the compact format
    pub json_format: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/sunward.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web: WebConfig::default(),
            logging: LoggingConfig::default(),
            ollama_host: "http://localhost:11434".to_string(),
            poll_interval_secs: 30,
            state_file: "sunward_state.json".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

impl Config {
    /// Read configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Read configuration from the first search path that exists, or defaults
    pub fn load() -> Result<Self> {
        [
            "sunward_config.yaml",
            "/data/sunward_config.yaml",
            "/etc/sunward/config.yaml",
        ]
        .iter()
        .find(|p| Path::new(p).exists())
        .map_or_else(|| Ok(Config::default()), Self::from_file)
    }

    /// Write the configuration back out as YAML
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Reject values that cannot work at runtime
    pub fn validate(&self) -> Result<()> {
        if self.web.host.is_empty() {
            return Err(SunwardError::validation(
                "web.host",
                "Bind address cannot be empty",
            ));
        }

        if self.web.port == 0 {
            return Err(SunwardError::validation("web.port", "Port cannot be 0"));
        }

        if self.ollama_host.is_empty() {
            return Err(SunwardError::validation(
                "ollama_host",
                "Model host URL cannot be empty",
            ));
        }

        if self.poll_interval_secs == 0 {
            return Err(SunwardError::validation(
                "poll_interval_secs",
                "Tick interval cannot be 0",
            ));
        }

        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(SunwardError::validation(
                "timezone",
                "Not a valid IANA timezone",
            ));
        }

        Ok(())
    }

    /// Parsed timezone; UTC if the configured string is invalid
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert_eq!(config.web.port, 8080);
        assert_eq!(config.poll_interval_secs, 30);
        assert_eq!(config.timezone, "UTC");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unusable_values() {
        let mut config = Config::default();
        config.web.port = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.timezone = "Not/AZone".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.web.port, back.web.port);
        assert_eq!(config.ollama_host, back.ollama_host);
    }

    #[test]
    fn test_config_partial_yaml_uses_defaults() {
        let yaml = "web:\n  host: 127.0.0.1\n  port: 9000\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.web.port, 9000);
        assert_eq!(config.poll_interval_secs, 30);
    }

    #[test]
    fn test_tz_parse() {
        let mut config = Config::default();
        config.timezone = "Europe/Amsterdam".to_string();
        assert_eq!(config.tz(), chrono_tz::Europe::Amsterdam);
    }
}
