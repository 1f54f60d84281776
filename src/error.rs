//! Crate-wide error type and conversions from the libraries underneath.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, SunwardError>;

#[derive(Debug, Error)]
pub enum SunwardError {
    /// Bad or missing process configuration
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Inverter cloud API failure
    #[error("Inverter error: {message}")]
    Inverter { message: String },

    /// Vehicle API failure
    #[error("Vehicle error: {message}")]
    Vehicle { message: String },

    /// Model host unreachable, timed out, or returned an HTTP failure
    #[error("AI error: {message}")]
    Ai { message: String },

    /// Malformed or out-of-range model output
    #[error("AI parse error: {message}")]
    AiParse { message: String },

    /// Listener or routing failure
    #[error("Web error: {message}")]
    Web { message: String },

    /// Encoding or decoding failure
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Filesystem failure
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Transport failure talking to an external service
    #[error("Network error: {message}")]
    Network { message: String },

    /// Other external API failure (forecast, notification bot)
    #[error("External API error: {message}")]
    Api { message: String },

    /// A named field failed validation
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// An external call exceeded its deadline
    #[error("Timed out: {message}")]
    Timeout { message: String },

    /// Anything without a better home
    #[error("{message}")]
    Generic { message: String },
}

// One constructor per variant so call sites stay short
impl SunwardError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        SunwardError::Config {
            message: message.into(),
        }
    }

    pub fn inverter<S: Into<String>>(message: S) -> Self {
        SunwardError::Inverter {
            message: message.into(),
        }
    }

    pub fn vehicle<S: Into<String>>(message: S) -> Self {
        SunwardError::Vehicle {
            message: message.into(),
        }
    }

    pub fn ai<S: Into<String>>(message: S) -> Self {
        SunwardError::Ai {
            message: message.into(),
        }
    }

    pub fn ai_parse<S: Into<String>>(message: S) -> Self {
        SunwardError::AiParse {
            message: message.into(),
        }
    }

    pub fn web<S: Into<String>>(message: S) -> Self {
        SunwardError::Web {
            message: message.into(),
        }
    }

    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        SunwardError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn io<S: Into<String>>(message: S) -> Self {
        SunwardError::Io {
            message: message.into(),
        }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        SunwardError::Network {
            message: message.into(),
        }
    }

    pub fn api<S: Into<String>>(message: S) -> Self {
        SunwardError::Api {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        SunwardError::Timeout {
            message: message.into(),
        }
    }

    pub fn generic<S: Into<String>>(message: S) -> Self {
        SunwardError::Generic {
            message: message.into(),
        }
    }

    /// Short machine-readable kind label used in degraded-status fields
    /// (e.g. `ai_status = error:<kind>`)
    pub fn kind(&self) -> &'static str {
        match self {
            SunwardError::Config { .. } => "config",
            SunwardError::Inverter { .. } => "inverter",
            SunwardError::Vehicle { .. } => "vehicle",
            SunwardError::Ai { .. } => "ai",
            SunwardError::AiParse { .. } => "parse",
            SunwardError::Web { .. } => "web",
            SunwardError::Serialization { .. } => "serialization",
            SunwardError::Io { .. } => "io",
            SunwardError::Network { .. } => "network",
            SunwardError::Api { .. } => "api",
            SunwardError::Validation { .. } => "validation",
            SunwardError::Timeout { .. } => "timeout",
            SunwardError::Generic { .. } => "generic",
        }
    }
}

impl From<std::io::Error> for SunwardError {
    fn from(err: std::io::Error) -> Self {
        SunwardError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for SunwardError {
    fn from(err: serde_yaml::Error) -> Self {
        SunwardError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SunwardError {
    fn from(err: serde_json::Error) -> Self {
        SunwardError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for SunwardError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SunwardError::timeout(err.to_string())
        } else {
            SunwardError::network(err.to_string())
        }
    }
}

impl From<chrono::ParseError> for SunwardError {
    fn from(err: chrono::ParseError) -> Self {
        SunwardError::Validation {
            field: "datetime".to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_pick_variants() {
        assert!(matches!(
            SunwardError::config("x"),
            SunwardError::Config { .. }
        ));
        assert!(matches!(
            SunwardError::inverter("x"),
            SunwardError::Inverter { .. }
        ));
        assert!(matches!(
            SunwardError::validation("field", "x"),
            SunwardError::Validation { .. }
        ));
    }

    #[test]
    fn test_display_strings() {
        let err = SunwardError::config("missing host");
        assert_eq!(format!("{}", err), "Configuration error: missing host");

        let err = SunwardError::validation("timezone", "not IANA");
        assert_eq!(format!("{}", err), "Invalid timezone: not IANA");
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(SunwardError::timeout("t").kind(), "timeout");
        assert_eq!(SunwardError::ai_parse("p").kind(), "parse");
        assert_eq!(SunwardError::vehicle("v").kind(), "vehicle");
    }
}
