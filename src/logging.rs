//! Tracing setup and component-scoped loggers.
//!
//! Log lines go to a daily-rotated file and optionally the console. Each
//! sink runs at its own level and either compact or JSON format.

use crate::config::LoggingConfig;
use crate::error::{Result, SunwardError};
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Once;
use tracing::{Level, debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// The non-blocking writer stops flushing once its guard drops
static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static INIT: Once = Once::new();
static INIT_ERROR: OnceCell<String> = OnceCell::new();

macro_rules! sink {
    ($writer:expr, $level:expr, $json:expr) => {{
        let base = fmt::layer()
            .with_writer($writer)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false);
        if $json {
            base.json()
                .with_filter(LevelFilter::from_level($level))
                .boxed()
        } else {
            base.with_filter(LevelFilter::from_level($level)).boxed()
        }
    }};
}

/// Install the global tracing subscriber. Safe to call more than once;
/// only the first call takes effect.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    INIT.call_once(|| {
        if let Err(e) = install(config) {
            let _ = INIT_ERROR.set(e.to_string());
        }
    });
    match INIT_ERROR.get() {
        Some(e) => Err(SunwardError::config(e.clone())),
        None => Ok(()),
    }
}

fn install(config: &LoggingConfig) -> Result<()> {
    let base = parse_level(&config.level)?;
    let console_level = match &config.console_level {
        Some(s) => parse_level(s)?,
        None => base,
    };
    let file_level = match &config.file_level {
        Some(s) => parse_level(s)?,
        None => base,
    };

    // RUST_LOG wins; otherwise filter down to the most verbose sink.
    // tracing orders levels by verbosity, TRACE greatest.
    let verbose = std::cmp::max(console_level, file_level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("sunward={},hyper=warn,reqwest=warn", verbose).into());

    let registry = tracing_subscriber::registry().with(filter);

    if console_only() {
        registry
            .with(sink!(std::io::stdout, console_level, config.json_format))
            .init();
        info!(?console_level, "Logging initialized (console only)");
        return Ok(());
    }

    let appender = rolling::Builder::new()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix("sunward")
        .filename_suffix("log")
        .max_log_files(config.backup_count as usize)
        .build(log_dir(&config.file))
        .map_err(|e| SunwardError::io(format!("Failed to create log appender: {}", e)))?;
    let (writer, guard) = non_blocking(appender);
    let _ = LOG_GUARD.set(guard);

    let registry = registry.with(sink!(writer, file_level, config.json_format));
    if config.console_output {
        registry
            .with(sink!(std::io::stdout, console_level, config.json_format))
            .init();
    } else {
        registry.init();
    }

    info!(
        file = %config.file,
        ?console_level,
        ?file_level,
        "Logging initialized"
    );
    Ok(())
}

fn console_only() -> bool {
    cfg!(test) || std::env::var_os("SUNWARD_DISABLE_FILE_LOG").is_some()
}

// config.file may name the log file itself or just a directory
fn log_dir(file: &str) -> &Path {
    let p = Path::new(file);
    if p.extension().is_some() {
        p.parent().unwrap_or(p)
    } else {
        p
    }
}

fn parse_level(s: &str) -> Result<Level> {
    s.parse::<Level>()
        .map_err(|_| SunwardError::config(format!("Invalid log level '{}'", s)))
}

/// Component-scoped logger; every line carries a `component` field.
#[derive(Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn info(&self, message: &str) {
        info!(component = %self.component, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        warn!(component = %self.component, "{}", message);
    }

    pub fn error(&self, message: &str) {
        error!(component = %self.component, "{}", message);
    }

    pub fn debug(&self, message: &str) {
        debug!(component = %self.component, "{}", message);
    }
}

pub fn get_logger(component: &str) -> StructuredLogger {
    StructuredLogger {
        component: component.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_parse_case_insensitively() {
        assert_eq!(parse_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_level("Error").unwrap(), Level::ERROR);
        assert!(parse_level("loud").is_err());
    }

    #[test]
    fn test_trace_is_the_most_verbose() {
        assert_eq!(std::cmp::max(Level::INFO, Level::DEBUG), Level::DEBUG);
        assert_eq!(std::cmp::max(Level::ERROR, Level::WARN), Level::WARN);
    }

    #[test]
    fn test_log_dir_strips_filename() {
        assert_eq!(log_dir("/tmp/sunward.log"), Path::new("/tmp"));
        assert_eq!(log_dir("/var/log/sunward"), Path::new("/var/log/sunward"));
    }

    #[test]
    fn test_logger_does_not_panic_before_init() {
        let logger = get_logger("test");
        logger.info("info line");
        logger.debug("debug line");
        logger.warn("warn line");
        logger.error("error line");
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        let first = init_logging(&config);
        let second = init_logging(&config);
        assert_eq!(first.is_ok(), second.is_ok());
    }
}
