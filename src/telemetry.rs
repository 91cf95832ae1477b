//! Shared logging bootstrap for control-plane binaries.

use crate::{Error, Result};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

pub fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}

/// Initialize the process-wide tracing subscriber.
pub fn init_logging(log_level: &str) -> Result<()> {
    let level = parse_log_level(log_level)?;
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .try_init()
        .map_err(|e| Error::Config(format!("failed to initialize logging subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_level_accepts_known_levels() {
        assert_eq!(parse_log_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level(" warn ").unwrap(), Level::WARN);
    }

    #[test]
    fn parse_log_level_rejects_unknown_levels() {
        let err = parse_log_level("loud").unwrap_err();
        assert!(format!("{err}").contains("invalid log level"));
    }
}
