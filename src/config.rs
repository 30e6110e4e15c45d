//! Server configuration loaded from environment variables.
//!
//! All settings come from environment variables (or a `.env` file via
//! `dotenvy`). [`ReplConfig::default`] gives the same defaults without
//! touching the environment, which is what tests use.

use std::net::IpAddr;
use std::time::Duration;

use crate::error::ReplError;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 5051;

/// Log output format for the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Top-level server configuration.
///
/// Loaded once at startup via [`ReplConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ReplConfig {
    /// Address the listener binds to.
    pub host: IpAddr,

    /// Port used by [`crate::server::ReplServer::start_default`].
    pub port: u16,

    /// Longest time a unit may wait in the engine queue before it is failed
    /// with a timeout instead of being run.
    pub eval_timeout: Duration,

    /// Engine loop iteration limit. Stops runaway `while (true)` scripts.
    pub loop_iteration_limit: u64,

    /// Engine recursion limit.
    pub recursion_limit: usize,

    /// Longest accepted inbound line, in bytes.
    pub max_line_bytes: usize,

    /// Greeting written to every new connection. Empty disables it.
    pub banner: String,

    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([127, 0, 0, 1]),
            port: DEFAULT_PORT,
            eval_timeout: Duration::from_secs(10),
            loop_iteration_limit: 10_000_000,
            recursion_limit: 512,
            max_line_bytes: 1024 * 1024,
            banner: "Welcome to the REPL server".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl ReplConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to the [`Default`] values when a variable is not set.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::InvalidConfig`] if `REPL_HOST` or `REPL_PORT`
    /// is set but cannot be parsed, or if the evaluation timeout is zero.
    pub fn from_env() -> Result<Self, ReplError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let host = match std::env::var("REPL_HOST") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| ReplError::InvalidConfig(format!("REPL_HOST={raw}: {e}")))?,
            Err(_) => defaults.host,
        };

        let port = match std::env::var("REPL_PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| ReplError::InvalidConfig(format!("REPL_PORT={raw}: {e}")))?,
            Err(_) => defaults.port,
        };

        let eval_timeout = Duration::from_secs(parse_env(
            "REPL_EVAL_TIMEOUT_SECS",
            defaults.eval_timeout.as_secs(),
        ));
        let loop_iteration_limit =
            parse_env("REPL_LOOP_ITERATION_LIMIT", defaults.loop_iteration_limit);
        let recursion_limit = parse_env("REPL_RECURSION_LIMIT", defaults.recursion_limit);
        let max_line_bytes = parse_env("REPL_MAX_LINE_BYTES", defaults.max_line_bytes);
        let banner = std::env::var("REPL_BANNER").unwrap_or(defaults.banner);
        let log_format = match std::env::var("REPL_LOG_FORMAT").ok().as_deref() {
            Some("json") | Some("JSON") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let config = Self {
            host,
            port,
            eval_timeout,
            loop_iteration_limit,
            recursion_limit,
            max_line_bytes,
            banner,
            log_format,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks values that have no sensible fallback.
    ///
    /// # Errors
    ///
    /// Returns [`ReplError::InvalidConfig`] for a zero timeout or a zero
    /// line limit.
    pub fn validate(&self) -> Result<(), ReplError> {
        if self.eval_timeout.is_zero() {
            return Err(ReplError::InvalidConfig(
                "evaluation timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_line_bytes == 0 {
            return Err(ReplError::InvalidConfig(
                "max line length must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the evaluation timeout.
    #[must_use]
    pub fn with_eval_timeout(mut self, timeout: Duration) -> Self {
        self.eval_timeout = timeout;
        self
    }

    /// Sets the connection banner.
    #[must_use]
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = banner.into();
        self
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ReplConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.eval_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = ReplConfig::default().with_eval_timeout(Duration::ZERO);
        let Err(err) = config.validate() else {
            panic!("zero timeout accepted");
        };
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn zero_line_limit_is_rejected() {
        let config = ReplConfig {
            max_line_bytes: 0,
            ..ReplConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_env_falls_back_on_missing() {
        assert_eq!(parse_env("REPL_TEST_SURELY_UNSET_VARIABLE", 42u32), 42);
    }

    #[test]
    fn builder_sets_banner() {
        let config = ReplConfig::default().with_banner("");
        assert!(config.banner.is_empty());
    }
}
