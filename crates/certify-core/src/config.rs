//! Grading configuration loaded from the environment.
//!
//! | Variable                      | Default    |
//! |-------------------------------|------------|
//! | `CERTIFY_PASS_THRESHOLD`      | `70`       |
//! | `CERTIFY_THROTTLE_MS`         | `1500`     |
//! | `CERTIFY_ORACLE_TIMEOUT_SECS` | `60`       |
//! | `CERTIFY_ORACLE_URL`          | unset      |
//! | `CERTIFY_ORACLE_MODE`         | `evaluate` |

use std::time::Duration;

use certify_state::{DEFAULT_PASS_THRESHOLD, SCORE_MAX};

use crate::grading::regrade::RegradeConfig;
use crate::oracle::OracleMode;

pub const ENV_PASS_THRESHOLD: &str = "CERTIFY_PASS_THRESHOLD";
pub const ENV_THROTTLE_MS: &str = "CERTIFY_THROTTLE_MS";
pub const ENV_ORACLE_TIMEOUT_SECS: &str = "CERTIFY_ORACLE_TIMEOUT_SECS";
pub const ENV_ORACLE_URL: &str = "CERTIFY_ORACLE_URL";
pub const ENV_ORACLE_MODE: &str = "CERTIFY_ORACLE_MODE";

/// Pause between consecutive oracle calls during a regrade.
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(1500);
/// Upper bound on a single oracle call.
pub const DEFAULT_ORACLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings shared by the election protocol, the orchestrator and the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradingConfig {
    pub pass_threshold: u8,
    pub throttle: Duration,
    pub oracle_timeout: Duration,
    pub oracle_url: Option<String>,
    pub oracle_mode: OracleMode,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            throttle: DEFAULT_THROTTLE,
            oracle_timeout: DEFAULT_ORACLE_TIMEOUT,
            oracle_url: None,
            oracle_mode: OracleMode::Evaluate,
        }
    }
}

impl GradingConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset or blank keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(raw) = get(ENV_PASS_THRESHOLD) {
            let value: u8 = parse(ENV_PASS_THRESHOLD, &raw)?;
            if value > SCORE_MAX {
                return Err(invalid(ENV_PASS_THRESHOLD, &raw, "must be within 0..=100"));
            }
            config.pass_threshold = value;
        }
        if let Some(raw) = get(ENV_THROTTLE_MS) {
            config.throttle = Duration::from_millis(parse(ENV_THROTTLE_MS, &raw)?);
        }
        if let Some(raw) = get(ENV_ORACLE_TIMEOUT_SECS) {
            let secs: u64 = parse(ENV_ORACLE_TIMEOUT_SECS, &raw)?;
            if secs == 0 {
                return Err(invalid(ENV_ORACLE_TIMEOUT_SECS, &raw, "must be positive"));
            }
            config.oracle_timeout = Duration::from_secs(secs);
        }
        if let Some(raw) = get(ENV_ORACLE_URL) {
            config.oracle_url = Some(raw.trim().trim_end_matches('/').to_string());
        }
        if let Some(raw) = get(ENV_ORACLE_MODE) {
            config.oracle_mode = raw
                .parse()
                .map_err(|reason: String| invalid(ENV_ORACLE_MODE, &raw, &reason))?;
        }

        Ok(config)
    }

    /// Orchestrator settings derived from this configuration.
    pub fn regrade(&self) -> RegradeConfig {
        RegradeConfig {
            mode: self.oracle_mode,
            throttle: self.throttle,
            oracle_timeout: self.oracle_timeout,
        }
    }
}

fn parse<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(var, raw, &e.to_string()))
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
