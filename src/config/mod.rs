//! Handler configuration.
//!
//! [`SpongeConfig`] carries the poll cadence, the expiry grace period and the
//! sweep cadence. It can be built in code (all fields are public), read from
//! `SPONGE_*` environment variables with [`SpongeConfig::from_env`], or
//! deserialized with serde (durations are integer milliseconds):
//!
//! ```
//! use std::time::Duration;
//! use sponge::config::SpongeConfig;
//!
//! let config: SpongeConfig =
//!     serde_json::from_str(r#"{ "poll_interval": 250, "poll_attempts": 4 }"#).unwrap();
//! assert_eq!(config.poll_interval, Duration::from_millis(250));
//! assert_eq!(config.poll_attempts, 4);
//! assert_eq!(config.expiry_policy().threshold(), Duration::from_secs(1));
//! ```

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::ExpiryPolicy;

/// Default time between poll attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of poll attempts per session.
pub const DEFAULT_POLL_ATTEMPTS: u32 = 10;

/// Default grace period added to the poll window before eviction.
pub const DEFAULT_EXTRA_EXPIRATION: Duration = Duration::ZERO;

/// Default time between expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidVar {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// What a poll session does when a poll attempt's fetch fails.
///
/// Either way the failed attempt counts against the attempt budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollErrorPolicy {
    /// Log the failure and carry on with the next attempt.
    #[default]
    Skip,
    /// End the session; the cached entry stays until it expires.
    Abort,
}

impl FromStr for PollErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "abort" => Ok(Self::Abort),
            other => Err(format!("expected `skip` or `abort`, got `{other}`")),
        }
    }
}

/// Configuration accepted by [`SpongeHandler`](crate::handler::SpongeHandler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpongeConfig {
    /// Time between poll attempts; the first attempt happens one interval
    /// after the cold fetch.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Maximum poll attempts per session. Zero disables polling.
    pub poll_attempts: u32,

    /// Grace period on top of `poll_interval × poll_attempts` before an
    /// entry is evicted.
    #[serde(with = "duration_millis")]
    pub extra_expiration: Duration,

    /// Time between expiry sweeps.
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,

    /// Handling of failed poll attempts.
    pub poll_error_policy: PollErrorPolicy,
}

impl Default for SpongeConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            extra_expiration: DEFAULT_EXTRA_EXPIRATION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            poll_error_policy: PollErrorPolicy::default(),
        }
    }
}

impl SpongeConfig {
    /// Reads configuration from the process environment.
    ///
    /// # Environment Variables
    /// - `SPONGE_POLL_INTERVAL_MS` (default: 1000)
    /// - `SPONGE_POLL_ATTEMPTS` (default: 10)
    /// - `SPONGE_EXTRA_EXPIRATION_MS` (default: 0)
    /// - `SPONGE_SWEEP_INTERVAL_MS` (default: 1000)
    /// - `SPONGE_POLL_ERROR_POLICY`: `skip` or `abort` (default: skip)
    ///
    /// Unset variables fall back to their defaults; set but unparsable ones
    /// are an error. The result is validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), with variables looked up through
    /// `lookup`.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            poll_interval: parse_var(&lookup, "SPONGE_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            poll_attempts: parse_var(&lookup, "SPONGE_POLL_ATTEMPTS")?
                .unwrap_or(defaults.poll_attempts),
            extra_expiration: parse_var(&lookup, "SPONGE_EXTRA_EXPIRATION_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.extra_expiration),
            sweep_interval: parse_var(&lookup, "SPONGE_SWEEP_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
            poll_error_policy: parse_var(&lookup, "SPONGE_POLL_ERROR_POLICY")?
                .unwrap_or(defaults.poll_error_policy),
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks that the cadences are usable as timer periods.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "poll_interval",
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                field: "sweep_interval",
            });
        }
        Ok(())
    }

    /// The expiration rule these settings imply.
    pub fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::new(self.poll_interval, self.poll_attempts, self.extra_expiration)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    let parsed = value.trim().parse::<T>();
    parsed.map(Some).map_err(|e| ConfigError::InvalidVar {
        var,
        reason: e.to_string(),
        value,
    })
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
