//! Scheduler timing configuration.
//!
//! Every value is a positive integer number of milliseconds. Defaults match a
//! production deployment; [`SchedulerConfig::from_env`] overrides them from
//! the process environment.

use std::time::Duration;

use crate::error::{Error, Result};

const ENV_RECONCILIATION_INITIAL_DELAY_MS: &str = "KEEL_RECONCILIATION_INITIAL_DELAY_MS";
const ENV_RECONCILIATION_INTERVAL_MS: &str = "KEEL_RECONCILIATION_INTERVAL_MS";
const ENV_SCALE_APPS_INITIAL_DELAY_MS: &str = "KEEL_SCALE_APPS_INITIAL_DELAY_MS";
const ENV_SCALE_APPS_INTERVAL_MS: &str = "KEEL_SCALE_APPS_INTERVAL_MS";
const ENV_MAX_ACTOR_STARTUP_TIME_MS: &str = "KEEL_MAX_ACTOR_STARTUP_TIME_MS";
const ENV_ON_ELECTED_PREPARE_TIMEOUT_MS: &str = "KEEL_ON_ELECTED_PREPARE_TIMEOUT_MS";
const ENV_ZK_TIMEOUT_MS: &str = "KEEL_ZK_TIMEOUT_MS";

const DEFAULT_RECONCILIATION_INITIAL_DELAY_MS: u64 = 15_000;
const DEFAULT_RECONCILIATION_INTERVAL_MS: u64 = 600_000;
const DEFAULT_SCALE_APPS_INITIAL_DELAY_MS: u64 = 15_000;
const DEFAULT_SCALE_APPS_INTERVAL_MS: u64 = 300_000;
const DEFAULT_MAX_ACTOR_STARTUP_TIME_MS: u64 = 10_000;
const DEFAULT_ON_ELECTED_PREPARE_TIMEOUT_MS: u64 = 180_000;
const DEFAULT_ZK_TIMEOUT_MS: u64 = 10_000;

/// Timing configuration for the leadership lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Delay before the first task reconciliation of a term.
    pub reconciliation_initial_delay: Duration,
    /// Interval between task reconciliations.
    pub reconciliation_interval: Duration,
    /// Delay before the first scale check of a term.
    pub scale_apps_initial_delay: Duration,
    /// Interval between scale checks.
    pub scale_apps_interval: Duration,
    /// Upper bound for loading in-memory state when a term starts.
    pub max_actor_startup_time: Duration,
    /// Upper bound for each pre-start and post-stop callback.
    pub on_elected_prepare_timeout: Duration,
    /// Upper bound for coordination-store round trips, including migration.
    pub zk_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconciliation_initial_delay: Duration::from_millis(
                DEFAULT_RECONCILIATION_INITIAL_DELAY_MS,
            ),
            reconciliation_interval: Duration::from_millis(DEFAULT_RECONCILIATION_INTERVAL_MS),
            scale_apps_initial_delay: Duration::from_millis(DEFAULT_SCALE_APPS_INITIAL_DELAY_MS),
            scale_apps_interval: Duration::from_millis(DEFAULT_SCALE_APPS_INTERVAL_MS),
            max_actor_startup_time: Duration::from_millis(DEFAULT_MAX_ACTOR_STARTUP_TIME_MS),
            on_elected_prepare_timeout: Duration::from_millis(
                DEFAULT_ON_ELECTED_PREPARE_TIMEOUT_MS,
            ),
            zk_timeout: Duration::from_millis(DEFAULT_ZK_TIMEOUT_MS),
        }
    }
}

impl SchedulerConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a provided value is not a positive
    /// integer.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a provided value is not a positive
    /// integer.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |key: &str, default: u64| {
            parse_positive_u64_env(&get_env, key, default).map(Duration::from_millis)
        };

        Ok(Self {
            reconciliation_initial_delay: millis(
                ENV_RECONCILIATION_INITIAL_DELAY_MS,
                DEFAULT_RECONCILIATION_INITIAL_DELAY_MS,
            )?,
            reconciliation_interval: millis(
                ENV_RECONCILIATION_INTERVAL_MS,
                DEFAULT_RECONCILIATION_INTERVAL_MS,
            )?,
            scale_apps_initial_delay: millis(
                ENV_SCALE_APPS_INITIAL_DELAY_MS,
                DEFAULT_SCALE_APPS_INITIAL_DELAY_MS,
            )?,
            scale_apps_interval: millis(ENV_SCALE_APPS_INTERVAL_MS, DEFAULT_SCALE_APPS_INTERVAL_MS)?,
            max_actor_startup_time: millis(
                ENV_MAX_ACTOR_STARTUP_TIME_MS,
                DEFAULT_MAX_ACTOR_STARTUP_TIME_MS,
            )?,
            on_elected_prepare_timeout: millis(
                ENV_ON_ELECTED_PREPARE_TIMEOUT_MS,
                DEFAULT_ON_ELECTED_PREPARE_TIMEOUT_MS,
            )?,
            zk_timeout: millis(ENV_ZK_TIMEOUT_MS, DEFAULT_ZK_TIMEOUT_MS)?,
        })
    }
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };
    let value: u64 = raw.trim().parse().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if value == 0 {
        return Err(Error::configuration(format!("{key} must be greater than zero")));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_env() {
        let config = SchedulerConfig::from_env_with(env(&[])).unwrap();
        assert_eq!(config, SchedulerConfig::default());
        assert_eq!(config.reconciliation_interval, Duration::from_secs(600));
        assert_eq!(config.scale_apps_interval, Duration::from_secs(300));
    }

    #[test]
    fn env_overrides_defaults() {
        let config = SchedulerConfig::from_env_with(env(&[
            (ENV_RECONCILIATION_INITIAL_DELAY_MS, "100"),
            (ENV_SCALE_APPS_INTERVAL_MS, " 2500 "),
            (ENV_ZK_TIMEOUT_MS, "50"),
        ]))
        .unwrap();
        assert_eq!(config.reconciliation_initial_delay, Duration::from_millis(100));
        assert_eq!(config.scale_apps_interval, Duration::from_millis(2500));
        assert_eq!(config.zk_timeout, Duration::from_millis(50));
        assert_eq!(
            config.on_elected_prepare_timeout,
            SchedulerConfig::default().on_elected_prepare_timeout
        );
    }

    #[test]
    fn rejects_zero_and_garbage() {
        let zero = SchedulerConfig::from_env_with(env(&[(ENV_ZK_TIMEOUT_MS, "0")]));
        assert!(matches!(zero, Err(Error::Configuration { .. })));

        let garbage =
            SchedulerConfig::from_env_with(env(&[(ENV_SCALE_APPS_INTERVAL_MS, "five")]));
        let err = garbage.unwrap_err();
        assert!(err.to_string().contains(ENV_SCALE_APPS_INTERVAL_MS));
    }
}
