//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// An XL task times out after 100 hours; past that every task is terminal.
pub const LONGEST_TASK_TIMEOUT: Duration = Duration::from_secs(100 * 60 * 60);

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of routines draining the task update queue.
    pub update_pool_size: usize,
    /// How often the dispatcher tops up its pool of routines.
    pub consume_interval: Duration,
    /// Upper bound on a task's lifetime; lock and queue entries expire after it.
    pub longest_task_timeout: Duration,
    /// How often expired lock and queue entries are swept.
    pub lock_sweep_interval: Duration,
    /// Attempts per candidate task when admission hits a conflicting write.
    pub admission_max_attempts: u32,
    /// Period of the chain-state detectors.
    pub detector_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            update_pool_size: default_pool_size(),
            consume_interval: Duration::from_secs(1),
            longest_task_timeout: LONGEST_TASK_TIMEOUT,
            lock_sweep_interval: Duration::from_secs(60),
            admission_max_attempts: 5,
            detector_interval: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Build from `WORKERPOOL_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            update_pool_size: env_parse("WORKERPOOL_UPDATE_POOL_SIZE")?
                .unwrap_or(defaults.update_pool_size),
            consume_interval: env_parse("WORKERPOOL_CONSUME_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.consume_interval),
            longest_task_timeout: env_parse::<u64>("WORKERPOOL_LONGEST_TASK_TIMEOUT_HOURS")?
                .map(|h| Duration::from_secs(h * 60 * 60))
                .unwrap_or(defaults.longest_task_timeout),
            lock_sweep_interval: env_parse("WORKERPOOL_LOCK_SWEEP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_sweep_interval),
            admission_max_attempts: env_parse("WORKERPOOL_ADMISSION_MAX_ATTEMPTS")?
                .unwrap_or(defaults.admission_max_attempts),
            detector_interval: env_parse("WORKERPOOL_DETECTOR_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.detector_interval),
        }
        .validated()?)
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.update_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WORKERPOOL_UPDATE_POOL_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.admission_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "WORKERPOOL_ADMISSION_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(self)
    }
}

/// Two routines per logical core.
fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}
