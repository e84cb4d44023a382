//! Configuration for the worker process
//!
//! Loads configuration from environment variables.

use anyhow::Result;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Depth of each per-account write queue; a full queue blocks the
    /// coordinator's dispatch (backpressure)
    pub per_account_queue: usize,

    /// Retry ceiling for transient provider failures
    pub max_retries: u32,

    /// First backoff step; doubles per retry
    pub base_backoff: Duration,

    /// Deadline for one provider call
    pub call_deadline: Duration,

    /// Channel renewal cadence
    pub channel_renewal_interval: Duration,

    /// Proactive token refresh cadence
    pub token_health_interval: Duration,

    /// Drift reconciliation cadence
    pub drift_interval: Duration,

    /// Hold GC cadence
    pub hold_gc_interval: Duration,

    /// Stale-session sweep cadence
    pub session_sweep_interval: Duration,

    /// Sessions older than this expire on sweep
    pub stale_session_age: chrono::Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            per_account_queue: 32,
            max_retries: 5,
            base_backoff: Duration::from_millis(500),
            call_deadline: Duration::from_secs(30),
            channel_renewal_interval: Duration::from_secs(6 * 3600),
            token_health_interval: Duration::from_secs(12 * 3600),
            drift_interval: Duration::from_secs(24 * 3600),
            hold_gc_interval: Duration::from_secs(300),
            session_sweep_interval: Duration::from_secs(3600),
            stale_session_age: chrono::Duration::hours(24),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables, defaulting anything
    /// unset.
    pub fn from_env() -> Result<Self> {
        let defaults = WorkerConfig::default();

        Ok(WorkerConfig {
            per_account_queue: env_parse("WORKER_QUEUE_DEPTH", defaults.per_account_queue)?,
            max_retries: env_parse("WORKER_MAX_RETRIES", defaults.max_retries)?,
            base_backoff: Duration::from_millis(env_parse(
                "WORKER_BASE_BACKOFF_MS",
                defaults.base_backoff.as_millis() as u64,
            )?),
            call_deadline: Duration::from_secs(env_parse(
                "WORKER_CALL_DEADLINE_SECS",
                defaults.call_deadline.as_secs(),
            )?),
            channel_renewal_interval: Duration::from_secs(env_parse(
                "WORKER_CHANNEL_RENEWAL_SECS",
                defaults.channel_renewal_interval.as_secs(),
            )?),
            token_health_interval: Duration::from_secs(env_parse(
                "WORKER_TOKEN_HEALTH_SECS",
                defaults.token_health_interval.as_secs(),
            )?),
            drift_interval: Duration::from_secs(env_parse(
                "WORKER_DRIFT_SECS",
                defaults.drift_interval.as_secs(),
            )?),
            hold_gc_interval: Duration::from_secs(env_parse(
                "WORKER_HOLD_GC_SECS",
                defaults.hold_gc_interval.as_secs(),
            )?),
            session_sweep_interval: Duration::from_secs(env_parse(
                "WORKER_SESSION_SWEEP_SECS",
                defaults.session_sweep_interval.as_secs(),
            )?),
            stale_session_age: chrono::Duration::hours(env_parse(
                "WORKER_STALE_SESSION_HOURS",
                24,
            )?),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} must be a valid value: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = WorkerConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.channel_renewal_interval.as_secs(), 6 * 3600);
        assert_eq!(config.drift_interval.as_secs(), 24 * 3600);
        assert_eq!(config.stale_session_age, chrono::Duration::hours(24));
    }
}
