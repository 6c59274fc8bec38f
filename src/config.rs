//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `BELAY_INSTANCE_NAME`: Name this worker instance reports in started-task
//!   records and election members (default: `<hostname>-<pid>`)
//! - `BELAY_QUEUE_POLL_INTERVAL_MS`: Consumer fallback poll interval when no
//!   queue watch fires (default: 500)
//! - `BELAY_SCHED_SWEEP_INTERVAL_MS`: Scheduler safety-net resync interval
//!   (default: 5000)

use std::{env, time::Duration};

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    /// Name this instance writes into started-task and election records.
    pub instance_name: String,

    /// Consumer fallback poll interval.
    pub queue_poll_interval: Duration,

    /// Scheduler full-resync sweep interval.
    pub sched_sweep_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let instance_name = env::var("BELAY_INSTANCE_NAME").unwrap_or_else(|_| default_instance_name());

        let queue_poll_interval_ms = env::var("BELAY_QUEUE_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(500);

        let sched_sweep_interval_ms = env::var("BELAY_SCHED_SWEEP_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);

        Ok(Self {
            instance_name,
            queue_poll_interval: Duration::from_millis(queue_poll_interval_ms),
            sched_sweep_interval: Duration::from_millis(sched_sweep_interval_ms),
        })
    }

    /// Configuration with defaults and an explicit instance name.
    pub fn for_instance(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            queue_poll_interval: Duration::from_millis(500),
            sched_sweep_interval: Duration::from_millis(5000),
        }
    }

    /// Short intervals for tests so scenarios converge quickly.
    pub fn test_config(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            queue_poll_interval: Duration::from_millis(25),
            sched_sweep_interval: Duration::from_millis(100),
        }
    }
}

fn default_instance_name() -> String {
    let host = env::var("HOSTNAME").unwrap_or_else(|_| "belay".to_string());
    format!("{host}-{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_instance_uses_defaults() {
        let config = Config::for_instance("worker-1");
        assert_eq!(config.instance_name, "worker-1");
        assert_eq!(config.queue_poll_interval, Duration::from_millis(500));
        assert_eq!(config.sched_sweep_interval, Duration::from_millis(5000));
    }

    #[test]
    fn default_instance_name_is_nonempty() {
        assert!(!default_instance_name().is_empty());
    }
}
