use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sizing of a worker pool.
///
/// Every pool in the hierarchy uses the same limit; a sub-pool spawned by a
/// worker inherits it from the scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of workers a single pool will spawn. Never below one.
    pub worker_limit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_limit: default_worker_limit(),
        }
    }
}

impl PoolConfig {
    pub fn with_worker_limit(mut self, worker_limit: usize) -> Self {
        self.worker_limit = worker_limit.max(1);
        self
    }

    /// Limit actually enforced by the placement policy.
    pub fn effective_limit(&self) -> usize {
        self.worker_limit.max(1)
    }
}

fn default_worker_limit() -> usize {
    num_cpus::get().max(1)
}

/// Result polling schedule: linear backoff inside a fixed budget.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Total budget measured from the job's start time.
    pub timeout_secs: u64,
    /// Backoff step; attempt `k` waits `k * increment` before fetching.
    pub increment_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            increment_secs: 5,
        }
    }
}

impl PollConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn increment(&self) -> Duration {
        Duration::from_secs(self.increment_secs)
    }
}

/// Settings for the host-facing dispatcher.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Capacity of the broadcast channel carrying dispatcher events.
    pub event_capacity: usize,
    /// Store prefix under which inline scripts are uploaded.
    pub script_prefix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            script_prefix: "/job_scripts".to_string(),
        }
    }
}

/// Top-level configuration handed to the scheduler builder.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub pool: PoolConfig,
    pub poll: PollConfig,
    pub dispatcher: DispatcherConfig,
}

impl SchedulerConfig {
    /// Build a configuration from `TRIBUTARY_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SchedulerConfig::from_env`] with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|value| value.trim().parse::<u64>().ok());

        Self {
            pool: PoolConfig::default().with_worker_limit(
                parsed("TRIBUTARY_WORKER_LIMIT")
                    .map(|value| value as usize)
                    .unwrap_or(defaults.pool.worker_limit),
            ),
            poll: PollConfig {
                timeout_secs: parsed("TRIBUTARY_POLL_TIMEOUT_SECS")
                    .unwrap_or(defaults.poll.timeout_secs),
                increment_secs: parsed("TRIBUTARY_POLL_INCREMENT_SECS")
                    .unwrap_or(defaults.poll.increment_secs),
            },
            dispatcher: DispatcherConfig {
                event_capacity: parsed("TRIBUTARY_EVENT_CAPACITY")
                    .map(|value| (value as usize).max(1))
                    .unwrap_or(defaults.dispatcher.event_capacity),
                script_prefix: lookup("TRIBUTARY_SCRIPT_PREFIX")
                    .map(|prefix| prefix.trim_end_matches('/').to_string())
                    .filter(|prefix| !prefix.is_empty())
                    .unwrap_or(defaults.dispatcher.script_prefix),
            },
        }
    }
}
