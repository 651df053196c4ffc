//! Core domain models for the pipeline engine.
//!
//! These types are the source of truth for what a pipeline looks like in
//! memory.  They are loaded from JSON definition files:
//!
//! ```json
//! {
//!   "id": "retail_etl_dbt_dag",
//!   "schedule": "0 2 * * *",
//!   "start_date": "2025-01-01T00:00:00Z",
//!   "catchup": false,
//!   "default_args": { "owner": "retail_de", "retries": 1, "retry_delay": "5m" },
//!   "tasks": [{ "id": "dbt_seed", "command": "dbt seed", "cwd": "/opt/dbt_project" }],
//!   "edges": []
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cron::CronSchedule;
use crate::EngineError;

/// `serde(with = ...)` adapters for humantime strings such as `"5m"`.
mod humantime_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => super::serialize(d, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

// ---------------------------------------------------------------------------
// DefaultArgs
// ---------------------------------------------------------------------------

fn default_retry_delay() -> Duration {
    Duration::from_secs(300)
}

/// Settings inherited by every task unless the task overrides them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefaultArgs {
    #[serde(default)]
    pub owner: Option<String>,
    /// Extra attempts after the first failure.
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    #[serde(default)]
    pub retry_exponential_backoff: bool,
    #[serde(default, with = "humantime_serde::option")]
    pub max_retry_delay: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub execution_timeout: Option<Duration>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for DefaultArgs {
    fn default() -> Self {
        Self {
            owner: None,
            retries: 0,
            retry_delay: default_retry_delay(),
            retry_exponential_backoff: false,
            max_retry_delay: None,
            execution_timeout: None,
            env: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskDefinition
// ---------------------------------------------------------------------------

/// A single step in the pipeline graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDefinition {
    /// Unique identifier within this pipeline (referenced by edges).
    pub id: String,
    /// Shell command line, run with `bash -c`.
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Merged over `default_args.env`.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default, with = "humantime_serde::option")]
    pub retry_delay: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub execution_timeout: Option<Duration>,
    /// Exit code that marks the task as skipped. Defaults to 99.
    #[serde(default)]
    pub skip_exit_code: Option<i32>,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            cwd: None,
            env: BTreeMap::new(),
            retries: None,
            retry_delay: None,
            execution_timeout: None,
            skip_exit_code: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// Directed edge: `to` runs only after `from` succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Resolved retry settings for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub retry_delay: Duration,
    pub exponential_backoff: bool,
    pub max_retry_delay: Option<Duration>,
}

impl RetryPolicy {
    /// Total attempts allowed.
    pub fn max_tries(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = if self.exponential_backoff {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
            self.retry_delay.saturating_mul(factor)
        } else {
            self.retry_delay
        };

        match self.max_retry_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

fn default_owner() -> String {
    "pipeline-runner".into()
}

/// A complete pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pipeline {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Cron expression; `null` means the pipeline only runs when triggered.
    #[serde(default)]
    pub schedule: Option<CronSchedule>,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// Run every missed interval instead of only the latest one.
    #[serde(default)]
    pub catchup: bool,
    #[serde(default)]
    pub default_args: DefaultArgs,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Pipeline {
    /// Convenience constructor for testing: tasks chained in the given order.
    pub fn chain(id: impl Into<String>, tasks: Vec<TaskDefinition>) -> Self {
        let edges = tasks
            .windows(2)
            .map(|w| Edge { from: w[0].id.clone(), to: w[1].id.clone() })
            .collect();

        Self {
            id: id.into(),
            description: None,
            schedule: None,
            start_date: DateTime::<Utc>::default(),
            end_date: None,
            catchup: false,
            default_args: DefaultArgs::default(),
            tasks,
            edges,
        }
    }

    /// Parse a JSON definition.
    pub fn from_json(raw: &str) -> Result<Self, EngineError> {
        serde_json::from_str(raw).map_err(|e| EngineError::InvalidDefinition(e.to_string()))
    }

    /// Read and parse a JSON definition file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| EngineError::ReadDefinition {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Owner shown in logs and history.
    pub fn owner(&self) -> String {
        self.default_args.owner.clone().unwrap_or_else(default_owner)
    }

    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// IDs of the tasks that must succeed before `id` may run.
    pub fn upstream_of(&self, id: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == id)
            .map(|e| e.from.as_str())
            .collect()
    }

    /// Retry settings for `task`, its own values taking precedence.
    pub fn retry_policy_for(&self, task: &TaskDefinition) -> RetryPolicy {
        RetryPolicy {
            retries: task.retries.unwrap_or(self.default_args.retries),
            retry_delay: task.retry_delay.unwrap_or(self.default_args.retry_delay),
            exponential_backoff: self.default_args.retry_exponential_backoff,
            max_retry_delay: self.default_args.max_retry_delay,
        }
    }

    /// Environment for `task`: `default_args.env` overlaid with the task's own.
    pub fn env_for(&self, task: &TaskDefinition) -> BTreeMap<String, String> {
        let mut env = self.default_args.env.clone();
        env.extend(task.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    pub fn execution_timeout_for(&self, task: &TaskDefinition) -> Option<Duration> {
        task.execution_timeout.or(self.default_args.execution_timeout)
    }
}
