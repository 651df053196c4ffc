//! The `ExecutableTask` trait: the contract every task must fulfil.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::TaskError;

/// Prefix of the environment variables exported to every task process.
pub const ENV_PREFIX: &str = "PIPELINE_RUNNER_";

/// Context handed to a task for a single attempt.
///
/// Defined here (in the tasks crate) so both the engine and individual task
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// ID of the pipeline that owns the task.
    pub pipeline_id: String,
    /// ID of the task within the pipeline.
    pub task_id: String,
    /// Human-readable run identifier, e.g. `scheduled__2025-01-01T02:00:00+00:00`.
    pub run_id: String,
    /// Logical date of the run (start of its data interval).
    pub logical_date: DateTime<Utc>,
    pub data_interval_start: DateTime<Utc>,
    pub data_interval_end: DateTime<Utc>,
    /// 1-based attempt number.
    pub try_number: u32,
    /// Total number of attempts the task is allowed.
    pub max_tries: u32,
}

impl TaskContext {
    /// Variables available to `{{ name }}` placeholders in task commands.
    pub fn template_vars(&self) -> BTreeMap<&'static str, String> {
        let ts = |t: &DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Secs, false);

        BTreeMap::from([
            ("ds", self.logical_date.format("%Y-%m-%d").to_string()),
            ("ds_nodash", self.logical_date.format("%Y%m%d").to_string()),
            ("ts", ts(&self.logical_date)),
            ("logical_date", ts(&self.logical_date)),
            ("data_interval_start", ts(&self.data_interval_start)),
            ("data_interval_end", ts(&self.data_interval_end)),
            ("run_id", self.run_id.clone()),
            ("pipeline_id", self.pipeline_id.clone()),
            ("task_id", self.task_id.clone()),
            ("try_number", self.try_number.to_string()),
        ])
    }

    /// Environment variables describing this attempt, e.g. `PIPELINE_RUNNER_TASK_ID`.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.template_vars()
            .into_iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{}", k.to_ascii_uppercase()), v))
            .collect()
    }
}

/// The core task trait.
#[async_trait]
pub trait ExecutableTask: Send + Sync {
    /// Execute one attempt of the task and return its JSON output.
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, TaskError>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn sample_ctx() -> TaskContext {
        let start = Utc.with_ymd_and_hms(2025, 3, 4, 2, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 3, 5, 2, 0, 0).unwrap();
        TaskContext {
            pipeline_id: "retail_etl_dbt_dag".into(),
            task_id: "dbt_seed".into(),
            run_id: "scheduled__2025-03-04T02:00:00+00:00".into(),
            logical_date: start,
            data_interval_start: start,
            data_interval_end: end,
            try_number: 1,
            max_tries: 2,
        }
    }

    #[test]
    fn template_vars_format_dates() {
        let vars = sample_ctx().template_vars();
        assert_eq!(vars["ds"], "2025-03-04");
        assert_eq!(vars["ds_nodash"], "20250304");
        assert_eq!(vars["ts"], "2025-03-04T02:00:00+00:00");
        assert_eq!(vars["data_interval_end"], "2025-03-05T02:00:00+00:00");
        assert_eq!(vars["try_number"], "1");
    }

    #[test]
    fn env_vars_are_prefixed_and_uppercased() {
        let env = sample_ctx().env_vars();
        assert!(env.contains(&("PIPELINE_RUNNER_TASK_ID".to_string(), "dbt_seed".to_string())));
        assert!(env.contains(&("PIPELINE_RUNNER_DS".to_string(), "2025-03-04".to_string())));
    }
}
