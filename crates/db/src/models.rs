//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models: they carry no domain behaviour.
//! Domain types live in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// pipeline_runs
// ---------------------------------------------------------------------------

/// Possible states of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Success,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for RunState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed"  => Ok(Self::Failed),
            other     => Err(format!("unknown run state: {other}")),
        }
    }
}

/// What created a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Scheduled,
    Manual,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for RunType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "manual"    => Ok(Self::Manual),
            other       => Err(format!("unknown run type: {other}")),
        }
    }
}

/// Values needed to open a new run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub pipeline_id: String,
    pub run_id: String,
    pub run_type: RunType,
    pub logical_date: DateTime<Utc>,
    pub data_interval_start: DateTime<Utc>,
    pub data_interval_end: DateTime<Utc>,
}

/// A persisted pipeline run row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PipelineRunRow {
    pub id: Uuid,
    pub pipeline_id: String,
    pub run_id: String,
    pub run_type: String,
    pub state: String,
    pub logical_date: DateTime<Utc>,
    pub data_interval_start: DateTime<Utc>,
    pub data_interval_end: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// task_instances
// ---------------------------------------------------------------------------

/// Possible states of a task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Running,
    Success,
    Failed,
    UpForRetry,
    Skipped,
    UpstreamFailed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running        => "running",
            Self::Success        => "success",
            Self::Failed         => "failed",
            Self::UpForRetry     => "up_for_retry",
            Self::Skipped        => "skipped",
            Self::UpstreamFailed => "upstream_failed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running"         => Ok(Self::Running),
            "success"         => Ok(Self::Success),
            "failed"          => Ok(Self::Failed),
            "up_for_retry"    => Ok(Self::UpForRetry),
            "skipped"         => Ok(Self::Skipped),
            "upstream_failed" => Ok(Self::UpstreamFailed),
            other             => Err(format!("unknown task state: {other}")),
        }
    }
}

/// A persisted task attempt row.
///
/// Tasks that never ran (`skipped`, `upstream_failed`) have `try_number = 0`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskInstanceRow {
    pub id: Uuid,
    pub run_pk: Uuid,
    pub task_id: String,
    pub try_number: i64,
    pub state: String,
    pub exit_code: Option<i64>,
    /// JSON produced by the task on success.
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
