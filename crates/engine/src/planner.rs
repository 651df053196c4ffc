//! Decides which data interval a scheduled pipeline should run next.
//!
//! A scheduled run covers the half-open interval `[start, end)` between two
//! consecutive fire times. It is due once `end` has passed, and its logical
//! date is `start`: the nightly run that fires at 02:00 on the 2nd processes
//! the day that began at 02:00 on the 1st.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::Pipeline;

/// The span of time a run is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DataInterval {
    /// Logical date of a run covering this interval.
    pub fn logical_date(&self) -> DateTime<Utc> {
        self.start
    }

    /// Whether the interval has closed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.end <= now
    }
}

/// `scheduled__2025-01-01T02:00:00+00:00`
pub fn scheduled_run_id(logical_date: DateTime<Utc>) -> String {
    format!("scheduled__{}", logical_date.to_rfc3339_opts(SecondsFormat::Secs, false))
}

/// `manual__2025-01-01T02:00:00+00:00`
pub fn manual_run_id(logical_date: DateTime<Utc>) -> String {
    format!("manual__{}", logical_date.to_rfc3339_opts(SecondsFormat::Secs, false))
}

/// Plan the interval the next scheduled run should cover.
///
/// `last_logical_date` is the logical date of the most recent scheduled run,
/// if any. Returns `None` for unscheduled pipelines, once `end_date` has been
/// passed, or when the schedule never fires again.
pub fn next_data_interval(
    pipeline: &Pipeline,
    last_logical_date: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DataInterval> {
    let schedule = pipeline.schedule.as_ref()?;

    // First fire time at or after start_date.
    let earliest = schedule.prev_at_or_before(pipeline.start_date)
        .filter(|t| *t == pipeline.start_date)
        .or_else(|| schedule.next_after(pipeline.start_date))?;

    let mut start = match last_logical_date {
        Some(last) => schedule.next_after(last)?.max(earliest),
        None => earliest,
    };

    if !pipeline.catchup {
        // Skip ahead to the most recent interval that has already closed.
        if let Some(latest_end) = schedule.prev_at_or_before(now) {
            if let Some(latest_start) = schedule.prev_before(latest_end) {
                if latest_start > start {
                    start = latest_start;
                }
            }
        }
    }

    if let Some(end_date) = pipeline.end_date {
        if start > end_date {
            return None;
        }
    }

    let end = schedule.next_after(start)?;
    Some(DataInterval { start, end })
}
