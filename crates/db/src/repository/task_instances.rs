//! Task attempt repository functions.

use chrono::Utc;
use uuid::Uuid;

use crate::{
    DbError, DbPool,
    models::{TaskInstanceRow, TaskState},
};

const TASK_COLUMNS: &str =
    "id, run_pk, task_id, try_number, state, exit_code, output, error, started_at, finished_at";

/// How an attempt ended.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub state: TaskState,
    pub exit_code: Option<i64>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Insert a `running` attempt row.
pub async fn start_task_attempt(
    pool: &DbPool,
    run_pk: Uuid,
    task_id: &str,
    try_number: u32,
) -> Result<TaskInstanceRow, DbError> {
    let sql = format!(
        r#"
        INSERT INTO task_instances (id, run_pk, task_id, try_number, state, started_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        RETURNING {TASK_COLUMNS}
        "#
    );

    let row = sqlx::query_as::<_, TaskInstanceRow>(&sql)
        .bind(Uuid::new_v4())
        .bind(run_pk)
        .bind(task_id)
        .bind(i64::from(try_number))
        .bind(TaskState::Running.as_str())
        .bind(Utc::now())
        .fetch_one(pool)
        .await?;

    Ok(row)
}

/// Close an attempt opened by [`start_task_attempt`].
pub async fn finish_task_attempt(
    pool: &DbPool,
    id: Uuid,
    outcome: &AttemptOutcome,
) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE task_instances
        SET state = ?1, exit_code = ?2, output = ?3, error = ?4, finished_at = ?5
        WHERE id = ?6
        "#,
    )
    .bind(outcome.state.as_str())
    .bind(outcome.exit_code)
    .bind(outcome.output.as_deref())
    .bind(outcome.error.as_deref())
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}

/// Record a task that was never attempted (`skipped`, `upstream_failed`).
pub async fn record_task_state(
    pool: &DbPool,
    run_pk: Uuid,
    task_id: &str,
    state: TaskState,
    error: Option<&str>,
) -> Result<TaskInstanceRow, DbError> {
    let now = Utc::now();
    let sql = format!(
        r#"
        INSERT INTO task_instances (id, run_pk, task_id, try_number, state, error, started_at, finished_at)
        VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?6)
        RETURNING {TASK_COLUMNS}
        "#
    );

    let row = sqlx::query_as::<_, TaskInstanceRow>(&sql)
        .bind(Uuid::new_v4())
        .bind(run_pk)
        .bind(task_id)
        .bind(state.as_str())
        .bind(error)
        .bind(now)
        .fetch_one(pool)
        .await?;

    Ok(row)
}

/// Every attempt of a run, in the order they were recorded.
pub async fn list_task_instances(
    pool: &DbPool,
    run_pk: Uuid,
) -> Result<Vec<TaskInstanceRow>, DbError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM task_instances WHERE run_pk = ?1 ORDER BY rowid");

    let rows = sqlx::query_as::<_, TaskInstanceRow>(&sql)
        .bind(run_pk)
        .fetch_all(pool)
        .await?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewRun, RunType};
    use crate::pool::in_memory;
    use crate::repository::runs::create_run;

    async fn open_run(pool: &DbPool) -> Uuid {
        let now = Utc::now();
        let run = create_run(
            pool,
            &NewRun {
                pipeline_id: "p".into(),
                run_id: "manual__now".into(),
                run_type: RunType::Manual,
                logical_date: now,
                data_interval_start: now,
                data_interval_end: now,
            },
        )
        .await
        .unwrap();
        run.id
    }

    #[tokio::test]
    async fn attempts_are_listed_in_order() {
        let pool = in_memory().await.unwrap();
        let run_pk = open_run(&pool).await;

        let first = start_task_attempt(&pool, run_pk, "dbt_seed", 1).await.unwrap();
        finish_task_attempt(
            &pool,
            first.id,
            &AttemptOutcome {
                state: TaskState::UpForRetry,
                exit_code: Some(1),
                output: None,
                error: Some("command exited with code 1".into()),
            },
        )
        .await
        .unwrap();

        let second = start_task_attempt(&pool, run_pk, "dbt_seed", 2).await.unwrap();
        finish_task_attempt(
            &pool,
            second.id,
            &AttemptOutcome {
                state: TaskState::Success,
                exit_code: Some(0),
                output: Some("{\"exit_code\":0}".into()),
                error: None,
            },
        )
        .await
        .unwrap();

        record_task_state(&pool, run_pk, "dbt_run", TaskState::UpstreamFailed, None)
            .await
            .unwrap();

        let rows = list_task_instances(&pool, run_pk).await.unwrap();
        let summary: Vec<(&str, i64, &str)> = rows
            .iter()
            .map(|r| (r.task_id.as_str(), r.try_number, r.state.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("dbt_seed", 1, "up_for_retry"),
                ("dbt_seed", 2, "success"),
                ("dbt_run", 0, "upstream_failed"),
            ]
        );
        assert_eq!(rows[0].exit_code, Some(1));
        assert_eq!(rows[1].output.as_deref(), Some("{\"exit_code\":0}"));
    }
}
