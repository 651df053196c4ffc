//! Pipeline run repository functions.

use chrono::Utc;
use uuid::Uuid;

use crate::{
    DbError, DbPool,
    models::{NewRun, PipelineRunRow, RunState, RunType},
};

const RUN_COLUMNS: &str = "id, pipeline_id, run_id, run_type, state, logical_date, \
     data_interval_start, data_interval_end, started_at, finished_at";

/// Open a new run in `running` state.
///
/// Returns [`DbError::Conflict`] if the pipeline already has a run with the
/// same `run_id`.
pub async fn create_run(pool: &DbPool, run: &NewRun) -> Result<PipelineRunRow, DbError> {
    let sql = format!(
        r#"
        INSERT INTO pipeline_runs
            (id, pipeline_id, run_id, run_type, state, logical_date,
             data_interval_start, data_interval_end, started_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        RETURNING {RUN_COLUMNS}
        "#
    );

    sqlx::query_as::<_, PipelineRunRow>(&sql)
        .bind(Uuid::new_v4())
        .bind(&run.pipeline_id)
        .bind(&run.run_id)
        .bind(run.run_type.as_str())
        .bind(RunState::Running.as_str())
        .bind(run.logical_date)
        .bind(run.data_interval_start)
        .bind(run.data_interval_end)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
        .map_err(|e| {
            DbError::from_insert(e, || {
                format!("run '{}' already exists for pipeline '{}'", run.run_id, run.pipeline_id)
            })
        })
}

/// Set the final `state` of a run and stamp `finished_at`.
pub async fn finish_run(pool: &DbPool, id: Uuid, state: RunState) -> Result<(), DbError> {
    let result = sqlx::query("UPDATE pipeline_runs SET state = ?1, finished_at = ?2 WHERE id = ?3")
        .bind(state.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}

/// Look up a run by its human-readable `run_id`.
pub async fn get_run(
    pool: &DbPool,
    pipeline_id: &str,
    run_id: &str,
) -> Result<Option<PipelineRunRow>, DbError> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE pipeline_id = ?1 AND run_id = ?2");

    let row = sqlx::query_as::<_, PipelineRunRow>(&sql)
        .bind(pipeline_id)
        .bind(run_id)
        .fetch_optional(pool)
        .await?;

    Ok(row)
}

/// The scheduled run with the latest logical date, if any.
pub async fn latest_scheduled_run(
    pool: &DbPool,
    pipeline_id: &str,
) -> Result<Option<PipelineRunRow>, DbError> {
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM pipeline_runs \
         WHERE pipeline_id = ?1 AND run_type = ?2 \
         ORDER BY logical_date DESC LIMIT 1"
    );

    let row = sqlx::query_as::<_, PipelineRunRow>(&sql)
        .bind(pipeline_id)
        .bind(RunType::Scheduled.as_str())
        .fetch_optional(pool)
        .await?;

    Ok(row)
}

/// Most recent runs first, at most `limit` of them.
pub async fn list_runs(
    pool: &DbPool,
    pipeline_id: &str,
    limit: u32,
) -> Result<Vec<PipelineRunRow>, DbError> {
    let sql = format!(
        "SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE pipeline_id = ?1 \
         ORDER BY started_at DESC, logical_date DESC LIMIT ?2"
    );

    let rows = sqlx::query_as::<_, PipelineRunRow>(&sql)
        .bind(pipeline_id)
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;

    Ok(rows)
}

/// Mark runs (and their attempts) left `running` by a dead process as failed.
///
/// Returns the number of runs touched.
pub async fn fail_orphaned_runs(pool: &DbPool, pipeline_id: &str) -> Result<u64, DbError> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE task_instances
        SET state = 'failed', error = 'abandoned by a stopped runner', finished_at = ?1
        WHERE state IN ('running', 'up_for_retry')
          AND run_pk IN (
              SELECT id FROM pipeline_runs WHERE pipeline_id = ?2 AND state = 'running'
          )
        "#,
    )
    .bind(now)
    .bind(pipeline_id)
    .execute(&mut *tx)
    .await?;

    let result = sqlx::query(
        "UPDATE pipeline_runs SET state = 'failed', finished_at = ?1 \
         WHERE pipeline_id = ?2 AND state = 'running'",
    )
    .bind(now)
    .bind(pipeline_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(result.rows_affected())
}
