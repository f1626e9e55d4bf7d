use crate::models::RunRecord;
use sqlx::SqlitePool;

pub async fn record_run(pool: &SqlitePool, run: &RunRecord) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO runs (run_id, mode, started_at, finished_at, processed, pending, changed, flagged, cancelled)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&run.run_id)
    .bind(&run.mode)
    .bind(&run.started_at)
    .bind(&run.finished_at)
    .bind(run.processed)
    .bind(run.pending)
    .bind(run.changed)
    .bind(run.flagged)
    .bind(run.cancelled)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn last_runs(pool: &SqlitePool, limit: i64) -> anyhow::Result<Vec<RunRecord>> {
    let rows = sqlx::query_as::<_, RunRecord>(
        "SELECT * FROM runs ORDER BY started_at DESC, run_id DESC LIMIT ?1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
