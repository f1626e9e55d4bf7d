use crate::models::PendingRecord;
use sqlx::SqlitePool;

/// Records a failed source; repeated failures bump `attempts`.
pub async fn mark_pending(
    pool: &SqlitePool,
    source_id: &str,
    error_class: &str,
    error: &str,
    now: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO pending_sources (source_id, error_class, error, attempts, updated_at)
        VALUES (?1, ?2, ?3, 1, ?4)
        ON CONFLICT(source_id) DO UPDATE SET
            error_class = excluded.error_class,
            error = excluded.error,
            attempts = pending_sources.attempts + 1,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(source_id)
    .bind(error_class)
    .bind(error)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn clear_pending(pool: &SqlitePool, source_ids: &[String]) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    for id in source_ids {
        sqlx::query("DELETE FROM pending_sources WHERE source_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn list_pending(pool: &SqlitePool) -> anyhow::Result<Vec<PendingRecord>> {
    let rows = sqlx::query_as::<_, PendingRecord>(
        "SELECT * FROM pending_sources ORDER BY source_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
