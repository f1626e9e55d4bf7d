use crate::models::ChangeRecord;
use sqlx::SqlitePool;

/// Appends entries in one transaction; either all land or none do.
pub async fn append_changes(pool: &SqlitePool, entries: &[ChangeRecord]) -> anyhow::Result<usize> {
    if entries.is_empty() {
        return Ok(0);
    }
    let mut tx = pool.begin().await?;
    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO change_log
                (run_id, source_id, old_label, new_label, old_confidence, new_confidence, reason, detail, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&entry.run_id)
        .bind(&entry.source_id)
        .bind(&entry.old_label)
        .bind(&entry.new_label)
        .bind(entry.old_confidence)
        .bind(entry.new_confidence)
        .bind(&entry.reason)
        .bind(&entry.detail)
        .bind(&entry.created_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    tracing::debug!(entries = entries.len(), "appended change-log entries");
    Ok(entries.len())
}

/// Most recent entries first.
pub async fn list_changes(
    pool: &SqlitePool,
    source_id: Option<&str>,
    limit: i64,
) -> anyhow::Result<Vec<ChangeRecord>> {
    let rows = match source_id {
        Some(id) => {
            sqlx::query_as::<_, ChangeRecord>(
                "SELECT * FROM change_log WHERE source_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .bind(id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, ChangeRecord>("SELECT * FROM change_log ORDER BY id DESC LIMIT ?1")
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
    };
    Ok(rows)
}

pub async fn count_changes(pool: &SqlitePool) -> anyhow::Result<i64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM change_log")
        .fetch_one(pool)
        .await?;
    Ok(n)
}
