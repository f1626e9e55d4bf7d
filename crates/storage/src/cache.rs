use crate::models::CachedUnit;
use sqlx::SqlitePool;

pub async fn cached_embeddings(
    pool: &SqlitePool,
    source_id: &str,
    model_id: &str,
) -> anyhow::Result<Vec<CachedUnit>> {
    let rows = sqlx::query_as::<_, CachedUnit>(
        "SELECT * FROM embedding_cache WHERE source_id = ?1 AND model_id = ?2 ORDER BY unit_index",
    )
    .bind(source_id)
    .bind(model_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Replaces every cached unit of `source_id` for `model_id` with `units`.
pub async fn store_embeddings(
    pool: &SqlitePool,
    source_id: &str,
    model_id: &str,
    units: &[CachedUnit],
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM embedding_cache WHERE source_id = ?1 AND model_id = ?2")
        .bind(source_id)
        .bind(model_id)
        .execute(&mut *tx)
        .await?;
    for unit in units {
        sqlx::query(
            r#"
            INSERT INTO embedding_cache (source_id, unit_index, model_id, text_hash, vector_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(source_id)
        .bind(unit.unit_index)
        .bind(model_id)
        .bind(&unit.text_hash)
        .bind(&unit.vector_json)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn all_embeddings(pool: &SqlitePool, model_id: &str) -> anyhow::Result<Vec<CachedUnit>> {
    let rows = sqlx::query_as::<_, CachedUnit>(
        "SELECT * FROM embedding_cache WHERE model_id = ?1 ORDER BY source_id, unit_index",
    )
    .bind(model_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
