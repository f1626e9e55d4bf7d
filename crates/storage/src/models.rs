use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One reconciliation event. `id` is assigned by the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ChangeRecord {
    pub id: Option<i64>,
    pub run_id: String,
    pub source_id: String,
    pub old_label: String,
    pub new_label: String,
    pub old_confidence: f64,
    pub new_confidence: f64,
    pub reason: String,
    pub detail: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PendingRecord {
    pub source_id: String,
    pub error_class: String,
    pub error: String,
    pub attempts: i64,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CachedUnit {
    pub source_id: String,
    pub unit_index: i64,
    pub model_id: String,
    pub text_hash: String,
    pub vector_json: String,
}

impl CachedUnit {
    pub fn vector(&self) -> anyhow::Result<Vec<f32>> {
        Ok(serde_json::from_str(&self.vector_json)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RunRecord {
    pub run_id: String,
    pub mode: String,
    pub started_at: String,
    pub finished_at: String,
    pub processed: i64,
    pub pending: i64,
    pub changed: i64,
    pub flagged: i64,
    pub cancelled: bool,
}
