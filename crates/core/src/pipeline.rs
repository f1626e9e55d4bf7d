use crate::classifier::Classifier;
use crate::cluster::ClusterModel;
use crate::config::AppConfig;
use crate::embeddings::{build_registry, Embedder};
use crate::error::{EnrichError, ErrorClass};
use crate::models::{Embedding, Source, TextUnit};
use crate::normalizer::{reconstruct, Normalizer};
use crate::reconciler::{ChangeLogEntry, Reconciler};
use crate::registry::{LabelShare, Registry};
use crate::vectorstore::VectorIndex;
use crate::{reducer, rules};
use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use storage::models::{CachedUnit, ChangeRecord, RunRecord};
use storage::{cache, changes, connect, migrate, pending, runs};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Full recompute of reduction and clusters.
    Cold,
    /// Keep the persisted cluster model and place new sources into it.
    Warm,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Cold => "cold",
            RunMode::Warm => "warm",
        }
    }
}

/// Shared stop request, checked between source batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingSource {
    pub source_id: String,
    pub error_class: ErrorClass,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub embedded_units: usize,
    pub reused_units: usize,
    pub pending: Vec<PendingSource>,
    pub rejected_rows: usize,
    pub clusters: usize,
    pub outliers: usize,
    pub changed: usize,
    pub flagged: usize,
    pub conflicts: usize,
    pub changes: Vec<ChangeLogEntry>,
    pub breakdown: Vec<LabelShare>,
    pub cancelled: bool,
}

struct Ingested {
    source_id: String,
    text: String,
    embeddings: Vec<Embedding>,
    embedded: usize,
    reused: usize,
    cache_rows: Option<Vec<CachedUnit>>,
}

enum SourceOutcome {
    Ready(Ingested),
    Failed(String, EnrichError),
}

/// Runs the pipeline against the embedding backend named in `config`.
pub async fn run(config: &AppConfig, mode: RunMode, cancel: &CancelFlag) -> anyhow::Result<RunReport> {
    config.validate()?;
    let providers = build_registry(&config.embeddings);
    let embedder = Embedder::from_config(&providers, &config.embeddings)?;
    run_with_embedder(config, embedder, mode, cancel).await
}

pub async fn run_with_embedder(
    config: &AppConfig,
    embedder: Embedder,
    mode: RunMode,
    cancel: &CancelFlag,
) -> anyhow::Result<RunReport> {
    config.validate()?;
    let seed = config
        .reduction
        .seed
        .ok_or_else(|| EnrichError::Config("reduction.seed must be set".into()))?;
    let started_at = Utc::now();
    let run_id = format!(
        "run-{}-{:08x}",
        started_at.format("%Y%m%dT%H%M%S%.3fZ"),
        rand::random::<u32>()
    );
    info!(run_id = %run_id, mode = mode.as_str(), "starting run");

    let mut registry = Registry::load(&config.registry.path).context("load registry")?;
    if let Some(dir) = &config.registry.text_dir {
        registry = registry.with_text_dir(dir);
    }
    let pool = connect(&config.database.path).await.context("db connect")?;
    migrate(&pool).await.context("db migrate")?;

    let mut report = RunReport {
        run_id: run_id.clone(),
        mode,
        started_at,
        finished_at: started_at,
        processed: 0,
        embedded_units: 0,
        reused_units: 0,
        pending: Vec::new(),
        rejected_rows: registry.rejected_rows().len(),
        clusters: 0,
        outliers: 0,
        changed: 0,
        flagged: 0,
        conflicts: 0,
        changes: Vec::new(),
        breakdown: Vec::new(),
        cancelled: false,
    };

    info!("Starting ingestion phase...");
    let normalizer = Normalizer::new(config.normalizer);
    let index = VectorIndex::new();
    let mut texts: BTreeMap<String, String> = BTreeMap::new();
    let mut ingested: Vec<String> = Vec::new();
    let sources: Vec<&Source> = registry.iter().collect();

    for batch in sources.chunks(config.embeddings.source_batch) {
        if cancel.is_cancelled() {
            warn!(processed = ingested.len(), "run cancelled; stopping before next batch");
            report.cancelled = true;
            break;
        }
        let outcomes: Vec<anyhow::Result<SourceOutcome>> = stream::iter(
            batch
                .iter()
                .map(|s| ingest_source(s, &registry, &normalizer, &embedder, &pool)),
        )
        .buffered(config.embeddings.workers)
        .collect()
        .await;

        for outcome in outcomes {
            match outcome? {
                SourceOutcome::Ready(done) => {
                    let id = done.source_id.clone();
                    if let Err(e) = index.replace_source(&id, done.embeddings) {
                        fail(&mut report, &id, e);
                        continue;
                    }
                    if let Some(rows) = &done.cache_rows {
                        cache::store_embeddings(&pool, &id, embedder.model_id(), rows)
                            .await
                            .context("store embeddings")?;
                    }
                    report.embedded_units += done.embedded;
                    report.reused_units += done.reused;
                    texts.insert(id.clone(), done.text);
                    ingested.push(id);
                }
                SourceOutcome::Failed(id, e) => fail(&mut report, &id, e),
            }
        }
    }
    report.processed = ingested.len();
    info!(
        processed = report.processed,
        pending = report.pending.len(),
        embedded = report.embedded_units,
        reused = report.reused_units,
        "Ingestion complete."
    );

    let now = Utc::now();
    record_pending(&pool, &report, &ingested, now).await?;

    if report.cancelled {
        report.breakdown = registry.breakdown();
        report.finished_at = Utc::now();
        record(&pool, &report).await?;
        return Ok(report);
    }

    info!("Starting clustering phase...");
    let snapshot = index.snapshot();
    let vectors = reducer::source_vectors(&snapshot);
    let clusters_path = config.registry.clusters_path();
    let model = match mode {
        RunMode::Cold => None,
        RunMode::Warm => match ClusterModel::load(&clusters_path)? {
            Some(m) if m.compatible(seed, embedder.model_id()) => Some(m),
            Some(_) => {
                warn!("persisted cluster model has a different seed or model; refitting");
                None
            }
            None => {
                info!("no persisted cluster model; refitting");
                None
            }
        },
    };
    let model = match model {
        Some(m) => m.extend(&vectors, &texts, &config.reduction),
        None => ClusterModel::fit(&vectors, &texts, &config.reduction, seed, embedder.model_id()),
    };
    model.save(&clusters_path).context("save cluster model")?;
    report.clusters = model.cluster_count();
    report.outliers = model.outlier_count();
    info!(clusters = report.clusters, outliers = report.outliers, "Clustering complete.");

    info!("Starting classification phase...");
    let lexical = rules::load_rules(&config.classification)?;
    let classifier = Classifier::new(&config.classification, &lexical, config.reduction.topic_tags);
    let outcomes = classifier.classify_all(
        ingested.iter().map(String::as_str),
        &registry,
        &snapshot,
        Some(&model),
    );
    info!(classified = outcomes.len(), "Classification complete.");

    info!("Starting reconciliation phase...");
    let summary = Reconciler::new(config.reconciliation.clone()).reconcile(&mut registry, &outcomes, now);
    let records: Vec<ChangeRecord> = summary
        .entries
        .iter()
        .map(|e| ChangeRecord {
            id: None,
            run_id: run_id.clone(),
            source_id: e.source_id.clone(),
            old_label: e.old_label.to_string(),
            new_label: e.new_label.to_string(),
            old_confidence: e.old_confidence as f64,
            new_confidence: e.new_confidence as f64,
            reason: e.reason.as_str().to_string(),
            detail: Some(e.detail.clone()),
            created_at: e.timestamp.to_rfc3339(),
        })
        .collect();
    changes::append_changes(&pool, &records)
        .await
        .context("append change log")?;
    report.changed = summary.changed;
    report.flagged = summary.flagged;
    report.conflicts = summary.conflicts;
    report.changes = summary.entries;

    registry.save().context("save registry")?;
    report.breakdown = registry.breakdown();
    report.finished_at = Utc::now();
    record(&pool, &report).await?;
    info!(
        changed = report.changed,
        flagged = report.flagged,
        pending = report.pending.len(),
        "Run complete."
    );
    Ok(report)
}

fn fail(report: &mut RunReport, source_id: &str, err: EnrichError) {
    warn!(source_id, class = err.class().as_str(), error = %err, "source left pending");
    report.pending.push(PendingSource {
        source_id: source_id.to_string(),
        error_class: err.class(),
        message: err.to_string(),
    });
}

/// Reads, normalizes and embeds one source. Item-level failures come back
/// as `Failed`; only database errors are returned as `Err`.
async fn ingest_source(
    source: &Source,
    registry: &Registry,
    normalizer: &Normalizer,
    embedder: &Embedder,
    pool: &SqlitePool,
) -> anyhow::Result<SourceOutcome> {
    let id = source.id.clone();
    let failed = |e: EnrichError| Ok(SourceOutcome::Failed(id.clone(), e));

    let Some(path) = registry.text_path(source) else {
        return failed(EnrichError::MissingText {
            source_id: id.clone(),
            detail: "no raw_text_ref".into(),
        });
    };
    let bytes = match tokio::fs::read(&path).await {
        Ok(b) => b,
        Err(e) => {
            return failed(EnrichError::MissingText {
                source_id: id.clone(),
                detail: format!("{}: {}", path.display(), e),
            })
        }
    };
    let units = match normalizer.normalize(&id, &bytes) {
        Ok(u) => u,
        Err(e) => return failed(e),
    };

    let cached: HashMap<usize, CachedUnit> = cache::cached_embeddings(pool, &id, embedder.model_id())
        .await
        .context("read embedding cache")?
        .into_iter()
        .map(|c| (c.unit_index as usize, c))
        .collect();

    let mut slots: Vec<Option<Embedding>> = vec![None; units.len()];
    let mut missing: Vec<TextUnit> = Vec::new();
    for unit in &units {
        let reusable = cached
            .get(&unit.index)
            .filter(|c| c.text_hash == unit.text_hash())
            .and_then(|c| c.vector().ok())
            .filter(|v| v.len() == embedder.dimension());
        match reusable {
            Some(vector) => {
                slots[unit.index] = Some(Embedding {
                    key: unit.key(),
                    dimension: vector.len(),
                    vector,
                    model_id: embedder.model_id().to_string(),
                })
            }
            None => missing.push(unit.clone()),
        }
    }

    let reused = units.len() - missing.len();
    let fresh = match embedder.embed_batch(&missing).await {
        Ok(v) => v,
        Err(e) => return failed(e),
    };
    let embedded = fresh.len();
    for emb in fresh {
        let idx = emb.key.unit_index;
        slots[idx] = Some(emb);
    }
    let embeddings: Vec<Embedding> = slots.into_iter().flatten().collect();
    debug!(source_id = %id, units = units.len(), reused, embedded, "ingested source");

    let cache_rows = if embedded > 0 || cached.len() != units.len() {
        let rows = units
            .iter()
            .zip(&embeddings)
            .map(|(unit, emb)| {
                Ok(CachedUnit {
                    source_id: id.clone(),
                    unit_index: unit.index as i64,
                    model_id: emb.model_id.clone(),
                    text_hash: unit.text_hash(),
                    vector_json: serde_json::to_string(&emb.vector)?,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Some(rows)
    } else {
        None
    };

    Ok(SourceOutcome::Ready(Ingested {
        source_id: id.clone(),
        text: reconstruct(&units),
        embeddings,
        embedded,
        reused,
        cache_rows,
    }))
}

async fn record_pending(
    pool: &SqlitePool,
    report: &RunReport,
    ingested: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let stamp = now.to_rfc3339();
    for p in &report.pending {
        pending::mark_pending(pool, &p.source_id, p.error_class.as_str(), &p.message, &stamp)
            .await
            .context("mark pending")?;
    }
    pending::clear_pending(pool, ingested)
        .await
        .context("clear pending")?;
    Ok(())
}

async fn record(pool: &SqlitePool, report: &RunReport) -> anyhow::Result<()> {
    runs::record_run(
        pool,
        &RunRecord {
            run_id: report.run_id.clone(),
            mode: report.mode.as_str().to_string(),
            started_at: report.started_at.to_rfc3339(),
            finished_at: report.finished_at.to_rfc3339(),
            processed: report.processed as i64,
            pending: report.pending.len() as i64,
            changed: report.changed as i64,
            flagged: report.flagged as i64,
            cancelled: report.cancelled,
        },
    )
    .await
    .context("record run")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Classification;
    use providers::{EmbedResponse, EmbeddingProvider, ProviderError};
    use std::fs;
    use std::path::Path;

    struct Down;

    #[async_trait::async_trait]
    impl EmbeddingProvider for Down {
        fn model_id(&self) -> &str {
            "down"
        }
        fn dimension(&self) -> usize {
            32
        }
        async fn embed(&self, _texts: &[String]) -> Result<EmbedResponse, ProviderError> {
            Err(ProviderError::Unavailable("connection refused".into()))
        }
    }

    fn setup(dir: &Path) -> AppConfig {
        fs::write(
            dir.join("registry.csv"),
            "id,name,domain,raw_text_ref,classification,confidence,topical_tags,provenance,last_updated\n\
             a,Alpha Collective,alpha.example,a.txt,non-profit,1.0,,manual,2024-01-01T00:00:00Z\n\
             b,Beta Collective,beta.example,b.txt,,,,,\n",
        )
        .unwrap();
        fs::write(dir.join("a.txt"), "Community gardens and food banks.").unwrap();
        fs::write(dir.join("b.txt"), "Community gardens and food banks!").unwrap();
        let mut cfg = AppConfig::default();
        cfg.registry.path = dir.join("registry.csv").to_string_lossy().into_owned();
        cfg.database.path = dir.join("enricher.db").to_string_lossy().into_owned();
        cfg.reduction.seed = Some(3);
        cfg.embeddings.dimension = 32;
        cfg.embeddings.max_attempts = 2;
        cfg.embeddings.backoff_ms = 1;
        cfg
    }

    #[tokio::test]
    async fn unseeded_run_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = setup(dir.path());
        cfg.reduction.seed = None;
        let err = run(&cfg, RunMode::Cold, &CancelFlag::new()).await.unwrap_err();
        assert!(err.to_string().contains("seed"));
    }

    #[tokio::test]
    async fn cancelled_run_leaves_registry_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = setup(dir.path());
        let before = fs::read(&cfg.registry.path).unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let report = run(&cfg, RunMode::Cold, &cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.processed, 0);
        assert_eq!(fs::read(&cfg.registry.path).unwrap(), before);
        assert!(!cfg.registry.clusters_path().exists());
    }

    #[tokio::test]
    async fn unreachable_backend_leaves_sources_pending() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = setup(dir.path());
        let embedder = Embedder::new(Arc::new(Down), &cfg.embeddings);
        let report = run_with_embedder(&cfg, embedder, RunMode::Cold, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.pending.len(), 2);
        assert!(report.pending.iter().all(|p| p.error_class == ErrorClass::Backend));
        assert_eq!(report.changed, 0);

        let pool = connect(&cfg.database.path).await.unwrap();
        let ledger = pending::list_pending(&pool).await.unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].error_class, "backend");

        let reg = Registry::load(&cfg.registry.path).unwrap();
        assert_eq!(reg.get("b").unwrap().classification, Classification::Unknown);
    }

    #[tokio::test]
    async fn second_run_reuses_cached_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = setup(dir.path());
        let first = run(&cfg, RunMode::Cold, &CancelFlag::new()).await.unwrap();
        assert_eq!(first.processed, 2);
        assert!(first.embedded_units > 0);
        assert_eq!(first.reused_units, 0);

        let second = run(&cfg, RunMode::Warm, &CancelFlag::new()).await.unwrap();
        assert_eq!(second.embedded_units, 0);
        assert_eq!(second.reused_units, first.embedded_units);
        assert_eq!(second.changed, 0);
    }
}
