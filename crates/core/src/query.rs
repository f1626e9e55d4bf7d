//! Read-only views over an enriched registry: semantic search, "more like
//! this" and cluster browsing. Nothing here writes classification state.

use crate::cluster::ClusterModel;
use crate::config::AppConfig;
use crate::embeddings::{build_registry, Embedder};
use crate::error::{EnrichError, Result};
use crate::models::{Classification, ClusterId, Embedding, TextUnit, UnitKey};
use crate::reducer::source_vectors;
use crate::registry::Registry;
use crate::vectorstore::{cosine, IndexSnapshot, VectorIndex};
use anyhow::Context;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub source_id: String,
    pub name: String,
    pub classification: Classification,
    pub confidence: f32,
    pub similarity: f32,
    pub topical_tags: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterMember {
    pub source_id: String,
    pub name: String,
    pub classification: Classification,
    pub layout: [f32; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterView {
    pub id: ClusterId,
    pub outlier: bool,
    pub signature: Vec<String>,
    pub members: Vec<ClusterMember>,
}

pub struct QueryService {
    registry: Registry,
    snapshot: Arc<IndexSnapshot>,
    model: Option<ClusterModel>,
    embedder: Embedder,
}

impl QueryService {
    pub fn new(
        registry: Registry,
        snapshot: Arc<IndexSnapshot>,
        model: Option<ClusterModel>,
        embedder: Embedder,
    ) -> Self {
        Self {
            registry,
            snapshot,
            model,
            embedder,
        }
    }

    /// Rebuilds the index from the embedding cache of the configured model
    /// and loads the registry and the persisted cluster model.
    pub async fn open(config: &AppConfig) -> anyhow::Result<Self> {
        let providers = build_registry(&config.embeddings);
        let embedder = Embedder::from_config(&providers, &config.embeddings)?;
        let mut registry = Registry::load(&config.registry.path).context("load registry")?;
        if let Some(dir) = &config.registry.text_dir {
            registry = registry.with_text_dir(dir);
        }

        let pool = storage::connect(&config.database.path).await?;
        storage::migrate(&pool).await?;
        let cached = storage::cache::all_embeddings(&pool, embedder.model_id()).await?;
        let index = VectorIndex::new();
        let mut skipped = 0usize;
        for row in cached {
            if registry.get(&row.source_id).is_none() {
                skipped += 1;
                continue;
            }
            let vector = row.vector()?;
            index.insert(Embedding {
                key: UnitKey {
                    source_id: row.source_id,
                    unit_index: row.unit_index as usize,
                },
                dimension: vector.len(),
                vector,
                model_id: row.model_id,
            })?;
        }
        if skipped > 0 {
            tracing::debug!(skipped, "ignored cached units of sources no longer in the registry");
        }
        let model = ClusterModel::load(&config.registry.clusters_path())?;
        tracing::info!(units = index.len(), clustered = model.is_some(), "opened query service");
        Ok(Self::new(registry, index.snapshot(), model, embedder))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Ranks sources by their best unit similarity to `query_text`. When
    /// `tags` is non-empty only sources carrying at least one of them are
    /// considered.
    pub async fn search(&self, query_text: &str, k: usize, tags: &[String]) -> Result<Vec<SearchHit>> {
        let text = query_text.trim();
        if text.is_empty() {
            return Err(EnrichError::EmptyInput {
                source_id: "query".into(),
            });
        }
        let unit = TextUnit {
            source_id: "query".into(),
            index: 0,
            text: text.to_string(),
            token_estimate: text.split_whitespace().count(),
            overlap_tokens: 0,
        };
        let query = self.embedder.embed(&unit).await?;
        if self.snapshot.is_empty() {
            return Ok(Vec::new());
        }

        let wanted: BTreeSet<String> = tags.iter().map(|t| t.trim().to_lowercase()).collect();
        let mut best: HashMap<String, f32> = HashMap::new();
        for hit in self.snapshot.nearest(&query.vector, self.snapshot.len())? {
            best.entry(hit.key.source_id)
                .and_modify(|s| *s = s.max(hit.similarity))
                .or_insert(hit.similarity);
        }

        let mut hits: Vec<SearchHit> = best
            .into_iter()
            .filter_map(|(id, similarity)| {
                let source = self.registry.get(&id)?;
                if !wanted.is_empty() && source.topical_tags.is_disjoint(&wanted) {
                    return None;
                }
                Some(SearchHit {
                    source_id: id,
                    name: source.name.clone(),
                    classification: source.classification,
                    confidence: source.confidence,
                    similarity,
                    topical_tags: source.topical_tags.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Sources whose aggregate vector is closest to that of `source_id`.
    pub fn similar_to(&self, source_id: &str, k: usize) -> Result<Vec<SearchHit>> {
        if self.registry.get(source_id).is_none() {
            return Err(EnrichError::NotFound(format!("source {}", source_id)));
        }
        let vectors = source_vectors(&self.snapshot);
        let target = vectors
            .get(source_id)
            .ok_or_else(|| EnrichError::NotFound(format!("embeddings for source {}", source_id)))?;

        let mut hits: Vec<SearchHit> = vectors
            .iter()
            .filter(|(id, _)| id.as_str() != source_id)
            .filter_map(|(id, v)| {
                let source = self.registry.get(id)?;
                Some(SearchHit {
                    source_id: id.clone(),
                    name: source.name.clone(),
                    classification: source.classification,
                    confidence: source.confidence,
                    similarity: cosine(target, v),
                    topical_tags: source.topical_tags.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    pub fn cluster_view(&self, cluster_id: ClusterId) -> Result<ClusterView> {
        let cluster = self
            .model
            .as_ref()
            .and_then(|m| m.cluster(cluster_id))
            .ok_or_else(|| EnrichError::NotFound(format!("cluster {}", cluster_id)))?;
        let layout = self.model.as_ref().map(|m| &m.reduction.layout);
        let members = cluster
            .members
            .iter()
            .map(|id| {
                let source = self.registry.get(id);
                ClusterMember {
                    source_id: id.clone(),
                    name: source.map(|s| s.name.clone()).unwrap_or_default(),
                    classification: source
                        .map(|s| s.classification)
                        .unwrap_or(Classification::Unknown),
                    layout: layout.and_then(|l| l.get(id)).copied().unwrap_or([0.0, 0.0]),
                }
            })
            .collect();
        Ok(ClusterView {
            id: cluster.id,
            outlier: cluster.is_outlier(),
            signature: cluster.signature.clone(),
            members,
        })
    }

    /// All cluster ids, outliers last.
    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        let mut ids: Vec<ClusterId> = self
            .model
            .as_ref()
            .map(|m| m.clusters.iter().map(|c| c.id).collect())
            .unwrap_or_default();
        ids.sort_by_key(|id| (*id < 0, *id));
        ids
    }
}
