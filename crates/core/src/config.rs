use crate::error::EnrichError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub registry: RegistryConfig,
    pub database: DatabaseConfig,
    pub normalizer: NormalizerConfig,
    pub embeddings: EmbeddingConfig,
    pub reduction: ReductionConfig,
    pub classification: ClassificationConfig,
    pub reconciliation: ReconcileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: String,
    /// Base directory for `raw_text_ref`; defaults to the registry's directory.
    pub text_dir: Option<String>,
    /// Persisted cluster model; defaults next to the registry file.
    pub clusters_path: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: "data/registry.csv".to_string(),
            text_dir: None,
            clusters_path: None,
        }
    }
}

impl RegistryConfig {
    pub fn clusters_path(&self) -> PathBuf {
        if let Some(p) = &self.clusters_path {
            return PathBuf::from(p);
        }
        let registry = Path::new(&self.path);
        let stem = registry
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("registry");
        registry.with_file_name(format!("{}.clusters.json", stem))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/enricher.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    pub max_unit_tokens: usize,
    pub overlap_fraction: f32,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            max_unit_tokens: 256,
            overlap_fraction: 0.15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub workers: usize,
    pub source_batch: usize,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            model: "feature-hash-v1".to_string(),
            dimension: 256,
            batch_size: 32,
            timeout_ms: 30_000,
            max_attempts: 3,
            backoff_ms: 250,
            workers: 4,
            source_batch: 16,
            base_url: None,
            api_key_env: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionConfig {
    pub intermediate_dims: usize,
    pub seed: Option<u64>,
    pub min_cluster_size: usize,
    pub eps: Option<f32>,
    pub signature_terms: usize,
    pub topic_tags: usize,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            intermediate_dims: 8,
            seed: None,
            min_cluster_size: 2,
            eps: None,
            signature_terms: 8,
            topic_tags: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub neighbors_k: usize,
    pub min_similarity: f32,
    pub lexical_weight: f32,
    pub neighbor_weight: f32,
    pub cluster_weight: f32,
    pub rules_path: Option<String>,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            neighbors_k: 5,
            min_similarity: 0.5,
            lexical_weight: 1.0,
            neighbor_weight: 1.0,
            cluster_weight: 1.0,
            rules_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub review_confidence_drop: f32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            review_confidence_drop: 0.25,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), EnrichError> {
        let fail = |msg: &str| Err(EnrichError::Config(msg.to_string()));
        if self.reduction.seed.is_none() {
            return fail("reduction.seed must be set; clustering is only reproducible when seeded");
        }
        if self.reduction.intermediate_dims < 2 {
            return fail("reduction.intermediate_dims must be at least 2");
        }
        if self.reduction.min_cluster_size < 2 {
            return fail("reduction.min_cluster_size must be at least 2");
        }
        if let Some(eps) = self.reduction.eps {
            if !(eps > 0.0) {
                return fail("reduction.eps must be positive");
            }
        }
        if self.normalizer.max_unit_tokens == 0 {
            return fail("normalizer.max_unit_tokens must be positive");
        }
        if !(0.0..1.0).contains(&self.normalizer.overlap_fraction) {
            return fail("normalizer.overlap_fraction must be in [0, 1)");
        }
        let e = &self.embeddings;
        if e.dimension == 0 || e.batch_size == 0 || e.workers == 0 || e.source_batch == 0 {
            return fail("embeddings.dimension, batch_size, workers and source_batch must be positive");
        }
        if e.max_attempts == 0 {
            return fail("embeddings.max_attempts must be at least 1");
        }
        let c = &self.classification;
        if c.neighbors_k == 0 {
            return fail("classification.neighbors_k must be positive");
        }
        if c.lexical_weight < 0.0 || c.neighbor_weight < 0.0 || c.cluster_weight < 0.0 {
            return fail("classification weights must be non-negative");
        }
        if self.reconciliation.review_confidence_drop < 0.0 {
            return fail("reconciliation.review_confidence_drop must be non-negative");
        }
        Ok(())
    }
}

pub fn load(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let mut settings = config::Config::builder();
    if let Some(p) = path {
        settings = settings.add_source(config::File::with_name(p));
    } else {
        settings = settings.add_source(config::File::with_name("config/default").required(false));
    }
    settings = settings.add_source(config::Environment::with_prefix("ENRICHER").separator("__"));
    let cfg = settings.build()?;
    Ok(cfg.try_deserialize()?)
}
