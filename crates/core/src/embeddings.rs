use crate::config::EmbeddingConfig;
use crate::error::{EnrichError, Result};
use crate::models::{Embedding, TextUnit};
use providers::hashing::HashingProvider;
use providers::openai::{OpenAiConfig, OpenAiProvider};
use providers::{EmbeddingProvider, ProviderRegistry};
use std::sync::Arc;
use std::time::Duration;

/// Builds the registry of embedding backends named by the configuration.
/// The local hashing backend is always available; the OpenAI-compatible
/// backend is registered only when a base URL and an API key are present.
pub fn build_registry(cfg: &EmbeddingConfig) -> ProviderRegistry {
    let hashing_model = if cfg.provider == "hashing" {
        cfg.model.as_str()
    } else {
        "feature-hash-v1"
    };
    let mut registry = ProviderRegistry::new().with_embedding(
        "hashing",
        Arc::new(HashingProvider::new(hashing_model, cfg.dimension)),
    );

    if let Some(base_url) = &cfg.base_url {
        let key_var = cfg.api_key_env.as_deref().unwrap_or("OPENAI_API_KEY");
        match std::env::var(key_var) {
            Ok(api_key) => {
                let openai = OpenAiProvider::new(OpenAiConfig {
                    api_key,
                    base_url: base_url.clone(),
                    embedding_model: cfg.model.clone(),
                    dimension: cfg.dimension,
                    timeout: Duration::from_millis(cfg.timeout_ms),
                });
                match openai {
                    Ok(p) => registry = registry.with_embedding("openai", Arc::new(p)),
                    Err(e) => tracing::warn!("openai backend not registered: {}", e),
                }
            }
            Err(_) => tracing::warn!("{} not set; openai backend not registered", key_var),
        }
    }

    registry.set_preferred_embedding(&cfg.provider)
}

/// Wraps an embedding backend with batching, a per-call timeout and
/// bounded retries.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    timeout: Duration,
    max_attempts: u32,
    backoff: Duration,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, cfg: &EmbeddingConfig) -> Self {
        Self {
            provider,
            batch_size: cfg.batch_size.max(1),
            timeout: Duration::from_millis(cfg.timeout_ms),
            max_attempts: cfg.max_attempts.max(1),
            backoff: Duration::from_millis(cfg.backoff_ms),
        }
    }

    pub fn from_config(registry: &ProviderRegistry, cfg: &EmbeddingConfig) -> Result<Self> {
        let provider = registry.embedding(Some(&cfg.provider))?;
        if provider.dimension() != cfg.dimension {
            return Err(EnrichError::Config(format!(
                "backend {} produces {} dimensions, configured {}",
                cfg.provider,
                provider.dimension(),
                cfg.dimension
            )));
        }
        Ok(Self::new(provider, cfg))
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    pub async fn embed(&self, unit: &TextUnit) -> Result<Embedding> {
        let mut out = self.embed_batch(std::slice::from_ref(unit)).await?;
        out.pop()
            .ok_or_else(|| EnrichError::ModelUnavailable("backend returned no vectors".into()))
    }

    /// Embeds `units` in order; the i-th result belongs to the i-th unit.
    pub async fn embed_batch(&self, units: &[TextUnit]) -> Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(units.len());
        for batch in units.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|u| u.text.clone()).collect();
            let vectors = self.call_with_retry(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(EnrichError::ModelUnavailable(format!(
                    "backend returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            for (unit, vector) in batch.iter().zip(vectors) {
                if vector.len() != self.dimension() {
                    return Err(EnrichError::DimensionMismatch {
                        expected: self.dimension(),
                        actual: vector.len(),
                    });
                }
                out.push(Embedding {
                    key: unit.key(),
                    dimension: vector.len(),
                    vector,
                    model_id: self.model_id().to_string(),
                });
            }
        }
        Ok(out)
    }

    async fn call_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut delay = self.backoff;
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match tokio::time::timeout(self.timeout, self.provider.embed(texts)).await {
                Ok(Ok(resp)) => return Ok(resp.vectors),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("timed out after {:?}", self.timeout),
            }
            if attempt < self.max_attempts {
                tracing::debug!(attempt, error = %last_error, "embedding call failed; retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        Err(EnrichError::ModelUnavailable(format!(
            "{} after {} attempts: {}",
            self.model_id(),
            self.max_attempts,
            last_error
        )))
    }
}
