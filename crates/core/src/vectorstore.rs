//! In-memory vector index keyed by (source id, unit index).
//!
//! Readers take a cheap `Arc` snapshot and never block writers; writers are
//! serialized and publish a new snapshot only after a whole batch validated,
//! so a query never observes a source half-replaced.

use crate::error::{EnrichError, Result};
use crate::models::{Embedding, UnitKey};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub key: UnitKey,
    pub vector: Vec<f32>,
    seq: u64,
}

impl IndexEntry {
    /// Insertion sequence; used to break similarity ties.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub key: UnitKey,
    pub similarity: f32,
}

#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    model_id: Option<String>,
    dimension: Option<usize>,
    entries: BTreeMap<UnitKey, IndexEntry>,
    next_seq: u64,
}

impl IndexSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn get(&self, key: &UnitKey) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    /// All entries ordered by key.
    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    pub fn source_ids(&self) -> BTreeSet<String> {
        self.entries.keys().map(|k| k.source_id.clone()).collect()
    }

    pub fn units_of<'a>(&'a self, source_id: &'a str) -> impl Iterator<Item = &'a IndexEntry> + 'a {
        self.entries
            .values()
            .filter(move |e| e.key.source_id == source_id)
    }

    /// Top `k` entries by cosine similarity to `query`, ties broken by
    /// insertion order.
    pub fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if let Some(dim) = self.dimension {
            if query.len() != dim {
                return Err(EnrichError::DimensionMismatch {
                    expected: dim,
                    actual: query.len(),
                });
            }
        }
        let mut scored: Vec<(f32, u64, &UnitKey)> = self
            .entries
            .values()
            .map(|e| (cosine(query, &e.vector), e.seq, &e.key))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(similarity, _, key)| Neighbor {
                key: key.clone(),
                similarity,
            })
            .collect())
    }

    /// The `k` sources whose best unit is most similar to `query`, among
    /// sources accepted by `accept` and at or above `min_similarity`. Ties
    /// go to the lower source id. Only the winners are sorted.
    pub fn nearest_sources(
        &self,
        query: &[f32],
        k: usize,
        min_similarity: f32,
        accept: impl Fn(&str) -> bool,
    ) -> Result<Vec<(String, f32)>> {
        if let Some(dim) = self.dimension {
            if query.len() != dim {
                return Err(EnrichError::DimensionMismatch {
                    expected: dim,
                    actual: query.len(),
                });
            }
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut best: HashMap<&str, f32> = HashMap::new();
        let mut verdicts: HashMap<&str, bool> = HashMap::new();
        for entry in self.entries.values() {
            let id = entry.key.source_id.as_str();
            if !*verdicts.entry(id).or_insert_with(|| accept(id)) {
                continue;
            }
            let similarity = cosine(query, &entry.vector);
            if similarity < min_similarity {
                continue;
            }
            let slot = best.entry(id).or_insert(similarity);
            if similarity > *slot {
                *slot = similarity;
            }
        }

        let mut ranked: Vec<(&str, f32)> = best.into_iter().collect();
        if ranked.len() > k {
            ranked.select_nth_unstable_by(k - 1, by_similarity);
            ranked.truncate(k);
        }
        ranked.sort_by(by_similarity);
        Ok(ranked
            .into_iter()
            .map(|(id, similarity)| (id.to_string(), similarity))
            .collect())
    }

    fn check(&mut self, emb: &Embedding) -> Result<()> {
        if emb.vector.len() != emb.dimension {
            return Err(EnrichError::DimensionMismatch {
                expected: emb.dimension,
                actual: emb.vector.len(),
            });
        }
        match &self.model_id {
            Some(model) if model != &emb.model_id => {
                return Err(EnrichError::ModelMismatch {
                    expected: model.clone(),
                    actual: emb.model_id.clone(),
                })
            }
            Some(_) => {}
            None => self.model_id = Some(emb.model_id.clone()),
        }
        match self.dimension {
            Some(dim) if dim != emb.dimension => Err(EnrichError::DimensionMismatch {
                expected: dim,
                actual: emb.dimension,
            }),
            Some(_) => Ok(()),
            None => {
                self.dimension = Some(emb.dimension);
                Ok(())
            }
        }
    }

    fn put(&mut self, emb: Embedding, seq: Option<u64>) {
        let seq = seq.unwrap_or_else(|| {
            let s = self.next_seq;
            self.next_seq += 1;
            s
        });
        self.entries.insert(
            emb.key.clone(),
            IndexEntry {
                key: emb.key,
                vector: emb.vector,
                seq,
            },
        );
    }
}

#[derive(Default)]
pub struct VectorIndex {
    writer: Mutex<()>,
    current: RwLock<Arc<IndexSnapshot>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.current.read().clone()
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts one embedding; an existing entry for the same key is replaced
    /// and keeps its original position in the tie-break order.
    pub fn insert(&self, emb: Embedding) -> Result<()> {
        self.write(|snap| {
            snap.check(&emb)?;
            let seq = snap.entries.get(&emb.key).map(|e| e.seq);
            snap.put(emb, seq);
            Ok(())
        })
    }

    /// Replaces every unit of `source_id` with `embeddings` in one step.
    pub fn replace_source(&self, source_id: &str, embeddings: Vec<Embedding>) -> Result<()> {
        self.write(|snap| {
            for emb in &embeddings {
                if emb.key.source_id != source_id {
                    return Err(EnrichError::Config(format!(
                        "embedding for {} passed while replacing {}",
                        emb.key.source_id, source_id
                    )));
                }
                snap.check(emb)?;
            }
            let old: BTreeMap<UnitKey, u64> = snap
                .entries
                .iter()
                .filter(|(k, _)| k.source_id == source_id)
                .map(|(k, e)| (k.clone(), e.seq))
                .collect();
            snap.entries.retain(|k, _| k.source_id != source_id);
            for emb in embeddings {
                let seq = old.get(&emb.key).copied();
                snap.put(emb, seq);
            }
            Ok(())
        })
    }

    /// Removes every unit of `source_id`, returning how many were dropped.
    pub fn remove_source(&self, source_id: &str) -> Result<usize> {
        self.write(|snap| {
            let before = snap.entries.len();
            snap.entries.retain(|k, _| k.source_id != source_id);
            let removed = before - snap.entries.len();
            if removed == 0 {
                return Err(EnrichError::NotFound(format!("source {} in index", source_id)));
            }
            Ok(removed)
        })
    }

    pub fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.snapshot().nearest(query, k)
    }

    fn write<T>(&self, f: impl FnOnce(&mut IndexSnapshot) -> Result<T>) -> Result<T> {
        let _guard = self.writer.lock();
        let mut next = IndexSnapshot::clone(&self.current.read());
        let out = f(&mut next)?;
        *self.current.write() = Arc::new(next);
        Ok(out)
    }
}

fn by_similarity(a: &(&str, f32), b: &(&str, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0))
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0f32;
    let mut na = 0f32;
    let mut nb = 0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}
