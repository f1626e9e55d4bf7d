//! Density clustering over reduced source coordinates.
//!
//! Cold runs fit a fresh [`ClusterModel`]; warm runs extend the persisted
//! one, keeping prior assignments and attaching new sources to the cluster
//! of their nearest member when it lies within `eps`.

use crate::config::ReductionConfig;
use crate::error::{EnrichError, Result};
use crate::models::{Cluster, ClusterId, OUTLIER_CLUSTER};
use crate::reducer::Reduction;
use crate::registry::write_atomic;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "are", "was", "were", "its", "our",
    "their", "has", "have", "had", "not", "but", "all", "any", "can", "will", "who", "which",
    "what", "about", "into", "more", "also", "than", "other", "such", "been", "they", "them",
    "these", "those", "there", "here", "his", "her", "she", "you", "your", "over", "under",
    "out", "one", "two", "may", "each", "per", "via", "upon", "within", "between", "through",
    "most", "many", "while", "where", "when", "how", "both", "only", "new", "now",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterModel {
    pub seed: u64,
    pub model_id: String,
    pub eps: f32,
    pub min_points: usize,
    pub reduction: Reduction,
    pub clusters: Vec<Cluster>,
    pub assignments: BTreeMap<String, ClusterId>,
}

impl ClusterModel {
    /// Fits reduction and clustering from scratch.
    pub fn fit(
        vectors: &BTreeMap<String, Vec<f32>>,
        texts: &BTreeMap<String, String>,
        cfg: &ReductionConfig,
        seed: u64,
        model_id: &str,
    ) -> Self {
        let reduction = Reduction::fit(vectors, cfg.intermediate_dims, seed);
        let min_points = cfg.min_cluster_size;
        let eps = cfg
            .eps
            .unwrap_or_else(|| auto_eps(&reduction.coordinates, min_points));
        let assignments = dbscan(&reduction.coordinates, eps, min_points);
        let mut model = Self {
            seed,
            model_id: model_id.to_string(),
            eps,
            min_points,
            reduction,
            clusters: Vec::new(),
            assignments,
        };
        model.rebuild_clusters(texts, cfg.signature_terms);
        tracing::info!(
            clusters = model.cluster_count(),
            outliers = model.outlier_count(),
            eps = model.eps,
            "fitted cluster model"
        );
        model
    }

    /// Extends a persisted model with the current source set. Sources absent
    /// from `vectors` are dropped; known ones keep their cluster.
    pub fn extend(
        mut self,
        vectors: &BTreeMap<String, Vec<f32>>,
        texts: &BTreeMap<String, String>,
        cfg: &ReductionConfig,
    ) -> Self {
        self.assignments.retain(|id, _| vectors.contains_key(id));
        self.reduction.coordinates.retain(|id, _| vectors.contains_key(id));
        self.reduction.layout.retain(|id, _| vectors.contains_key(id));

        let mut added = 0usize;
        for (id, vector) in vectors {
            if self.assignments.contains_key(id) {
                continue;
            }
            let (coords, layout) = self.reduction.place(vector);
            let cluster = self.nearest_member_cluster(&coords);
            self.reduction.coordinates.insert(id.clone(), coords);
            self.reduction.layout.insert(id.clone(), layout);
            self.assignments.insert(id.clone(), cluster);
            added += 1;
        }
        self.rebuild_clusters(texts, cfg.signature_terms);
        tracing::info!(added, clusters = self.cluster_count(), "extended cluster model");
        self
    }

    /// True when this model was fitted under the given seed and embedding model.
    pub fn compatible(&self, seed: u64, model_id: &str) -> bool {
        self.seed == seed && self.model_id == model_id
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)?;
        let model = serde_json::from_str(&raw).map_err(|e| {
            EnrichError::Registry(format!("cluster model {}: {}", path.display(), e))
        })?;
        Ok(Some(model))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| EnrichError::Registry(format!("serialize cluster model: {}", e)))?;
        write_atomic(path, &json)
    }

    pub fn cluster_of(&self, source_id: &str) -> Option<ClusterId> {
        self.assignments.get(source_id).copied()
    }

    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.id == id)
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.iter().filter(|c| !c.is_outlier()).count()
    }

    pub fn outlier_count(&self) -> usize {
        self.assignments
            .values()
            .filter(|c| **c == OUTLIER_CLUSTER)
            .count()
    }

    /// Topical tags for a source: the first `n` signature terms of its
    /// cluster. Outliers carry none.
    pub fn topics_for(&self, source_id: &str, n: usize) -> BTreeSet<String> {
        self.cluster_of(source_id)
            .and_then(|id| self.cluster(id))
            .filter(|c| !c.is_outlier())
            .map(|c| c.signature.iter().take(n).cloned().collect())
            .unwrap_or_default()
    }

    fn nearest_member_cluster(&self, coords: &[f32]) -> ClusterId {
        let mut best: Option<(f32, &String)> = None;
        for (id, point) in &self.reduction.coordinates {
            match self.assignments.get(id) {
                Some(c) if *c != OUTLIER_CLUSTER => {}
                _ => continue,
            }
            let d = euclidean(coords, point);
            if d <= self.eps && best.map_or(true, |(bd, _)| d < bd) {
                best = Some((d, id));
            }
        }
        best.and_then(|(_, id)| self.assignments.get(id).copied())
            .unwrap_or(OUTLIER_CLUSTER)
    }

    fn rebuild_clusters(&mut self, texts: &BTreeMap<String, String>, signature_terms: usize) {
        let mut members: BTreeMap<ClusterId, BTreeSet<String>> = BTreeMap::new();
        for (id, cluster) in &self.assignments {
            members.entry(*cluster).or_default().insert(id.clone());
        }
        let signatures = signatures(texts, &members, signature_terms);
        self.clusters = members
            .into_iter()
            .map(|(id, members)| {
                let points: Vec<&Vec<f32>> = members
                    .iter()
                    .filter_map(|m| self.reduction.coordinates.get(m))
                    .collect();
                Cluster {
                    id,
                    centroid: centroid(&points),
                    signature: signatures.get(&id).cloned().unwrap_or_default(),
                    members,
                }
            })
            .collect();
    }
}

pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

fn centroid(points: &[&Vec<f32>]) -> Vec<f32> {
    let Some(first) = points.first() else {
        return Vec::new();
    };
    let mut out = vec![0f32; first.len()];
    for p in points {
        for (o, v) in out.iter_mut().zip(p.iter()) {
            *o += v;
        }
    }
    for o in out.iter_mut() {
        *o /= points.len() as f32;
    }
    out
}

/// Median distance from each point to its `(min_points - 1)`-th nearest
/// neighbour.
pub fn auto_eps(points: &BTreeMap<String, Vec<f32>>, min_points: usize) -> f32 {
    let k = min_points.saturating_sub(1).max(1);
    let all: Vec<&Vec<f32>> = points.values().collect();
    let mut kth: Vec<f32> = Vec::with_capacity(all.len());
    for (i, p) in all.iter().enumerate() {
        let mut d: Vec<f32> = all
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, q)| euclidean(p, q))
            .collect();
        if d.len() < k {
            continue;
        }
        d.sort_by(|a, b| a.total_cmp(b));
        kth.push(d[k - 1]);
    }
    if kth.is_empty() {
        return 0.0;
    }
    kth.sort_by(|a, b| a.total_cmp(b));
    kth[(kth.len() - 1) / 2]
}

/// DBSCAN. Points are visited in key order and clusters are numbered in
/// discovery order; noise is assigned to [`OUTLIER_CLUSTER`].
pub fn dbscan(
    points: &BTreeMap<String, Vec<f32>>,
    eps: f32,
    min_points: usize,
) -> BTreeMap<String, ClusterId> {
    let ids: Vec<&String> = points.keys().collect();
    let coords: Vec<&Vec<f32>> = points.values().collect();
    let n = ids.len();
    let region = |i: usize| -> Vec<usize> {
        (0..n)
            .filter(|&j| euclidean(coords[i], coords[j]) <= eps)
            .collect()
    };

    let mut labels: Vec<Option<ClusterId>> = vec![None; n];
    let mut next: ClusterId = 0;
    for i in 0..n {
        if labels[i].is_some() {
            continue;
        }
        let seeds = region(i);
        if seeds.len() < min_points {
            labels[i] = Some(OUTLIER_CLUSTER);
            continue;
        }
        let cluster = next;
        next += 1;
        labels[i] = Some(cluster);
        let mut queue: VecDeque<usize> = seeds.into_iter().filter(|&j| j != i).collect();
        while let Some(j) = queue.pop_front() {
            match labels[j] {
                Some(OUTLIER_CLUSTER) => {
                    labels[j] = Some(cluster);
                    continue;
                }
                Some(_) => continue,
                None => {}
            }
            labels[j] = Some(cluster);
            let neighbours = region(j);
            if neighbours.len() >= min_points {
                queue.extend(neighbours);
            }
        }
    }

    ids.into_iter()
        .zip(labels)
        .map(|(id, label)| (id.clone(), label.unwrap_or(OUTLIER_CLUSTER)))
        .collect()
}

pub fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|t| t.to_lowercase())
        .filter(|t| t.chars().count() >= 3)
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Ranked signature terms per non-outlier cluster: cluster-level term
/// frequency times inverse cluster frequency.
pub fn signatures(
    texts: &BTreeMap<String, String>,
    members: &BTreeMap<ClusterId, BTreeSet<String>>,
    limit: usize,
) -> BTreeMap<ClusterId, Vec<String>> {
    let mut tf: BTreeMap<ClusterId, HashMap<String, f32>> = BTreeMap::new();
    let mut df: HashMap<String, usize> = HashMap::new();
    for (cluster, ids) in members {
        if *cluster == OUTLIER_CLUSTER {
            continue;
        }
        let mut counts: HashMap<String, f32> = HashMap::new();
        let mut total = 0f32;
        for id in ids {
            if let Some(text) = texts.get(id) {
                for term in terms(text) {
                    *counts.entry(term).or_default() += 1.0;
                    total += 1.0;
                }
            }
        }
        if total > 0.0 {
            for v in counts.values_mut() {
                *v /= total;
            }
        }
        for term in counts.keys() {
            *df.entry(term.clone()).or_default() += 1;
        }
        tf.insert(*cluster, counts);
    }

    let n = tf.len() as f32;
    tf.into_iter()
        .map(|(cluster, counts)| {
            let mut scored: Vec<(String, f32)> = counts
                .into_iter()
                .map(|(term, f)| {
                    let idf = ((1.0 + n) / (1.0 + df[&term] as f32)).ln() + 1.0;
                    (term, f * idf)
                })
                .collect();
            scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            (
                cluster,
                scored.into_iter().take(limit).map(|(t, _)| t).collect(),
            )
        })
        .collect()
}
