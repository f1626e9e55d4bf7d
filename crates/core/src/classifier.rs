use crate::cluster::ClusterModel;
use crate::config::ClassificationConfig;
use crate::models::{
    Classification, ClassificationVote, ClusterId, Source, VoteKind, OUTLIER_CLUSTER,
};
use crate::registry::Registry;
use crate::rules::{lexical_vote, LexicalRule, RuleContext};
use crate::vectorstore::IndexSnapshot;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationOutcome {
    pub source_id: String,
    pub label: Classification,
    pub confidence: f32,
    pub votes: Vec<ClassificationVote>,
    pub cluster_id: Option<ClusterId>,
    pub topics: BTreeSet<String>,
}

/// Collects lexical, neighbour and cluster votes per source.
///
/// Only manually labelled sources count as ground truth for neighbour and
/// cluster votes, so earlier inference never feeds back into later passes.
pub struct Classifier<'a> {
    cfg: &'a ClassificationConfig,
    rules: &'a [LexicalRule],
    topic_tags: usize,
}

impl<'a> Classifier<'a> {
    pub fn new(cfg: &'a ClassificationConfig, rules: &'a [LexicalRule], topic_tags: usize) -> Self {
        Self {
            cfg,
            rules,
            topic_tags,
        }
    }

    /// Computes what inference would say about `source`. For manual
    /// sources the result is advisory; the reconciler never applies it.
    pub fn classify(
        &self,
        source: &Source,
        registry: &Registry,
        snapshot: &IndexSnapshot,
        model: Option<&ClusterModel>,
    ) -> ClassificationOutcome {
        let mut votes = Vec::new();
        if self.cfg.lexical_weight > 0.0 {
            if let Some(v) = lexical_vote(
                self.rules,
                &RuleContext::for_source(source),
                self.cfg.lexical_weight,
            ) {
                votes.push(v);
            }
        }
        if self.cfg.neighbor_weight > 0.0 {
            votes.extend(self.neighbor_vote(source, registry, snapshot));
        }
        let cluster_id = model.and_then(|m| m.cluster_of(&source.id));
        if self.cfg.cluster_weight > 0.0 {
            if let (Some(m), Some(c)) = (model, cluster_id) {
                votes.extend(self.cluster_vote(source, registry, m, c));
            }
        }

        let (label, confidence) = resolve(&votes, self.cfg);
        let topics = model
            .map(|m| m.topics_for(&source.id, self.topic_tags))
            .unwrap_or_default();
        tracing::debug!(
            source_id = %source.id,
            label = %label,
            confidence,
            votes = votes.len(),
            "classified source"
        );
        ClassificationOutcome {
            source_id: source.id.clone(),
            label,
            confidence,
            votes,
            cluster_id,
            topics,
        }
    }

    pub fn classify_all<'s>(
        &self,
        ids: impl IntoIterator<Item = &'s str>,
        registry: &Registry,
        snapshot: &IndexSnapshot,
        model: Option<&ClusterModel>,
    ) -> Vec<ClassificationOutcome> {
        ids.into_iter()
            .filter_map(|id| registry.get(id))
            .map(|s| self.classify(s, registry, snapshot, model))
            .collect()
    }

    fn neighbor_vote(
        &self,
        source: &Source,
        registry: &Registry,
        snapshot: &IndexSnapshot,
    ) -> Option<ClassificationVote> {
        let labelled = |id: &str| {
            id != source.id
                && registry
                    .get(id)
                    .is_some_and(|o| o.is_manual() && o.classification != Classification::Unknown)
        };
        let mut best: HashMap<String, f32> = HashMap::new();
        for unit in snapshot.units_of(&source.id) {
            let hits = snapshot
                .nearest_sources(&unit.vector, self.cfg.neighbors_k, self.cfg.min_similarity, labelled)
                .unwrap_or_default();
            for (id, similarity) in hits {
                let slot = best.entry(id).or_insert(similarity);
                if similarity > *slot {
                    *slot = similarity;
                }
            }
        }

        let mut ranked: Vec<(String, f32)> = best.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(self.cfg.neighbors_k);

        let labels = ranked
            .iter()
            .filter_map(|(id, _)| registry.get(id).map(|s| s.classification));
        let (label, agreeing, total) = majority(labels)?;
        let names: Vec<&str> = ranked.iter().map(|(id, _)| id.as_str()).collect();
        Some(ClassificationVote {
            kind: VoteKind::Neighbor,
            label,
            weight: self.cfg.neighbor_weight * agreeing as f32 / total as f32,
            detail: format!("{}/{} nearest labelled: {}", agreeing, total, names.join(",")),
        })
    }

    fn cluster_vote(
        &self,
        source: &Source,
        registry: &Registry,
        model: &ClusterModel,
        cluster_id: ClusterId,
    ) -> Option<ClassificationVote> {
        if cluster_id == OUTLIER_CLUSTER {
            return None;
        }
        let cluster = model.cluster(cluster_id)?;
        let labels = cluster
            .members
            .iter()
            .filter(|id| **id != source.id)
            .filter_map(|id| registry.get(id))
            .filter(|s| s.is_manual() && s.classification != Classification::Unknown)
            .map(|s| s.classification);
        let (label, agreeing, total) = majority(labels)?;
        Some(ClassificationVote {
            kind: VoteKind::ClusterMajority,
            label,
            weight: self.cfg.cluster_weight * agreeing as f32 / total as f32,
            detail: format!("{}/{} labelled members of cluster {}", agreeing, total, cluster_id),
        })
    }
}

/// Most common label with its count and the total; ties go to the label
/// with the lower tie rank.
fn majority(labels: impl Iterator<Item = Classification>) -> Option<(Classification, usize, usize)> {
    let mut counts: BTreeMap<Classification, usize> = BTreeMap::new();
    let mut total = 0usize;
    for label in labels {
        *counts.entry(label).or_default() += 1;
        total += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.tie_rank().cmp(&a.0.tie_rank())))
        .map(|(label, n)| (label, n, total))
}

fn base_weight(kind: VoteKind, cfg: &ClassificationConfig) -> f32 {
    match kind {
        VoteKind::Manual => 1.0,
        VoteKind::Lexical => cfg.lexical_weight,
        VoteKind::Neighbor => cfg.neighbor_weight,
        VoteKind::ClusterMajority => cfg.cluster_weight,
    }
}

/// Final label is the highest-priority vote's label. Confidence is the
/// weight agreeing with it over the full weight of every vote that fired,
/// so it reaches 1.0 only when all signals agree without dissent.
pub fn resolve(votes: &[ClassificationVote], cfg: &ClassificationConfig) -> (Classification, f32) {
    let Some(lead) = votes.iter().min_by_key(|v| v.kind.priority()) else {
        return (Classification::Unknown, 0.0);
    };
    let total: f32 = votes.iter().map(|v| base_weight(v.kind, cfg)).sum();
    if total <= 0.0 {
        return (Classification::Unknown, 0.0);
    }
    let agreeing: f32 = votes
        .iter()
        .filter(|v| v.label == lead.label)
        .map(|v| v.weight)
        .sum();
    (lead.label, (agreeing / total).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReductionConfig;
    use crate::models::{Embedding, Provenance, UnitKey};
    use crate::rules::default_rules;
    use crate::vectorstore::VectorIndex;

    fn vote(kind: VoteKind, label: Classification, weight: f32) -> ClassificationVote {
        ClassificationVote {
            kind,
            label,
            weight,
            detail: String::new(),
        }
    }

    #[test]
    fn resolve_follows_priority_and_agreement() {
        let cfg = ClassificationConfig::default();
        assert_eq!(resolve(&[], &cfg), (Classification::Unknown, 0.0));

        let unanimous = [
            vote(VoteKind::ClusterMajority, Classification::NonProfit, 1.0),
            vote(VoteKind::Lexical, Classification::NonProfit, 1.0),
            vote(VoteKind::Neighbor, Classification::NonProfit, 1.0),
        ];
        assert_eq!(resolve(&unanimous, &cfg), (Classification::NonProfit, 1.0));

        let split = [
            vote(VoteKind::Neighbor, Classification::ForProfit, 1.0),
            vote(VoteKind::Lexical, Classification::Government, 1.0),
        ];
        let (label, conf) = resolve(&split, &cfg);
        assert_eq!(label, Classification::Government);
        assert!((conf - 0.5).abs() < 1e-6);

        let partial = [vote(VoteKind::Neighbor, Classification::NonProfit, 0.6)];
        let (_, conf) = resolve(&partial, &cfg);
        assert!((conf - 0.6).abs() < 1e-6);
    }

    #[test]
    fn majority_ties_use_tie_rank() {
        let labels = [Classification::ForProfit, Classification::Government];
        assert_eq!(
            majority(labels.into_iter()),
            Some((Classification::Government, 1, 2))
        );
        assert_eq!(majority(std::iter::empty()), None);
    }

    struct Fixture {
        registry: Registry,
        index: VectorIndex,
    }

    fn fixture() -> Fixture {
        let mut registry = Registry::new("reg.csv");
        let rows = [
            ("alpha", "Alpha Collective", Provenance::Manual, Classification::NonProfit, [1.0, 0.0, 0.0]),
            ("beta", "Beta Collective", Provenance::Inferred, Classification::Unknown, [0.99, 0.05, 0.0]),
            ("gamma", "Gamma Group", Provenance::Inferred, Classification::ForProfit, [0.98, 0.0, 0.1]),
            ("delta", "Delta Office", Provenance::Manual, Classification::Government, [0.0, 0.0, 1.0]),
        ];
        let index = VectorIndex::new();
        for (id, name, prov, label, v) in rows {
            let mut s = Source::new(id, name);
            s.provenance = prov;
            s.classification = label;
            registry.insert(s).unwrap();
            index
                .insert(Embedding {
                    key: UnitKey {
                        source_id: id.into(),
                        unit_index: 0,
                    },
                    dimension: 3,
                    vector: v.to_vec(),
                    model_id: "m".into(),
                })
                .unwrap();
        }
        Fixture { registry, index }
    }

    #[test]
    fn neighbours_only_count_manual_labels() {
        let f = fixture();
        let cfg = ClassificationConfig::default();
        let rules = default_rules().unwrap();
        let classifier = Classifier::new(&cfg, &rules, 3);
        let snap = f.index.snapshot();

        let beta = classifier.classify(f.registry.get("beta").unwrap(), &f.registry, &snap, None);
        assert_eq!(beta.label, Classification::NonProfit);
        assert_eq!(beta.confidence, 1.0);
        assert_eq!(beta.votes.len(), 1);
        assert_eq!(beta.votes[0].kind, VoteKind::Neighbor);
        // gamma is similar too but carries an inferred label
        assert!(!beta.votes[0].detail.contains("gamma"));

        // a manual source never votes for itself
        let alpha = classifier.classify(f.registry.get("alpha").unwrap(), &f.registry, &snap, None);
        assert_eq!(alpha.label, Classification::Unknown);
        assert_eq!(alpha.confidence, 0.0);
    }

    #[test]
    fn many_units_of_one_source_do_not_crowd_out_neighbours() {
        let mut f = fixture();
        for i in 1..6 {
            f.index
                .insert(Embedding {
                    key: UnitKey {
                        source_id: "alpha".into(),
                        unit_index: i,
                    },
                    dimension: 3,
                    vector: vec![1.0, 0.01 * i as f32, 0.0],
                    model_id: "m".into(),
                })
                .unwrap();
        }
        let mut eps = Source::new("epsilon", "Epsilon Bureau");
        eps.provenance = Provenance::Manual;
        eps.classification = Classification::Government;
        f.registry.insert(eps).unwrap();
        f.index
            .insert(Embedding {
                key: UnitKey {
                    source_id: "epsilon".into(),
                    unit_index: 0,
                },
                dimension: 3,
                vector: vec![0.97, 0.1, 0.05],
                model_id: "m".into(),
            })
            .unwrap();

        let cfg = ClassificationConfig {
            neighbors_k: 2,
            ..ClassificationConfig::default()
        };
        let classifier = Classifier::new(&cfg, &[], 3);
        let beta = classifier.classify(f.registry.get("beta").unwrap(), &f.registry, &f.index.snapshot(), None);
        let detail = &beta.votes[0].detail;
        assert!(detail.starts_with("1/2 "), "{}", detail);
        assert!(detail.contains("alpha") && detail.contains("epsilon"));
        assert_eq!(beta.label, Classification::Government);
    }

    #[test]
    fn lexical_outranks_neighbours() {
        let f = fixture();
        let cfg = ClassificationConfig::default();
        let rules = default_rules().unwrap();
        let classifier = Classifier::new(&cfg, &rules, 3);
        let mut registry = f.registry.clone();
        registry.get_mut("beta").unwrap().name = "Beta Daily News".into();
        let out = classifier.classify(registry.get("beta").unwrap(), &registry, &f.index.snapshot(), None);
        assert_eq!(out.label, Classification::ForProfit);
        assert!((out.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn cluster_majority_votes_and_topics() {
        let f = fixture();
        let cfg = ClassificationConfig {
            neighbor_weight: 0.0,
            ..ClassificationConfig::default()
        };
        let rules = default_rules().unwrap();
        let classifier = Classifier::new(&cfg, &rules, 2);
        let snap = f.index.snapshot();

        let vectors = crate::reducer::source_vectors(&snap);
        let mut texts = BTreeMap::new();
        for id in ["alpha", "beta", "gamma"] {
            texts.insert(id.to_string(), "community grants volunteers".to_string());
        }
        texts.insert("delta".to_string(), "permits licensing".to_string());
        let model = ClusterModel::fit(
            &vectors,
            &texts,
            &ReductionConfig {
                intermediate_dims: 3,
                seed: Some(1),
                min_cluster_size: 2,
                eps: Some(0.3),
                signature_terms: 4,
                topic_tags: 2,
            },
            1,
            "m",
        );

        let beta = classifier.classify(f.registry.get("beta").unwrap(), &f.registry, &snap, Some(&model));
        assert_eq!(beta.cluster_id, model.cluster_of("alpha"));
        assert_eq!(beta.votes.len(), 1);
        assert_eq!(beta.votes[0].kind, VoteKind::ClusterMajority);
        assert_eq!(beta.label, Classification::NonProfit);
        assert_eq!(beta.topics.len(), 2);

        let delta = classifier.classify(f.registry.get("delta").unwrap(), &f.registry, &snap, Some(&model));
        assert_eq!(delta.cluster_id, Some(OUTLIER_CLUSTER));
        assert!(delta.topics.is_empty());
    }
}
