use crate::classifier::ClassificationOutcome;
use crate::config::ReconcileConfig;
use crate::models::{Classification, Source};
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const CONFIDENCE_EPSILON: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    /// First label for a previously unknown source.
    Inferred,
    Relabeled,
    ConfidenceUpdated,
    TopicsUpdated,
    /// A flip was held back and proposed for review instead.
    FlaggedForReview,
    ReviewCleared,
    /// Inference disagrees with a manual label.
    ManualConflict,
}

impl ChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeReason::Inferred => "inferred",
            ChangeReason::Relabeled => "relabeled",
            ChangeReason::ConfidenceUpdated => "confidence_updated",
            ChangeReason::TopicsUpdated => "topics_updated",
            ChangeReason::FlaggedForReview => "flagged_for_review",
            ChangeReason::ReviewCleared => "review_cleared",
            ChangeReason::ManualConflict => "manual_conflict",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeLogEntry {
    pub source_id: String,
    pub old_label: Classification,
    pub new_label: Classification,
    pub old_confidence: f32,
    pub new_confidence: f32,
    pub reason: ChangeReason,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub entries: Vec<ChangeLogEntry>,
    pub changed: usize,
    pub flagged: usize,
    pub conflicts: usize,
}

/// Merges classifier outcomes into the registry. The only writer of
/// source classifications during a run.
pub struct Reconciler {
    cfg: ReconcileConfig,
}

impl Reconciler {
    pub fn new(cfg: ReconcileConfig) -> Self {
        Self { cfg }
    }

    pub fn reconcile(
        &self,
        registry: &mut Registry,
        outcomes: &[ClassificationOutcome],
        now: DateTime<Utc>,
    ) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        for outcome in outcomes {
            let Some(source) = registry.get_mut(&outcome.source_id) else {
                continue;
            };
            let entry = if source.is_manual() {
                self.reconcile_manual(source, outcome, now)
            } else {
                self.reconcile_inferred(source, outcome, now)
            };
            if let Some(entry) = entry {
                match entry.reason {
                    ChangeReason::FlaggedForReview => summary.flagged += 1,
                    ChangeReason::ManualConflict => summary.conflicts += 1,
                    _ => {}
                }
                tracing::info!(
                    source_id = %entry.source_id,
                    reason = entry.reason.as_str(),
                    old = %entry.old_label,
                    new = %entry.new_label,
                    "registry change"
                );
                summary.changed += 1;
                summary.entries.push(entry);
            }
        }
        summary
    }

    fn reconcile_manual(
        &self,
        source: &mut Source,
        outcome: &ClassificationOutcome,
        now: DateTime<Utc>,
    ) -> Option<ChangeLogEntry> {
        let disagrees =
            outcome.label != Classification::Unknown && outcome.label != source.classification;
        let (reason, detail) = if disagrees {
            if source.review == Some(outcome.label) {
                return None;
            }
            source.review = Some(outcome.label);
            (
                ChangeReason::ManualConflict,
                format!(
                    "inference suggests {} ({:.2}); manual label kept",
                    outcome.label, outcome.confidence
                ),
            )
        } else if source.review.is_some() {
            source.review = None;
            (
                ChangeReason::ReviewCleared,
                "inference no longer disagrees with manual label".to_string(),
            )
        } else {
            return None;
        };
        source.last_updated = now;
        Some(ChangeLogEntry {
            source_id: source.id.clone(),
            old_label: source.classification,
            new_label: outcome.label,
            old_confidence: source.confidence,
            new_confidence: source.confidence,
            reason,
            detail,
            timestamp: now,
        })
    }

    fn reconcile_inferred(
        &self,
        source: &mut Source,
        outcome: &ClassificationOutcome,
        now: DateTime<Utc>,
    ) -> Option<ChangeLogEntry> {
        let old_label = source.classification;
        let old_confidence = source.confidence;
        let mut notes: Vec<String> = Vec::new();
        let mut reason: Option<ChangeReason> = None;

        let flip = old_label != Classification::Unknown
            && outcome.label != old_label
            && old_confidence - outcome.confidence > self.cfg.review_confidence_drop;

        if flip {
            if source.review != Some(outcome.label) {
                source.review = Some(outcome.label);
                reason = Some(ChangeReason::FlaggedForReview);
                notes.push(format!(
                    "proposed {} at {:.2} would drop confidence from {:.2}",
                    outcome.label, outcome.confidence, old_confidence
                ));
            }
        } else {
            if outcome.label != old_label {
                source.classification = outcome.label;
                reason = Some(if old_label == Classification::Unknown {
                    ChangeReason::Inferred
                } else {
                    ChangeReason::Relabeled
                });
                notes.push(format!("{} -> {}", old_label, outcome.label));
            }
            if (outcome.confidence - old_confidence).abs() > CONFIDENCE_EPSILON {
                source.confidence = outcome.confidence;
                reason.get_or_insert(ChangeReason::ConfidenceUpdated);
                notes.push(format!("confidence {:.2} -> {:.2}", old_confidence, outcome.confidence));
            }
            if source.review.take().is_some() {
                reason.get_or_insert(ChangeReason::ReviewCleared);
                notes.push("review flag cleared".to_string());
            }
        }

        if source.topical_tags != outcome.topics {
            let added: BTreeSet<&String> = outcome.topics.difference(&source.topical_tags).collect();
            notes.push(format!(
                "topics: {}",
                added.into_iter().cloned().collect::<Vec<_>>().join(";")
            ));
            source.topical_tags = outcome.topics.clone();
            reason.get_or_insert(ChangeReason::TopicsUpdated);
        }

        let reason = reason?;
        if !notes.is_empty() && !outcome.votes.is_empty() {
            let kinds: Vec<String> = outcome
                .votes
                .iter()
                .map(|v| format!("{:?}:{}", v.kind, v.label))
                .collect();
            notes.push(format!("votes [{}]", kinds.join(" ")));
        }
        source.last_updated = now;
        Some(ChangeLogEntry {
            source_id: source.id.clone(),
            old_label,
            new_label: source.classification,
            old_confidence,
            new_confidence: source.confidence,
            reason,
            detail: notes.join("; "),
            timestamp: now,
        })
    }
}
