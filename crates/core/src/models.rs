use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Organizational status of a source. `Unknown` is a terminal value, not
/// the absence of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    ForProfit,
    NonProfit,
    Government,
    Unknown,
}

impl Classification {
    pub const ALL: [Classification; 4] = [
        Classification::ForProfit,
        Classification::NonProfit,
        Classification::Government,
        Classification::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::ForProfit => "for-profit",
            Classification::NonProfit => "non-profit",
            Classification::Government => "government",
            Classification::Unknown => "unknown",
        }
    }

    /// Tie-break order between labels with equal support (lower wins).
    pub fn tie_rank(&self) -> u8 {
        match self {
            Classification::Government => 0,
            Classification::NonProfit => 1,
            Classification::ForProfit => 2,
            Classification::Unknown => 3,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm: String = s
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match norm.as_str() {
            "forprofit" => Ok(Classification::ForProfit),
            "nonprofit" => Ok(Classification::NonProfit),
            "government" | "gov" => Ok(Classification::Government),
            "unknown" | "" => Ok(Classification::Unknown),
            _ => Err(format!("unknown classification '{}'", s.trim())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Manual,
    Inferred,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Manual => "manual",
            Provenance::Inferred => "inferred",
        }
    }
}

impl FromStr for Provenance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "manual" => Ok(Provenance::Manual),
            "inferred" | "" => Ok(Provenance::Inferred),
            other => Err(format!("unknown provenance '{}'", other)),
        }
    }
}

/// A registry entry for one information-providing organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub domain: Option<String>,
    pub raw_text_ref: Option<String>,
    pub classification: Classification,
    pub confidence: f32,
    pub topical_tags: BTreeSet<String>,
    pub provenance: Provenance,
    pub last_updated: DateTime<Utc>,
    /// Label proposed by inference but held back for human review.
    pub review: Option<Classification>,
}

impl Source {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            domain: None,
            raw_text_ref: None,
            classification: Classification::Unknown,
            confidence: 0.0,
            topical_tags: BTreeSet::new(),
            provenance: Provenance::Inferred,
            last_updated: DateTime::<Utc>::default(),
            review: None,
        }
    }

    pub fn is_manual(&self) -> bool {
        self.provenance == Provenance::Manual
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey {
    pub source_id: String,
    pub unit_index: usize,
}

/// A bounded slice of a source's corpus. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextUnit {
    pub source_id: String,
    pub index: usize,
    pub text: String,
    pub token_estimate: usize,
    /// Leading tokens repeated from the previous unit.
    pub overlap_tokens: usize,
}

impl TextUnit {
    pub fn key(&self) -> UnitKey {
        UnitKey {
            source_id: self.source_id.clone(),
            unit_index: self.index,
        }
    }

    pub fn text_hash(&self) -> String {
        blake3::hash(self.text.as_bytes()).to_hex().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub key: UnitKey,
    pub vector: Vec<f32>,
    pub model_id: String,
    pub dimension: usize,
}

pub type ClusterId = i64;

/// Sentinel cluster holding low-density sources.
pub const OUTLIER_CLUSTER: ClusterId = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub members: BTreeSet<String>,
    pub centroid: Vec<f32>,
    pub signature: Vec<String>,
}

impl Cluster {
    pub fn is_outlier(&self) -> bool {
        self.id == OUTLIER_CLUSTER
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteKind {
    Manual,
    Lexical,
    Neighbor,
    ClusterMajority,
}

impl VoteKind {
    /// Lower value takes precedence when votes disagree.
    pub fn priority(&self) -> u8 {
        match self {
            VoteKind::Manual => 0,
            VoteKind::Lexical => 1,
            VoteKind::Neighbor => 2,
            VoteKind::ClusterMajority => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationVote {
    pub kind: VoteKind,
    pub label: Classification,
    pub weight: f32,
    pub detail: String,
}

/// Reduces a URL or host to a bare lower-cased domain without `www.`.
pub fn normalize_domain(raw: &str) -> Option<String> {
    let trimmed = raw.trim().to_lowercase();
    let without_scheme = match trimmed.find("://") {
        Some(pos) => &trimmed[pos + 3..],
        None => trimmed.as_str(),
    };
    let host = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host = host.rsplit('@').next().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    let host = host.strip_prefix("www.").unwrap_or(host).trim_end_matches('.');
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_labels_leniently() {
        assert_eq!("Non-Profit".parse::<Classification>(), Ok(Classification::NonProfit));
        assert_eq!("for_profit".parse::<Classification>(), Ok(Classification::ForProfit));
        assert_eq!("GOVERNMENT".parse::<Classification>(), Ok(Classification::Government));
        assert_eq!("".parse::<Classification>(), Ok(Classification::Unknown));
        assert!("mixed".parse::<Classification>().is_err());
    }

    #[test]
    fn normalizes_domains() {
        assert_eq!(normalize_domain("https://www.CBP.gov/newsroom"), Some("cbp.gov".into()));
        assert_eq!(normalize_domain("propublica.org"), Some("propublica.org".into()));
        assert_eq!(normalize_domain("http://example.com:8080?x=1"), Some("example.com".into()));
        assert_eq!(normalize_domain("   "), None);
    }

    #[test]
    fn vote_priority_order() {
        let mut kinds = vec![
            VoteKind::ClusterMajority,
            VoteKind::Neighbor,
            VoteKind::Manual,
            VoteKind::Lexical,
        ];
        kinds.sort_by_key(|k| k.priority());
        assert_eq!(
            kinds,
            vec![
                VoteKind::Manual,
                VoteKind::Lexical,
                VoteKind::Neighbor,
                VoteKind::ClusterMajority
            ]
        );
    }
}
