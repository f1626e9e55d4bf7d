use crate::config::ClassificationConfig;
use crate::models::{Classification, ClassificationVote, Source, VoteKind};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const BUILTIN_RULES: &str = include_str!("../rules/default.toml");

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    DomainSuffix { value: String },
    DomainContains { value: String },
    NameContains { value: String },
    NameEquals { value: String },
    All { all: Vec<Condition> },
    Any { any: Vec<Condition> },
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LexicalRule {
    pub name: String,
    pub label: Classification,
    pub weight: f32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub condition: Condition,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<LexicalRule>,
}

/// Lower-cased matching view of a source.
#[derive(Debug, Clone)]
pub struct RuleContext {
    pub name: String,
    pub domain: Option<String>,
}

impl RuleContext {
    pub fn for_source(source: &Source) -> Self {
        Self {
            name: source.name.trim().to_lowercase(),
            domain: source.domain.as_ref().map(|d| d.to_lowercase()),
        }
    }
}

pub fn matches(condition: &Condition, ctx: &RuleContext) -> bool {
    match condition {
        Condition::DomainSuffix { value } => ctx
            .domain
            .as_deref()
            .map(|d| d.ends_with(&value.to_lowercase()))
            .unwrap_or(false),
        Condition::DomainContains { value } => ctx
            .domain
            .as_deref()
            .map(|d| d.contains(&value.to_lowercase()))
            .unwrap_or(false),
        Condition::NameContains { value } => ctx.name.contains(&value.to_lowercase()),
        Condition::NameEquals { value } => ctx.name == value.trim().to_lowercase(),
        Condition::All { all } => all.iter().all(|c| matches(c, ctx)),
        Condition::Any { any } => any.iter().any(|c| matches(c, ctx)),
    }
}

/// Enabled rules matching `ctx`, ordered by priority.
pub fn evaluate<'a>(rules: &'a [LexicalRule], ctx: &RuleContext) -> Vec<&'a LexicalRule> {
    let mut matched: Vec<&LexicalRule> = rules
        .iter()
        .filter(|r| r.enabled && matches(&r.condition, ctx))
        .collect();
    matched.sort_by_key(|r| r.priority);
    matched
}

/// Collapses matched rules into a single lexical vote, or `None` when no
/// rule with positive weight fired.
pub fn lexical_vote(
    rules: &[LexicalRule],
    ctx: &RuleContext,
    lexical_weight: f32,
) -> Option<ClassificationVote> {
    let matched = evaluate(rules, ctx);
    let mut totals: BTreeMap<Classification, f32> = BTreeMap::new();
    for rule in &matched {
        if rule.weight > 0.0 && rule.label != Classification::Unknown {
            *totals.entry(rule.label).or_default() += rule.weight;
        }
    }
    let total: f32 = totals.values().sum();
    let (label, best) = totals
        .iter()
        .max_by(|a, b| a.1.total_cmp(b.1).then(b.0.tie_rank().cmp(&a.0.tie_rank())))
        .map(|(l, w)| (*l, *w))?;

    let names: Vec<&str> = matched
        .iter()
        .filter(|r| r.label == label)
        .map(|r| r.name.as_str())
        .collect();
    Some(ClassificationVote {
        kind: VoteKind::Lexical,
        label,
        weight: lexical_weight * best / total,
        detail: names.join(","),
    })
}

pub fn default_rules() -> anyhow::Result<Vec<LexicalRule>> {
    let file: RuleFile = toml::from_str(BUILTIN_RULES).context("parse built-in rules")?;
    Ok(file.rules)
}

/// Loads every `*.toml` file in `dir`, in file-name order.
pub fn load_rules_from_dir(dir: &Path) -> anyhow::Result<Vec<LexicalRule>> {
    let mut rules = Vec::new();
    if !dir.exists() {
        return Ok(rules);
    }
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file()
            && entry.path().extension().and_then(|e| e.to_str()) == Some("toml")
        {
            paths.push(entry.path());
        }
    }
    paths.sort();
    for path in paths {
        let content = fs::read_to_string(&path)?;
        let file: RuleFile =
            toml::from_str(&content).with_context(|| format!("parse {}", path.display()))?;
        rules.extend(file.rules);
    }
    Ok(rules)
}

pub fn load_rules(cfg: &ClassificationConfig) -> anyhow::Result<Vec<LexicalRule>> {
    match &cfg.rules_path {
        Some(dir) => {
            let rules = load_rules_from_dir(Path::new(dir))?;
            tracing::info!(count = rules.len(), dir = %dir, "loaded lexical rules");
            Ok(rules)
        }
        None => default_rules(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(name: &str, domain: Option<&str>) -> RuleContext {
        let mut s = Source::new("x", name);
        s.domain = domain.map(str::to_string);
        RuleContext::for_source(&s)
    }

    fn vote(name: &str, domain: Option<&str>) -> Option<ClassificationVote> {
        lexical_vote(&default_rules().unwrap(), &ctx(name, domain), 1.0)
    }

    #[test]
    fn builtin_rules_parse() {
        let rules = default_rules().unwrap();
        assert!(rules.len() > 50);
        assert!(rules.iter().all(|r| r.enabled && r.weight > 0.0));
        assert!(rules.iter().any(|r| matches!(r.condition, Condition::All { .. })));
    }

    #[test]
    fn domain_rules_dominate() {
        let v = vote("Daily Press Office", Some("cbp.gov")).unwrap();
        assert_eq!(v.label, Classification::Government);
        let v = vote("Law Review Journal", Some("law.harvard.edu")).unwrap();
        assert_eq!(v.label, Classification::NonProfit);
    }

    #[test]
    fn keyword_balance_follows_decision_order() {
        // two non-profit keywords beat one for-profit indicator
        assert_eq!(
            vote("Policy Research Times", None).unwrap().label,
            Classification::NonProfit
        );
        // one for-profit indicator beats one non-profit keyword
        assert_eq!(
            vote("Energy Policy Magazine", None).unwrap().label,
            Classification::ForProfit
        );
        assert_eq!(vote("Reuters", None).unwrap().label, Classification::ForProfit);
        assert_eq!(
            vote("Senate Committee on Finance", None).unwrap().label,
            Classification::Government
        );
    }

    #[test]
    fn unanimous_rules_give_full_weight() {
        let v = vote("Institute for Policy Studies", None).unwrap();
        assert_eq!(v.label, Classification::NonProfit);
        assert!((v.weight - 1.0).abs() < 1e-6);
        assert!(v.detail.contains("np-keyword:institute"));

        let split = vote("Energy Policy Magazine", None).unwrap();
        assert!(split.weight < 1.0);
    }

    #[test]
    fn no_match_means_no_vote() {
        assert!(vote("Alpha Collective", Some("alpha.example")).is_none());
    }

    #[test]
    fn equal_totals_break_toward_government() {
        let rules = vec![
            LexicalRule {
                name: "a".into(),
                label: Classification::ForProfit,
                weight: 1.0,
                priority: 0,
                enabled: true,
                condition: Condition::NameContains { value: "x".into() },
            },
            LexicalRule {
                name: "b".into(),
                label: Classification::Government,
                weight: 1.0,
                priority: 0,
                enabled: true,
                condition: Condition::NameEquals { value: "X".into() },
            },
        ];
        let v = lexical_vote(&rules, &ctx("x", None), 2.0).unwrap();
        assert_eq!(v.label, Classification::Government);
        assert!((v.weight - 1.0).abs() < 1e-6);
    }

    #[test]
    fn loads_rule_files_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("local.toml"),
            r#"
[[rules]]
name = "wire-service"
label = "for-profit"
weight = 2.5
condition = { type = "domain_contains", value = "wire" }

[[rules]]
name = "disabled"
label = "government"
weight = 1.0
enabled = false
condition = { type = "name_contains", value = "agency" }
"#,
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let rules = load_rules_from_dir(dir.path()).unwrap();
        assert_eq!(rules.len(), 2);
        let matched = evaluate(&rules, &ctx("Wire Agency", Some("newswire.com")));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "wire-service");
        assert!(load_rules_from_dir(&dir.path().join("missing")).unwrap().is_empty());
    }
}
