//! The curated source registry: a CSV table keyed by source id.
//!
//! Rows that fail to parse are kept verbatim, in place, so rewriting the
//! file never loses data a human still has to fix. Saves go through a
//! temporary file in the same directory followed by a rename.

use crate::error::{EnrichError, Result};
use crate::models::{normalize_domain, Classification, Provenance, Source};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const HEADER: [&str; 10] = [
    "id",
    "name",
    "domain",
    "raw_text_ref",
    "classification",
    "confidence",
    "topical_tags",
    "provenance",
    "last_updated",
    "review",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRow {
    pub line: u64,
    pub reason: String,
    pub fields: Vec<String>,
    /// Fields exactly as read, written back unchanged on save.
    #[serde(skip)]
    raw: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Source(usize),
    Rejected(usize),
}

#[derive(Debug, Clone, Serialize)]
pub struct LabelShare {
    pub label: Classification,
    pub count: usize,
    pub percent: f64,
}

#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
    text_dir: PathBuf,
    sources: Vec<Source>,
    by_id: HashMap<String, usize>,
    rejected: Vec<RejectedRow>,
    order: Vec<Slot>,
}

impl Registry {
    /// An empty registry that will be written to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let text_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            path,
            text_dir,
            sources: Vec::new(),
            by_id: HashMap::new(),
            rejected: Vec::new(),
            order: Vec::new(),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let mut registry = Self::new(path);
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(&registry.path)
            .map_err(|e| EnrichError::Registry(format!("{}: {}", registry.path.display(), e)))?;

        let headers = reader
            .headers()
            .map_err(|e| EnrichError::Registry(format!("{}: {}", registry.path.display(), e)))?
            .clone();
        let columns: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.to_lowercase(), i))
            .collect();
        for required in ["id", "name"] {
            if !columns.contains_key(required) {
                return Err(EnrichError::Registry(format!(
                    "{}: missing required column '{}'",
                    registry.path.display(),
                    required
                )));
            }
        }

        for record in reader.byte_records() {
            let raw = record
                .map_err(|e| EnrichError::Registry(format!("{}: {}", registry.path.display(), e)))?;
            let line = raw.position().map(|p| p.line()).unwrap_or(0);
            let parsed = csv::StringRecord::from_byte_record(raw.clone())
                .map_err(|e| EnrichError::MalformedRow {
                    line,
                    detail: format!("not valid UTF-8: {}", e.utf8_error()),
                })
                .and_then(|record| parse_row(&record, &columns, line))
                .and_then(|source| {
                    if registry.by_id.contains_key(&source.id) {
                        Err(EnrichError::DuplicateSource(source.id))
                    } else {
                        Ok(source)
                    }
                });
            match parsed {
                Ok(source) => {
                    registry.insert_unchecked(source);
                }
                Err(err) => {
                    tracing::warn!(line, error = %err, "rejected registry row");
                    registry.order.push(Slot::Rejected(registry.rejected.len()));
                    registry.rejected.push(RejectedRow {
                        line,
                        reason: err.to_string(),
                        fields: raw
                            .iter()
                            .map(|f| String::from_utf8_lossy(f).into_owned())
                            .collect(),
                        raw: raw.iter().map(<[u8]>::to_vec).collect(),
                    });
                }
            }
        }
        tracing::info!(
            sources = registry.sources.len(),
            rejected = registry.rejected.len(),
            path = %registry.path.display(),
            "loaded registry"
        );
        Ok(registry)
    }

    pub fn with_text_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.text_dir = dir.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Source> {
        self.by_id.get(id).map(|&i| &self.sources[i])
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Source> {
        self.by_id.get(id).map(|&i| &mut self.sources[i])
    }

    /// Sources in file order.
    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter()
    }

    pub fn insert(&mut self, source: Source) -> Result<()> {
        if self.by_id.contains_key(&source.id) {
            return Err(EnrichError::DuplicateSource(source.id));
        }
        self.insert_unchecked(source);
        Ok(())
    }

    fn insert_unchecked(&mut self, source: Source) {
        let idx = self.sources.len();
        self.by_id.insert(source.id.clone(), idx);
        self.order.push(Slot::Source(idx));
        self.sources.push(source);
    }

    pub fn rejected_rows(&self) -> &[RejectedRow] {
        &self.rejected
    }

    /// Location of a source's corpus, if it has one.
    pub fn text_path(&self, source: &Source) -> Option<PathBuf> {
        let reference = source.raw_text_ref.as_deref()?;
        let p = Path::new(reference);
        Some(if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.text_dir.join(p)
        })
    }

    /// Share of each label across valid rows.
    pub fn breakdown(&self) -> Vec<LabelShare> {
        let mut counts: BTreeMap<Classification, usize> = BTreeMap::new();
        for s in &self.sources {
            *counts.entry(s.classification).or_default() += 1;
        }
        let total = self.sources.len().max(1) as f64;
        Classification::ALL
            .iter()
            .map(|label| {
                let count = counts.get(label).copied().unwrap_or(0);
                LabelShare {
                    label: *label,
                    count,
                    percent: (count as f64 / total * 1000.0).round() / 10.0,
                }
            })
            .collect()
    }

    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::new());
        let csv_err = |e: csv::Error| EnrichError::Registry(format!("encode registry: {}", e));
        writer.write_record(HEADER).map_err(csv_err)?;
        for slot in &self.order {
            match *slot {
                Slot::Source(i) => writer.write_record(source_row(&self.sources[i])).map_err(csv_err)?,
                Slot::Rejected(i) => writer.write_record(&self.rejected[i].raw).map_err(csv_err)?,
            }
        }
        writer
            .into_inner()
            .map_err(|e| EnrichError::Registry(format!("encode registry: {}", e)))
    }

    /// Atomically replaces the registry file.
    pub fn save(&self) -> Result<()> {
        let bytes = self.to_csv()?;
        write_atomic(&self.path, &bytes)?;
        tracing::info!(path = %self.path.display(), sources = self.sources.len(), "saved registry");
        Ok(())
    }
}

fn field<'r>(record: &'r csv::StringRecord, columns: &HashMap<String, usize>, name: &str) -> &'r str {
    columns
        .get(name)
        .and_then(|&i| record.get(i))
        .unwrap_or("")
}

fn parse_row(
    record: &csv::StringRecord,
    columns: &HashMap<String, usize>,
    line: u64,
) -> Result<Source> {
    let malformed = |detail: String| EnrichError::MalformedRow { line, detail };
    let id = field(record, columns, "id");
    if id.is_empty() {
        return Err(malformed("empty id".into()));
    }
    let mut source = Source::new(id, field(record, columns, "name"));

    source.domain = normalize_domain(field(record, columns, "domain"));
    let text_ref = field(record, columns, "raw_text_ref");
    if !text_ref.is_empty() {
        source.raw_text_ref = Some(text_ref.to_string());
    }
    source.classification = field(record, columns, "classification")
        .parse()
        .map_err(malformed)?;

    let confidence = field(record, columns, "confidence");
    if !confidence.is_empty() {
        let c: f32 = confidence
            .parse()
            .map_err(|_| malformed(format!("confidence '{}' is not a number", confidence)))?;
        if !(0.0..=1.0).contains(&c) {
            return Err(malformed(format!("confidence {} outside [0, 1]", c)));
        }
        source.confidence = c;
    }

    source.topical_tags = field(record, columns, "topical_tags")
        .split(';')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    source.provenance = field(record, columns, "provenance")
        .parse::<Provenance>()
        .map_err(malformed)?;

    let updated = field(record, columns, "last_updated");
    if !updated.is_empty() {
        source.last_updated = DateTime::parse_from_rfc3339(updated)
            .map_err(|e| malformed(format!("last_updated '{}': {}", updated, e)))?
            .with_timezone(&Utc);
    }

    let review = field(record, columns, "review");
    if !review.is_empty() {
        source.review = Some(review.parse().map_err(malformed)?);
    }
    Ok(source)
}

fn source_row(s: &Source) -> Vec<String> {
    vec![
        s.id.clone(),
        s.name.clone(),
        s.domain.clone().unwrap_or_default(),
        s.raw_text_ref.clone().unwrap_or_default(),
        s.classification.to_string(),
        s.confidence.to_string(),
        s.topical_tags.iter().cloned().collect::<Vec<_>>().join(";"),
        s.provenance.as_str().to_string(),
        s.last_updated.to_rfc3339_opts(SecondsFormat::Secs, true),
        s.review.map(|r| r.to_string()).unwrap_or_default(),
    ]
}

/// Writes `bytes` to a temporary file next to `path` and renames it over
/// `path`, so readers see either the old or the new content.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let io_err = |e: std::io::Error| EnrichError::Registry(format!("{}: {}", path.display(), e));
    std::fs::create_dir_all(&dir).map_err(io_err)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
