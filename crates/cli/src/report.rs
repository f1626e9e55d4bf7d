//! Plain-text rendering of pipeline and query results.

use enricher_core::query::{ClusterView, SearchHit};
use enricher_core::registry::LabelShare;
use enricher_core::pipeline::RunReport;
use storage::models::{ChangeRecord, PendingRecord, RunRecord};

pub fn breakdown_lines(shares: &[LabelShare]) -> Vec<String> {
    shares
        .iter()
        .map(|s| format!("  {:<12} {:>5} ({:.1}%)", s.label.as_str(), s.count, s.percent))
        .collect()
}

pub fn run_summary(report: &RunReport) -> String {
    let mut out = vec![format!(
        "{} run {}: processed {}, embedded units {}, reused units {}",
        report.mode.as_str(),
        report.run_id,
        report.processed,
        report.embedded_units,
        report.reused_units
    )];
    if report.cancelled {
        out.push("cancelled before completion; registry left unchanged".to_string());
    } else {
        out.push(format!(
            "clusters {}, outliers {}, changed {}, flagged {}, manual conflicts {}",
            report.clusters, report.outliers, report.changed, report.flagged, report.conflicts
        ));
    }
    if report.rejected_rows > 0 {
        out.push(format!("rejected registry rows: {}", report.rejected_rows));
    }
    if !report.pending.is_empty() {
        out.push(format!("pending sources: {}", report.pending.len()));
        for p in &report.pending {
            out.push(format!("  {} [{}] {}", p.source_id, p.error_class.as_str(), p.message));
        }
    }
    out.push("classification breakdown:".to_string());
    out.extend(breakdown_lines(&report.breakdown));
    out.join("\n")
}

pub fn change_line(c: &ChangeRecord) -> String {
    let mut line = format!(
        "{} {} {}: {} ({:.2}) -> {} ({:.2})",
        c.created_at, c.source_id, c.reason, c.old_label, c.old_confidence, c.new_label, c.new_confidence
    );
    if let Some(detail) = c.detail.as_deref().filter(|d| !d.is_empty()) {
        line.push_str(" | ");
        line.push_str(detail);
    }
    line
}

pub fn pending_line(p: &PendingRecord) -> String {
    format!(
        "{} [{}] attempts={} updated={} {}",
        p.source_id, p.error_class, p.attempts, p.updated_at, p.error
    )
}

pub fn run_line(r: &RunRecord) -> String {
    format!(
        "{} {} processed={} pending={} changed={} flagged={}{}",
        r.run_id,
        r.mode,
        r.processed,
        r.pending,
        r.changed,
        r.flagged,
        if r.cancelled { " (cancelled)" } else { "" }
    )
}

pub fn hit_line(rank: usize, h: &SearchHit) -> String {
    let tags: Vec<&str> = h.topical_tags.iter().map(String::as_str).collect();
    format!(
        "{:>2}. {:.3} {} ({}) {} [{:.2}] {}",
        rank,
        h.similarity,
        h.name,
        h.source_id,
        h.classification,
        h.confidence,
        tags.join(";")
    )
}

pub fn cluster_lines(view: &ClusterView) -> Vec<String> {
    let title = if view.outlier {
        format!("outliers ({} sources)", view.members.len())
    } else {
        format!("cluster {} ({} sources)", view.id, view.members.len())
    };
    let mut out = vec![title];
    if !view.signature.is_empty() {
        out.push(format!("signature: {}", view.signature.join(", ")));
    }
    for m in &view.members {
        out.push(format!(
            "  {} {} [{}] at ({:.3}, {:.3})",
            m.source_id, m.name, m.classification, m.layout[0], m.layout[1]
        ));
    }
    out
}
