//! Splits raw source text into bounded, overlapping text units.
//!
//! Units are packed from segments: whole paragraphs when they fit, else the
//! paragraph's sentences, else fixed windows of words. Each new unit starts
//! with the tail of the previous one (the overlap), so a concept straddling
//! a boundary shows up in both neighbours. Token counts are word counts.

use crate::config::NormalizerConfig;
use crate::error::{EnrichError, Result};
use crate::models::TextUnit;
use std::ops::Range;

#[derive(Debug, Clone)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Decodes `raw` as UTF-8 and normalizes it.
    pub fn normalize(&self, source_id: &str, raw: &[u8]) -> Result<Vec<TextUnit>> {
        let text = std::str::from_utf8(raw).map_err(|e| EnrichError::Encoding {
            source_id: source_id.to_string(),
            detail: e.to_string(),
        })?;
        self.normalize_text(source_id, text.trim_start_matches('\u{feff}'))
    }

    pub fn normalize_text(&self, source_id: &str, text: &str) -> Result<Vec<TextUnit>> {
        if text.trim().is_empty() {
            return Err(EnrichError::EmptyInput {
                source_id: source_id.to_string(),
            });
        }

        let max = self.config.max_unit_tokens.max(1);
        let overlap = ((max as f32) * self.config.overlap_fraction).floor() as usize;
        let overlap = overlap.min(max - 1);

        let (words, segments) = segment(text, max);
        let units = pack(&segments, max, overlap)
            .into_iter()
            .enumerate()
            .map(|(index, (range, lead))| TextUnit {
                source_id: source_id.to_string(),
                index,
                text: words[range.clone()].join(" "),
                token_estimate: range.len(),
                overlap_tokens: lead,
            })
            .collect();
        Ok(units)
    }
}

/// Rebuilds the whitespace-normalized source text from its units.
pub fn reconstruct(units: &[TextUnit]) -> String {
    let mut words: Vec<&str> = Vec::new();
    for unit in units {
        words.extend(unit.text.split_whitespace().skip(unit.overlap_tokens));
    }
    words.join(" ")
}

fn segment(text: &str, max: usize) -> (Vec<&str>, Vec<Range<usize>>) {
    let mut words = Vec::new();
    let mut segments = Vec::new();
    let mut para_start = 0usize;

    for line in text.lines() {
        if line.trim().is_empty() {
            push_bounded(&words, para_start..words.len(), max, &mut segments);
            para_start = words.len();
            continue;
        }
        words.extend(line.split_whitespace());
    }
    push_bounded(&words, para_start..words.len(), max, &mut segments);
    (words, segments)
}

fn push_bounded(words: &[&str], range: Range<usize>, max: usize, out: &mut Vec<Range<usize>>) {
    if range.is_empty() {
        return;
    }
    if range.len() <= max {
        out.push(range);
        return;
    }
    let mut sentence_start = range.start;
    for i in range.clone() {
        if ends_sentence(words[i]) || i + 1 == range.end {
            let sentence = sentence_start..i + 1;
            sentence_start = i + 1;
            if sentence.len() <= max {
                out.push(sentence);
            } else {
                let mut s = sentence.start;
                while s < sentence.end {
                    let e = (s + max).min(sentence.end);
                    out.push(s..e);
                    s = e;
                }
            }
        }
    }
}

fn ends_sentence(word: &str) -> bool {
    word.trim_end_matches(['"', '\'', ')', '\u{201d}', '\u{2019}'])
        .ends_with(['.', '!', '?'])
}

/// Greedily packs contiguous segments into units of at most `max` words.
/// Returns each unit's word range and how many of its leading words are
/// carried over from the previous unit.
fn pack(segments: &[Range<usize>], max: usize, overlap: usize) -> Vec<(Range<usize>, usize)> {
    let mut units = Vec::new();
    let Some(first) = segments.first() else {
        return units;
    };
    let mut start = first.start;
    let mut end = first.start;
    let mut lead = 0usize;

    for seg in segments {
        if end == start {
            end = seg.end;
            continue;
        }
        if seg.end - start <= max {
            end = seg.end;
            continue;
        }
        units.push((start..end, lead));
        let carry = overlap.min(max - seg.len()).min(end - start);
        start = end - carry;
        lead = carry;
        end = seg.end;
    }
    if end > start {
        units.push((start..end, lead));
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer(max: usize, overlap: f32) -> Normalizer {
        Normalizer::new(NormalizerConfig {
            max_unit_tokens: max,
            overlap_fraction: overlap,
        })
    }

    fn flat(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn empty_and_blank_input_fail() {
        let n = normalizer(16, 0.2);
        assert!(matches!(
            n.normalize("s", b""),
            Err(EnrichError::EmptyInput { source_id }) if source_id == "s"
        ));
        assert!(matches!(
            n.normalize("s", b" \n\t\n  "),
            Err(EnrichError::EmptyInput { .. })
        ));
    }

    #[test]
    fn undecodable_input_fails() {
        let n = normalizer(16, 0.2);
        assert!(matches!(
            n.normalize("s", &[0x66, 0xff, 0xfe, 0x6f]),
            Err(EnrichError::Encoding { .. })
        ));
    }

    #[test]
    fn prefers_paragraph_boundaries() {
        let n = normalizer(4, 0.0);
        let units = n
            .normalize_text("s", "one two three\n\nfour five six\n\nseven")
            .unwrap();
        let texts: Vec<&str> = units.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(texts, vec!["one two three", "four five six seven"]);
        assert_eq!(units[1].index, 1);
        assert_eq!(units[1].token_estimate, 4);
    }

    #[test]
    fn falls_back_to_sentences_then_windows() {
        let n = normalizer(5, 0.0);
        let text = "Alpha beta gamma. Delta epsilon zeta eta. \
                    one two three four five six seven eight";
        let units = n.normalize_text("s", text).unwrap();
        assert!(units.iter().all(|u| u.token_estimate <= 5));
        assert_eq!(units[0].text, "Alpha beta gamma.");
        assert_eq!(reconstruct(&units), flat(text));
    }

    #[test]
    fn adjacent_units_share_overlap() {
        let n = normalizer(6, 0.34);
        let text = "a b c d\n\ne f g h\n\ni j k l";
        let units = n.normalize_text("s", text).unwrap();
        assert!(units.len() >= 2);
        for pair in units.windows(2) {
            let prev: Vec<&str> = pair[0].text.split_whitespace().collect();
            let next: Vec<&str> = pair[1].text.split_whitespace().collect();
            let lead = pair[1].overlap_tokens;
            assert!(lead > 0);
            assert_eq!(&prev[prev.len() - lead..], &next[..lead]);
        }
        assert_eq!(reconstruct(&units), flat(text));
    }

    #[test]
    fn bound_and_reconstruction_hold_across_configs() {
        let mut text = String::new();
        for p in 0..12 {
            for s in 0..(p % 4 + 1) {
                text.push_str(&format!("Paragraph {} sentence {} has some words in it", p, s));
                text.push_str(if s % 2 == 0 { ". " } else { "! " });
            }
            text.push_str("\n\n");
        }
        for max in [1usize, 3, 7, 16, 64, 500] {
            for overlap in [0.0f32, 0.1, 0.5, 0.9] {
                let units = normalizer(max, overlap).normalize_text("s", &text).unwrap();
                assert!(units.iter().all(|u| u.token_estimate <= max));
                assert!(units.iter().all(|u| u.overlap_tokens < max));
                assert_eq!(reconstruct(&units), flat(&text), "max={} overlap={}", max, overlap);
            }
        }
    }
}
