//! Location extraction from plan text.
//!
//! Preferred form is an explicit `[[Place Name]]` marker, which the
//! completion prompt asks for and the template fallback emits. Text without
//! markers falls back to a fixed heuristic: `📍` visit lines and capitalized
//! names ending in a landmark word. Both passes return names in order of
//! first appearance, deduplicated case-insensitively, so identical content
//! always yields the identical list.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

const LANDMARK_WORDS: &str = "Tower|Museum|Palace|Temple|Church|Cathedral|Market|Beach|Square|\
Bridge|Garden|Gardens|Gallery|Basilica|Castle|Park|Fountain|Forum|Abbey";

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\[([^\[\]\n]+?)\]\]").unwrap())
}

fn visit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*📍\s*Visit:\s*([^\n(]+)").unwrap())
}

fn landmark_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"\b((?:[A-Z][\w'’\-]*\s+){{1,4}}(?:{}))\b",
            LANDMARK_WORDS
        ))
        .unwrap()
    })
}

fn push_unique(out: &mut Vec<String>, seen: &mut HashSet<String>, candidate: &str) {
    let name = candidate
        .trim()
        .trim_end_matches(|c: char| c == '.' || c == ',' || c == ':')
        .trim();
    if name.chars().count() <= 3 {
        return;
    }
    if seen.insert(name.to_lowercase()) {
        out.push(name.to_string());
    }
}

/// Names inside `[[...]]` markers only, at most `max`.
pub fn extract_marked(content: &str, max: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for cap in marker_re().captures_iter(content) {
        push_unique(&mut out, &mut seen, &cap[1]);
    }
    out.truncate(max);
    out
}

/// Ordered, deduplicated location names mentioned in `content`, at most `max`.
pub fn extract_locations(content: &str, max: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    for cap in marker_re().captures_iter(content) {
        push_unique(&mut out, &mut seen, &cap[1]);
    }

    if out.is_empty() {
        let mut hits: Vec<(usize, String)> = Vec::new();
        for cap in visit_re().captures_iter(content) {
            if let Some(m) = cap.get(1) {
                hits.push((m.start(), m.as_str().to_string()));
            }
        }
        for cap in landmark_re().captures_iter(content) {
            if let Some(m) = cap.get(1) {
                hits.push((m.start(), m.as_str().to_string()));
            }
        }
        hits.sort_by_key(|(pos, _)| *pos);
        for (_, name) in hits {
            push_unique(&mut out, &mut seen, &name);
        }
    }

    out.truncate(max);
    out
}

/// `content` with `[[...]]` markers replaced by their inner text.
pub fn display_text(content: &str) -> String {
    marker_re().replace_all(content, "$1").into_owned()
}
