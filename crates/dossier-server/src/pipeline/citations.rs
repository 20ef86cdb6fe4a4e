// crates/dossier-server/src/pipeline/citations.rs
// Citation normalizer for generated prose
//
// Enforces the grounding discipline on model output:
// - bare bracketed 1-2 digit numbers `[7]` are footnote noise, not
//   document ids, and are removed; 3+-digit bare citations survive
// - `[#id]` citations survive only when the id is among the grounding
//   sources, so every citation in the emitted text resolves
// - leaked scaffolding lines ("User asked:", "Confidence level:") are
//   dropped
// - the answer always ends with a canonical `Sources:` line built from
//   the grounding sources

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

static BARE_SHORT_CITATION: LazyLock<Regex> = LazyLock::new(|| compile(r"\[(\d{1,2})\]"));
static ID_CITATION: LazyLock<Regex> = LazyLock::new(|| compile(r"\[#(\d+)\]"));
static BARE_LONG_CITATION: LazyLock<Regex> = LazyLock::new(|| compile(r"\[(\d{3,})\]"));

fn compile(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => unreachable!("invalid citation pattern {pattern:?}: {e}"),
    }
}

/// Line prefixes the model sometimes leaks from its prompt.
const STRIPPED_PREFIXES: &[&str] = &["User asked:", "Confidence level:"];

/// Collect every citation id in the text: `[#id]` in any width plus
/// bare 3+-digit `[id]`.
pub fn extract_citations(text: &str) -> Vec<i64> {
    let mut ids = Vec::new();
    for caps in ID_CITATION.captures_iter(text) {
        if let Ok(id) = caps[1].parse() {
            ids.push(id);
        }
    }
    for caps in BARE_LONG_CITATION.captures_iter(text) {
        if let Ok(id) = caps[1].parse() {
            ids.push(id);
        }
    }
    ids
}

/// Citations that must satisfy the grounding invariant: 3-or-more-digit
/// ids, in either citation form.
pub fn extract_long_citations(text: &str) -> Vec<i64> {
    extract_citations(text)
        .into_iter()
        .filter(|id| *id >= 100)
        .collect()
}

fn strip_scaffolding_lines(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !STRIPPED_PREFIXES.iter().any(|p| trimmed.starts_with(p))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn drop_existing_sources_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("Sources:"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The canonical trailing sources line.
pub fn sources_line(sources: &[i64]) -> String {
    let markers: Vec<String> = sources.iter().map(|id| format!("[#{id}]")).collect();
    format!("Sources: {}", markers.join(" "))
}

/// Normalize a generated answer against its grounding sources.
pub fn normalize_answer(text: &str, sources: &[i64]) -> String {
    let allowed: BTreeSet<i64> = sources.iter().copied().collect();

    let text = strip_scaffolding_lines(text);
    let text = drop_existing_sources_lines(&text);

    // Bare 1-2 digit tokens are not document ids
    let text = BARE_SHORT_CITATION.replace_all(&text, "");

    // [#id] citations must resolve to a grounding source
    let text = ID_CITATION.replace_all(&text, |caps: &regex::Captures| {
        match caps[1].parse::<i64>() {
            Ok(id) if allowed.contains(&id) => caps[0].to_string(),
            _ => String::new(),
        }
    });

    // Bare 3+-digit citations survive only when they resolve too
    let text = BARE_LONG_CITATION.replace_all(&text, |caps: &regex::Captures| {
        match caps[1].parse::<i64>() {
            Ok(id) if allowed.contains(&id) => caps[0].to_string(),
            _ => String::new(),
        }
    });

    // Tidy whitespace the removals left behind
    let body = text
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();

    if sources.is_empty() {
        return body;
    }
    if body.is_empty() {
        return sources_line(sources);
    }
    format!("{body}\n{}", sources_line(sources))
}
