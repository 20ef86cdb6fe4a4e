// crates/dossier-server/src/search/snippet.rs
// Snippet extraction with match highlighting
//
// Returns a window of at most MAX_SNIPPET_CHARS characters centred on the
// best match, with matched tokens wrapped in «…». When no window covers
// every query token, the window maximizing distinct-token coverage wins.
// Snippets are rebuilt word-by-word, so runs of whitespace collapse.

/// Window budget in characters (excluding the highlight markers).
pub const MAX_SNIPPET_CHARS: usize = 240;

/// A word of the body with its position.
struct Word {
    text: String,
    lower: String,
    chars: usize,
}

fn split_words(body: &str) -> Vec<Word> {
    body.split_whitespace()
        .map(|w| Word {
            text: w.to_string(),
            lower: w
                .to_lowercase()
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_string(),
            chars: w.chars().count(),
        })
        .collect()
}

/// Whether a body word counts as a match for a query term.
/// Exact match, or prefix match for longer terms (approximates the
/// stemming the full-text index applied during retrieval).
fn matches_term(word: &str, term: &str) -> bool {
    if word.is_empty() || term.is_empty() {
        return false;
    }
    word == term || (term.chars().count() >= 4 && word.starts_with(term))
}

fn match_index(word: &str, terms: &[String]) -> Option<usize> {
    terms.iter().position(|t| matches_term(word, t))
}

/// Count the window length in characters (words joined by single spaces).
fn window_chars(words: &[Word], start: usize, end: usize) -> usize {
    let text: usize = words[start..end].iter().map(|w| w.chars).sum();
    text + (end - start).saturating_sub(1)
}

/// Grow a window around `center` until the character budget is spent.
fn grow_window(words: &[Word], center: usize) -> (usize, usize) {
    let mut start = center;
    let mut end = center + 1;
    loop {
        let can_left = start > 0
            && window_chars(words, start - 1, end) <= MAX_SNIPPET_CHARS;
        let can_right =
            end < words.len() && window_chars(words, start, end + 1) <= MAX_SNIPPET_CHARS;
        match (can_left, can_right) {
            (true, true) => {
                // Alternate to keep the match centred
                if (center - start) <= (end - center) {
                    start -= 1;
                } else {
                    end += 1;
                }
            }
            (true, false) => start -= 1,
            (false, true) => end += 1,
            (false, false) => break,
        }
    }
    (start, end)
}

/// Distinct query terms matched inside a window.
fn coverage(words: &[Word], start: usize, end: usize, terms: &[String]) -> usize {
    let mut seen = vec![false; terms.len()];
    for word in &words[start..end] {
        if let Some(i) = match_index(&word.lower, terms) {
            seen[i] = true;
        }
    }
    seen.iter().filter(|s| **s).count()
}

/// Build the snippet for a document body given the (lowercased) query
/// terms. Terms found in the window are wrapped in «…».
pub fn build_snippet(body: &str, terms: &[String]) -> String {
    let words = split_words(body);
    if words.is_empty() {
        return String::new();
    }

    let match_positions: Vec<usize> = words
        .iter()
        .enumerate()
        .filter(|(_, w)| match_index(&w.lower, terms).is_some())
        .map(|(i, _)| i)
        .collect();

    // No literal match (stemming drift): fall back to the document head.
    let (start, end) = if match_positions.is_empty() {
        grow_window(&words, 0)
    } else {
        match_positions
            .iter()
            .map(|&center| grow_window(&words, center))
            .max_by_key(|&(s, e)| {
                // Most distinct terms covered; earlier windows win ties
                (coverage(&words, s, e, terms), usize::MAX - s)
            })
            .unwrap_or((0, words.len()))
    };

    let mut out = String::new();
    if start > 0 {
        out.push('…');
    }
    for (i, word) in words[start..end].iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        if match_index(&word.lower, terms).is_some() {
            out.push('«');
            out.push_str(&word.text);
            out.push('»');
        } else {
            out.push_str(&word.text);
        }
    }
    if end < words.len() {
        out.push('…');
    }
    out
}
