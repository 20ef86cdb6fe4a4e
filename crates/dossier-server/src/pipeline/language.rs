// crates/dossier-server/src/pipeline/language.rs
// Response-language selection by stopword counting
//
// The heuristic is deliberately small: count hits from per-language
// stopword lists over the query tokens; the highest count wins, ties and
// zero hits fall back to English. Mixed-language queries therefore get
// the language of their majority function words.

/// Languages the engine can answer in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    English,
    Spanish,
    French,
    German,
}

const ENGLISH_STOPWORDS: &[&str] = &[
    "the", "a", "an", "of", "to", "in", "and", "or", "is", "are", "was", "were", "who", "what",
    "when", "where", "why", "how", "did", "with", "for", "on", "that", "this", "it",
];

const SPANISH_STOPWORDS: &[&str] = &[
    "el", "la", "los", "las", "de", "del", "y", "o", "es", "son", "fue", "eran", "quién",
    "quien", "qué", "que", "cuándo", "dónde", "cómo", "con", "para", "en", "un", "una",
];

const FRENCH_STOPWORDS: &[&str] = &[
    "le", "la", "les", "des", "de", "du", "et", "ou", "est", "sont", "était", "qui", "quoi",
    "quand", "où", "pourquoi", "comment", "avec", "pour", "dans", "un", "une", "ce", "cette",
];

const GERMAN_STOPWORDS: &[&str] = &[
    "der", "die", "das", "den", "dem", "und", "oder", "ist", "sind", "war", "waren", "wer",
    "was", "wann", "wo", "warum", "wie", "mit", "für", "auf", "ein", "eine", "nicht",
];

/// English stopwords, also used by the noun tokenizer fallback.
pub fn english_stopwords() -> &'static [&'static str] {
    ENGLISH_STOPWORDS
}

fn count_hits(tokens: &[String], stopwords: &[&str]) -> usize {
    tokens
        .iter()
        .filter(|t| stopwords.contains(&t.as_str()))
        .count()
}

/// Detect the language of a query by stopword hit counts.
pub fn detect_language(query: &str) -> Language {
    // char::is_alphanumeric is Unicode-aware, so accented letters stay
    // inside their tokens.
    let tokens: Vec<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    let scores = [
        (Language::English, count_hits(&tokens, ENGLISH_STOPWORDS)),
        (Language::Spanish, count_hits(&tokens, SPANISH_STOPWORDS)),
        (Language::French, count_hits(&tokens, FRENCH_STOPWORDS)),
        (Language::German, count_hits(&tokens, GERMAN_STOPWORDS)),
    ];

    // Highest count wins; zero hits and every tie fall back to English.
    let max = scores.iter().map(|(_, c)| *c).max().unwrap_or(0);
    if max == 0 {
        return Language::English;
    }
    let mut leaders = scores.iter().filter(|(_, c)| *c == max);
    match (leaders.next(), leaders.next()) {
        (Some((lang, _)), None) => *lang,
        _ => Language::English,
    }
}

/// Name of the language, for the formatting prompt's style contract.
pub fn language_name(lang: Language) -> &'static str {
    match lang {
        Language::English => "English",
        Language::Spanish => "Spanish",
        Language::French => "French",
        Language::German => "German",
    }
}

/// Localized "no relevant documents" message for empty retrievals.
pub fn no_results_message(lang: Language) -> &'static str {
    match lang {
        Language::English => {
            "No relevant documents were found in the corpus for this question."
        }
        Language::Spanish => {
            "No se encontraron documentos relevantes en el corpus para esta pregunta."
        }
        Language::French => {
            "Aucun document pertinent n'a été trouvé dans le corpus pour cette question."
        }
        Language::German => {
            "Für diese Frage wurden keine relevanten Dokumente im Korpus gefunden."
        }
    }
}
