// crates/dossier-server/src/db/search.rs
// FTS5 queries over the documents corpus

use chrono::NaiveDate;
use dossier_types::DocumentKind;
use rusqlite::{Connection, params};

/// Raw full-text candidate before rank composition and snippet building.
#[derive(Debug, Clone)]
pub struct FtsCandidate {
    pub doc_id: i64,
    pub title: String,
    pub body: String,
    pub kind: DocumentKind,
    pub timestamp: Option<NaiveDate>,
    pub sender: Option<String>,
    /// Negated bm25 rank, higher is better.
    pub lexical: f64,
}

/// Build an FTS5 MATCH expression from already-tokenized terms.
///
/// Each token is quoted (FTS5 treats bare `-`, `.` etc. as syntax) and the
/// tokens are OR-joined: retrieval is recall-oriented, rank composition
/// sorts out precision.
pub fn build_match_query(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Full-text search over documents(title, body).
///
/// Title matches weigh double (bm25 column weights). Returns up to
/// `limit` candidates in raw lexical order; callers re-rank.
pub fn fts_search_sync(
    conn: &Connection,
    tokens: &[String],
    limit: u32,
) -> rusqlite::Result<Vec<FtsCandidate>> {
    let match_query = build_match_query(tokens);

    let mut stmt = conn.prepare(
        "SELECT d.id, d.title, d.body, d.kind, d.timestamp, d.sender,
                -bm25(documents_fts, 2.0, 1.0) AS lexical
         FROM documents_fts
         JOIN documents d ON d.id = documents_fts.rowid
         WHERE documents_fts MATCH ?1
         ORDER BY bm25(documents_fts, 2.0, 1.0)
         LIMIT ?2",
    )?;

    let rows = stmt.query_map(params![match_query, limit], |row| {
        let kind: String = row.get(3)?;
        let timestamp: Option<String> = row.get(4)?;
        Ok(FtsCandidate {
            doc_id: row.get(0)?,
            title: row.get(1)?,
            body: row.get(2)?,
            kind: DocumentKind::parse(&kind),
            timestamp: timestamp.and_then(|t| NaiveDate::parse_from_str(&t, "%Y-%m-%d").ok()),
            sender: row.get(5)?,
            lexical: row.get(6)?,
        })
    })?;

    rows.collect()
}
