// crates/dossier-server/src/db/documents.rs
// Corpus document access. Documents are written by the ingestion
// collaborator and immutable afterwards; the engine only reads them,
// except for the insert used by fixtures and ingestion itself.

use chrono::NaiveDate;
use dossier_types::{Document, DocumentKind};
use rusqlite::{Connection, Row, params};

/// Parse a `documents` row in column order
/// (id, title, body, kind, timestamp, sender, metadata).
pub fn parse_document_row(row: &Row) -> rusqlite::Result<Document> {
    let kind: String = row.get(3)?;
    let timestamp: Option<String> = row.get(4)?;
    let metadata: String = row.get(6)?;
    Ok(Document {
        id: row.get(0)?,
        title: row.get(1)?,
        body: row.get(2)?,
        kind: DocumentKind::parse(&kind),
        timestamp: timestamp.and_then(|t| NaiveDate::parse_from_str(&t, "%Y-%m-%d").ok()),
        sender: row.get(5)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

/// Insert a document with an explicit id (the citation key).
pub fn insert_document_sync(conn: &Connection, doc: &Document) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO documents (id, title, body, kind, timestamp, sender, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            doc.id,
            doc.title,
            doc.body,
            doc.kind.as_str(),
            doc.timestamp.map(|t| t.to_string()),
            doc.sender,
            doc.metadata.to_string(),
        ],
    )?;
    Ok(())
}

/// Fetch a single document by id.
pub fn get_document_sync(conn: &Connection, id: i64) -> rusqlite::Result<Option<Document>> {
    conn.query_row(
        "SELECT id, title, body, kind, timestamp, sender, metadata
         FROM documents WHERE id = ?1",
        [id],
        parse_document_row,
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    })
}

/// Total corpus size.
pub fn count_documents_sync(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
}
