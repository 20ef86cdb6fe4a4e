// crates/dossier-server/src/db/schema.rs
// Database schema and migrations

use anyhow::Result;
use rusqlite::Connection;

/// Base schema. Every statement is idempotent (IF NOT EXISTS) so the
/// batch can run on every startup.
const SCHEMA: &str = r#"
-- Immutable corpus (written by the ingestion collaborator, read-only here)
CREATE TABLE IF NOT EXISTS documents (
    id          INTEGER PRIMARY KEY,
    title       TEXT NOT NULL,
    body        TEXT NOT NULL,
    kind        TEXT NOT NULL DEFAULT 'other',
    timestamp   TEXT,
    sender      TEXT,
    metadata    TEXT NOT NULL DEFAULT '{}',
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS conversations (
    id          TEXT PRIMARY KEY,
    title       TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role            TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
    content         TEXT NOT NULL,
    sources         TEXT NOT NULL DEFAULT '[]',
    is_auto         INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, created_at);

CREATE TABLE IF NOT EXISTS auto_sessions (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    status          TEXT NOT NULL DEFAULT 'running'
                    CHECK (status IN ('running', 'stopped', 'completed')),
    query_count     INTEGER NOT NULL DEFAULT 0,
    max_queries     INTEGER NOT NULL,
    started_at      TEXT NOT NULL DEFAULT (datetime('now')),
    stopped_at      TEXT
);
-- At most one running session per conversation
CREATE UNIQUE INDEX IF NOT EXISTS idx_auto_sessions_running
    ON auto_sessions(conversation_id) WHERE status = 'running';

-- Per-IP daily admission counters (keyed hash, never raw IPs)
CREATE TABLE IF NOT EXISTS rate_counters (
    ip_hash TEXT NOT NULL,
    day     TEXT NOT NULL,
    count   INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (ip_hash, day)
);

-- Global daily paid-model budget
CREATE TABLE IF NOT EXISTS budget_counters (
    day            TEXT PRIMARY KEY,
    external_calls INTEGER NOT NULL DEFAULT 0,
    cost_micro_usd INTEGER NOT NULL DEFAULT 0
);

-- One row per call that reached the paid external endpoint
CREATE TABLE IF NOT EXISTS audit_external_calls (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id     TEXT NOT NULL,
    day            TEXT NOT NULL,
    model          TEXT NOT NULL,
    tokens_in      INTEGER NOT NULL,
    tokens_out     INTEGER NOT NULL,
    cost_micro_usd INTEGER NOT NULL,
    duration_ms    INTEGER,
    created_at     TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_audit_external_calls_day
    ON audit_external_calls(day);
"#;

/// Run all schema setup and migrations.
///
/// Called during database initialization. This function is idempotent -
/// it checks for existing tables before making changes.
pub fn run_all_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    migrate_documents_fts(conn)?;

    Ok(())
}

/// Create the FTS5 index over documents(title, body) with sync triggers.
///
/// Uses an external-content table so document text is stored once. The
/// triggers keep the index current for inserts from the ingestion
/// collaborator; documents are immutable, but delete/update triggers are
/// present so re-ingestion cannot silently corrupt the index.
fn migrate_documents_fts(conn: &Connection) -> Result<()> {
    let exists: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
            [],
            |_| Ok(true),
        )
        .unwrap_or(false);

    if !exists {
        conn.execute_batch(
            "CREATE VIRTUAL TABLE documents_fts USING fts5(
                 title, body,
                 content='documents',
                 content_rowid='id',
                 tokenize='porter unicode61'
             );
             INSERT INTO documents_fts(rowid, title, body)
                 SELECT id, title, body FROM documents;",
        )?;
        tracing::info!("Created documents_fts full-text index");
    }

    conn.execute_batch(
        "CREATE TRIGGER IF NOT EXISTS documents_ai AFTER INSERT ON documents BEGIN
             INSERT INTO documents_fts(rowid, title, body)
                 VALUES (new.id, new.title, new.body);
         END;
         CREATE TRIGGER IF NOT EXISTS documents_ad AFTER DELETE ON documents BEGIN
             INSERT INTO documents_fts(documents_fts, rowid, title, body)
                 VALUES ('delete', old.id, old.title, old.body);
         END;
         CREATE TRIGGER IF NOT EXISTS documents_au AFTER UPDATE ON documents BEGIN
             INSERT INTO documents_fts(documents_fts, rowid, title, body)
                 VALUES ('delete', old.id, old.title, old.body);
             INSERT INTO documents_fts(rowid, title, body)
                 VALUES (new.id, new.title, new.body);
         END;",
    )?;

    Ok(())
}
