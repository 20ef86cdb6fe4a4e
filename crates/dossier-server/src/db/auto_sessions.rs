// crates/dossier-server/src/db/auto_sessions.rs
// Auto-investigation session persistence

use dossier_types::{AutoSession, AutoSessionStatus};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

fn parse_auto_session_row(row: &Row) -> rusqlite::Result<AutoSession> {
    let conversation_id: String = row.get(1)?;
    let status: String = row.get(2)?;
    Ok(AutoSession {
        id: row.get(0)?,
        conversation_id: Uuid::parse_str(&conversation_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        status: AutoSessionStatus::parse(&status).unwrap_or(AutoSessionStatus::Stopped),
        query_count: row.get::<_, i64>(3)? as u32,
        max_queries: row.get::<_, i64>(4)? as u32,
        started_at: row.get(5)?,
        stopped_at: row.get(6)?,
    })
}

const SESSION_COLUMNS: &str =
    "id, conversation_id, status, query_count, max_queries, started_at, stopped_at";

/// Create a session in `running` state.
///
/// The partial unique index on running sessions rejects a second running
/// session for the same conversation; that constraint violation is
/// returned to the caller as-is.
pub fn create_auto_session_sync(
    conn: &Connection,
    conversation_id: &Uuid,
    max_queries: u32,
) -> rusqlite::Result<AutoSession> {
    conn.execute(
        "INSERT INTO auto_sessions (conversation_id, status, max_queries)
         VALUES (?1, 'running', ?2)",
        params![conversation_id.to_string(), max_queries],
    )?;
    let id = conn.last_insert_rowid();
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM auto_sessions WHERE id = ?1"),
        [id],
        parse_auto_session_row,
    )
}

/// Fetch a session by id.
pub fn get_auto_session_sync(
    conn: &Connection,
    id: i64,
) -> rusqlite::Result<Option<AutoSession>> {
    conn.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM auto_sessions WHERE id = ?1"),
        [id],
        parse_auto_session_row,
    )
    .optional()
}

/// The running session for a conversation, if any.
pub fn get_running_session_sync(
    conn: &Connection,
    conversation_id: &Uuid,
) -> rusqlite::Result<Option<AutoSession>> {
    conn.query_row(
        &format!(
            "SELECT {SESSION_COLUMNS} FROM auto_sessions
             WHERE conversation_id = ?1 AND status = 'running'"
        ),
        [conversation_id.to_string()],
        parse_auto_session_row,
    )
    .optional()
}

/// Move a session out of (or within) its lifecycle. Leaving `running`
/// stamps `stopped_at`.
pub fn set_session_status_sync(
    conn: &Connection,
    id: i64,
    status: AutoSessionStatus,
) -> rusqlite::Result<()> {
    let stamp_stop = !matches!(status, AutoSessionStatus::Running);
    conn.execute(
        "UPDATE auto_sessions
         SET status = ?1,
             stopped_at = CASE WHEN ?2 THEN datetime('now') ELSE stopped_at END
         WHERE id = ?3",
        params![status.as_str(), stamp_stop, id],
    )?;
    Ok(())
}

/// Request a stop for the conversation's running session (external
/// signal; the loop observes it between pipeline invocations).
/// Returns true when a running session was found.
pub fn request_stop_sync(conn: &Connection, conversation_id: &Uuid) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "UPDATE auto_sessions
         SET status = 'stopped', stopped_at = datetime('now')
         WHERE conversation_id = ?1 AND status = 'running'",
        [conversation_id.to_string()],
    )?;
    Ok(n > 0)
}

/// Increment the session's query counter, returning the new count.
pub fn bump_query_count_sync(conn: &Connection, id: i64) -> rusqlite::Result<u32> {
    conn.query_row(
        "UPDATE auto_sessions SET query_count = query_count + 1
         WHERE id = ?1 RETURNING query_count",
        [id],
        |row| row.get::<_, i64>(0).map(|c| c as u32),
    )
}
