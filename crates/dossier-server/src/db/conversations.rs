// crates/dossier-server/src/db/conversations.rs
// Conversation store: persisted conversations and append-only message logs

use chrono::{NaiveDateTime, Utc};
use dossier_types::{Conversation, Message, MessageRole};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

/// Timestamp format for conversations and messages. Millisecond precision
/// and fixed width, so lexicographic order equals chronological order.
const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

fn now_stamp() -> String {
    Utc::now().format(TS_FORMAT).to_string()
}

fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_conversation_row(row: &Row) -> rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    Ok(Conversation {
        id: parse_uuid(&id)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

/// Parse a `messages` row in column order
/// (id, conversation_id, role, content, sources, is_auto, created_at).
pub fn parse_message_row(row: &Row) -> rusqlite::Result<Message> {
    let conversation_id: String = row.get(1)?;
    let role: String = row.get(2)?;
    let sources: String = row.get(4)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: parse_uuid(&conversation_id)?,
        role: MessageRole::parse(&role).unwrap_or(MessageRole::User),
        content: row.get(3)?,
        // sources is never null; tolerate legacy garbage as empty
        sources: serde_json::from_str(&sources).unwrap_or_default(),
        is_auto: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
    })
}

/// Derive a conversation title from its first question: truncated to 80
/// chars on a word boundary.
pub fn derive_title(question: &str) -> String {
    let q = question.trim();
    if q.chars().count() <= 80 {
        return q.to_string();
    }
    let cut: String = q.chars().take(80).collect();
    let truncated = match cut.rfind(char::is_whitespace) {
        Some(pos) if pos > 20 => &cut[..pos],
        _ => cut.as_str(),
    };
    format!("{}…", truncated.trim_end())
}

/// Create a conversation with the given id and title.
pub fn create_conversation_sync(
    conn: &Connection,
    id: Uuid,
    title: &str,
) -> rusqlite::Result<Conversation> {
    let now = now_stamp();
    conn.execute(
        "INSERT INTO conversations (id, title, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)",
        params![id.to_string(), title, now],
    )?;
    Ok(Conversation {
        id,
        title: title.to_string(),
        created_at: now.clone(),
        updated_at: now,
    })
}

/// List all conversations, most recently updated first.
pub fn list_conversations_sync(conn: &Connection) -> rusqlite::Result<Vec<Conversation>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, created_at, updated_at
         FROM conversations ORDER BY updated_at DESC, id",
    )?;
    let rows = stmt.query_map([], parse_conversation_row)?;
    rows.collect()
}

/// Fetch one conversation.
pub fn get_conversation_sync(
    conn: &Connection,
    id: &Uuid,
) -> rusqlite::Result<Option<Conversation>> {
    conn.query_row(
        "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?1",
        [id.to_string()],
        parse_conversation_row,
    )
    .optional()
}

/// All messages of a conversation, oldest first.
pub fn get_messages_sync(conn: &Connection, id: &Uuid) -> rusqlite::Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, role, content, sources, is_auto, created_at
         FROM messages WHERE conversation_id = ?1
         ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map([id.to_string()], parse_message_row)?;
    rows.collect()
}

/// The most recent user message of a conversation, if any.
pub fn last_user_message_sync(conn: &Connection, id: &Uuid) -> rusqlite::Result<Option<Message>> {
    conn.query_row(
        "SELECT id, conversation_id, role, content, sources, is_auto, created_at
         FROM messages WHERE conversation_id = ?1 AND role = 'user'
         ORDER BY created_at DESC, id DESC LIMIT 1",
        [id.to_string()],
        parse_message_row,
    )
    .optional()
}

/// All user question texts of a conversation, oldest first. Used by the
/// auto-investigator's repeat guard.
pub fn user_questions_sync(conn: &Connection, id: &Uuid) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT content FROM messages
         WHERE conversation_id = ?1 AND role = 'user'
         ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map([id.to_string()], |row| row.get(0))?;
    rows.collect()
}

/// Next message timestamp for a conversation: strictly greater than every
/// existing message's `created_at`, even when appends land within the
/// same millisecond.
fn next_created_at(conn: &Connection, id: &Uuid) -> rusqlite::Result<String> {
    let last: Option<String> = conn
        .query_row(
            "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?
        .flatten();

    let now = now_stamp();
    match last {
        Some(last) if last >= now => {
            let bumped = NaiveDateTime::parse_from_str(&last, TS_FORMAT)
                .map(|t| t + chrono::Duration::milliseconds(1))
                .unwrap_or_else(|_| Utc::now().naive_utc());
            Ok(bumped.format(TS_FORMAT).to_string())
        }
        _ => Ok(now),
    }
}

/// Insert one message and bump the conversation's `updated_at` in the
/// same transaction (invariant: `updated_at` equals the `created_at` of
/// the newest message).
pub fn append_message_sync(
    conn: &Connection,
    conversation_id: &Uuid,
    role: MessageRole,
    content: &str,
    sources: &[i64],
    is_auto: bool,
) -> anyhow::Result<Message> {
    let tx = conn.unchecked_transaction()?;
    let message = insert_message(&tx, conversation_id, role, content, sources, is_auto)?;
    tx.commit()?;
    Ok(message)
}

/// Append a question/answer pair as one logical transaction.
///
/// When `is_auto` is set and the question equals the conversation's last
/// user message, the user row is skipped: the auto-investigator's first
/// iteration answers the question that is already on record, and the log
/// must never contain two equal consecutive user questions.
pub fn append_exchange_sync(
    conn: &Connection,
    conversation_id: &Uuid,
    question: &str,
    answer: &str,
    sources: &[i64],
    is_auto: bool,
) -> anyhow::Result<()> {
    let tx = conn.unchecked_transaction()?;

    let skip_user = is_auto
        && last_user_message_sync(&tx, conversation_id)?
            .map(|m| m.content == question)
            .unwrap_or(false);

    if !skip_user {
        insert_message(&tx, conversation_id, MessageRole::User, question, &[], is_auto)?;
    }
    insert_message(
        &tx,
        conversation_id,
        MessageRole::Assistant,
        answer,
        sources,
        is_auto,
    )?;

    tx.commit()?;
    Ok(())
}

fn insert_message(
    conn: &Connection,
    conversation_id: &Uuid,
    role: MessageRole,
    content: &str,
    sources: &[i64],
    is_auto: bool,
) -> anyhow::Result<Message> {
    let created_at = next_created_at(conn, conversation_id)?;
    let sources_json = serde_json::to_string(sources)?;

    conn.execute(
        "INSERT INTO messages (conversation_id, role, content, sources, is_auto, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            conversation_id.to_string(),
            role.as_str(),
            content,
            sources_json,
            is_auto as i64,
            created_at,
        ],
    )?;
    let id = conn.last_insert_rowid();

    conn.execute(
        "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
        params![created_at, conversation_id.to_string()],
    )?;

    Ok(Message {
        id,
        conversation_id: *conversation_id,
        role,
        content: content.to_string(),
        sources: sources.to_vec(),
        is_auto,
        created_at,
    })
}

/// Delete a conversation; messages and auto sessions cascade.
/// Returns true when a row was removed.
pub fn delete_conversation_sync(conn: &Connection, id: &Uuid) -> rusqlite::Result<bool> {
    let n = conn.execute(
        "DELETE FROM conversations WHERE id = ?1",
        [id.to_string()],
    )?;
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_all_migrations;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        run_all_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_append_then_get_roundtrip() {
        let conn = open();
        let id = Uuid::new_v4();
        create_conversation_sync(&conn, id, "island case").unwrap();

        append_message_sync(&conn, &id, MessageRole::User, "who flew with A", &[], false).unwrap();
        append_message_sync(
            &conn,
            &id,
            MessageRole::Assistant,
            "B flew with A [#10]",
            &[10, 11],
            false,
        )
        .unwrap();

        let messages = get_messages_sync(&conn, &id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].sources, Vec::<i64>::new());
        assert_eq!(messages[1].content, "B flew with A [#10]");
        assert_eq!(messages[1].sources, vec![10, 11]);
    }

    #[test]
    fn test_created_at_strictly_increasing() {
        let conn = open();
        let id = Uuid::new_v4();
        create_conversation_sync(&conn, id, "t").unwrap();

        // Rapid appends land within the same millisecond; created_at must
        // still be strictly increasing.
        for i in 0..20 {
            append_message_sync(&conn, &id, MessageRole::User, &format!("q{i}"), &[], false)
                .unwrap();
        }

        let messages = get_messages_sync(&conn, &id).unwrap();
        for pair in messages.windows(2) {
            assert!(
                pair[0].created_at < pair[1].created_at,
                "{} !< {}",
                pair[0].created_at,
                pair[1].created_at
            );
        }
    }

    #[test]
    fn test_updated_at_tracks_newest_message() {
        let conn = open();
        let id = Uuid::new_v4();
        create_conversation_sync(&conn, id, "t").unwrap();
        let msg =
            append_message_sync(&conn, &id, MessageRole::User, "q", &[], false).unwrap();

        let convo = get_conversation_sync(&conn, &id).unwrap().unwrap();
        assert_eq!(convo.updated_at, msg.created_at);
    }

    #[test]
    fn test_exchange_is_two_messages_in_order() {
        let conn = open();
        let id = Uuid::new_v4();
        create_conversation_sync(&conn, id, "t").unwrap();

        append_exchange_sync(&conn, &id, "question", "answer [#101]", &[101], false).unwrap();

        let messages = get_messages_sync(&conn, &id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert!(messages[0].created_at < messages[1].created_at);
    }

    #[test]
    fn test_auto_exchange_skips_duplicate_user_question() {
        let conn = open();
        let id = Uuid::new_v4();
        create_conversation_sync(&conn, id, "t").unwrap();
        append_message_sync(&conn, &id, MessageRole::User, "What happened in 2002?", &[], false)
            .unwrap();

        append_exchange_sync(&conn, &id, "What happened in 2002?", "answer", &[10], true).unwrap();

        let messages = get_messages_sync(&conn, &id).unwrap();
        assert_eq!(messages.len(), 2, "duplicate user question must be skipped");
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert!(messages[1].is_auto);

        // A different question is appended normally
        append_exchange_sync(&conn, &id, "Who was on the island?", "answer2", &[], true).unwrap();
        let messages = get_messages_sync(&conn, &id).unwrap();
        assert_eq!(messages.len(), 4);
    }

    #[test]
    fn test_list_orders_by_updated_at_desc() {
        let conn = open();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        create_conversation_sync(&conn, a, "first").unwrap();
        create_conversation_sync(&conn, b, "second").unwrap();
        append_message_sync(&conn, &a, MessageRole::User, "bump", &[], false).unwrap();

        let list = list_conversations_sync(&conn).unwrap();
        assert_eq!(list[0].id, a);
    }

    #[test]
    fn test_delete_cascades_in_single_commit() {
        let conn = open();
        let id = Uuid::new_v4();
        create_conversation_sync(&conn, id, "t").unwrap();
        append_exchange_sync(&conn, &id, "q", "a", &[], false).unwrap();

        assert!(delete_conversation_sync(&conn, &id).unwrap());
        assert!(!delete_conversation_sync(&conn, &id).unwrap());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_derive_title_short_passthrough() {
        assert_eq!(derive_title(" who flew with A "), "who flew with A");
    }

    #[test]
    fn test_derive_title_truncates_on_word_boundary() {
        let long = "what connections existed between the island flights and the later \
                    court filings from the second quarter";
        let title = derive_title(long);
        assert!(title.chars().count() <= 81);
        assert!(title.ends_with('…'));
        assert!(!title.contains("quarter"));
    }

    #[test]
    fn test_user_questions_in_order() {
        let conn = open();
        let id = Uuid::new_v4();
        create_conversation_sync(&conn, id, "t").unwrap();
        append_exchange_sync(&conn, &id, "q1", "a1", &[], false).unwrap();
        append_exchange_sync(&conn, &id, "q2", "a2", &[], false).unwrap();

        assert_eq!(user_questions_sync(&conn, &id).unwrap(), vec!["q1", "q2"]);
        let last = last_user_message_sync(&conn, &id).unwrap().unwrap();
        assert_eq!(last.content, "q2");
    }
}
