// crates/dossier-server/src/db/mod.rs
// Unified database layer with rusqlite behind an async pool

mod audit;
mod auto_sessions;
mod conversations;
mod counters;
mod documents;
pub mod pool;
mod schema;
mod search;
#[cfg(test)]
pub mod test_support;

pub use audit::{ExternalCallRecord, count_external_calls_sync, record_external_call_sync};
pub use auto_sessions::{
    bump_query_count_sync, create_auto_session_sync, get_auto_session_sync,
    get_running_session_sync, request_stop_sync, set_session_status_sync,
};
pub use conversations::{
    append_exchange_sync, append_message_sync, create_conversation_sync, delete_conversation_sync,
    derive_title, get_conversation_sync, get_messages_sync, last_user_message_sync,
    list_conversations_sync, user_questions_sync,
};
pub use counters::{
    BudgetState, charge_budget_sync, increment_rate_counter_sync, rate_count_sync,
    read_budget_sync, total_admissions_sync,
};
pub use documents::{count_documents_sync, get_document_sync, insert_document_sync};
pub use pool::{DatabasePool, PoolStatus};
pub use search::{FtsCandidate, fts_search_sync};

/// Current UTC date as the day-bucket key for counters and audit rows.
pub fn today_utc() -> String {
    chrono::Utc::now().date_naive().to_string()
}
