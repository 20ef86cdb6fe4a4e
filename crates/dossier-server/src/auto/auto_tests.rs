// crates/dossier-server/src/auto/auto_tests.rs
// Auto-investigation loop tests over a scripted model

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use dossier_types::{AutoSessionStatus, MessageRole, StreamEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::*;
use crate::config::EngineConfig;
use crate::db::test_support::open_seeded_pool;
use crate::db::{append_message_sync, create_conversation_sync, get_messages_sync, request_stop_sync};
use crate::llm::backend::testing::{ScriptStep, ScriptedBackend};
use crate::services::Services;

const SEED_QUESTION: &str = "What happened in 2002?";

fn ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5))
}

fn iteration_steps(entity: &str, suggestion: &str) -> Vec<ScriptStep> {
    vec![
        ScriptStep::Reply(format!(
            r#"{{"intent": "search", "entities": ["{entity}"]}}"#
        )),
        ScriptStep::Reply(format!(
            r#"{{"findings": ["finding about {entity}"], "sources": [11], "suggested_queries": ["{suggestion}"]}}"#
        )),
        ScriptStep::Reply("Grounded answer [#11].\nSources: [#11]".into()),
    ]
}

async fn services_with_conversation(
    steps: Vec<ScriptStep>,
    config: EngineConfig,
) -> (Services, Uuid) {
    let db = open_seeded_pool().await;
    let services = Services::assemble(config, db, Arc::new(ScriptedBackend::new(steps)));

    let conversation_id = Uuid::new_v4();
    services
        .db
        .write(move |conn| {
            create_conversation_sync(conn, conversation_id, "island case")?;
            append_message_sync(conn, &conversation_id, MessageRole::User, SEED_QUESTION, &[], false)?;
            Ok(())
        })
        .await
        .unwrap();

    (services, conversation_id)
}

fn test_config() -> EngineConfig {
    EngineConfig {
        ip_hash_secret: "test".into(),
        ..EngineConfig::default()
    }
}

async fn run_and_collect(
    services: &Services,
    session: dossier_types::AutoSession,
) -> Vec<StreamEvent> {
    let (tx, mut rx) = mpsc::channel(256);
    let cancel = CancellationToken::new();
    run_auto_session(services, session, ip(), &tx, &cancel)
        .await
        .unwrap();
    drop(tx);
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    events
}

fn auto_queries(events: &[StreamEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::AutoQuery { query } => Some(query.clone()),
            _ => None,
        })
        .collect()
}

fn completion_total(events: &[StreamEvent]) -> Option<u32> {
    events.iter().find_map(|e| match e {
        StreamEvent::AutoComplete { total_queries } => Some(*total_queries),
        _ => None,
    })
}

// ============================================================================
// Similarity guard
// ============================================================================

#[test]
fn test_question_distance_extremes() {
    assert_eq!(question_distance("same question", "same question"), 0.0);
    assert!(question_distance("who flew with A", "qzx vbn mlk") > 0.5);
}

#[test]
fn test_pick_next_skips_near_duplicates() {
    let previous = vec!["What happened in 2002?".to_string()];
    let suggestions = vec![
        "What happened in 2002 ?".to_string(), // near-duplicate
        "Who was on the flight log?".to_string(),
    ];
    let picked = pick_next_question(&suggestions, &previous, 0.25).unwrap();
    assert_eq!(picked, "Who was on the flight log?");
}

#[test]
fn test_pick_next_none_when_all_repeat() {
    let previous = vec!["Who was on the flight log?".to_string()];
    let suggestions = vec!["Who was on the flight log?".to_string(), "  ".to_string()];
    assert!(pick_next_question(&suggestions, &previous, 0.25).is_none());
}

// ============================================================================
// Session start validation
// ============================================================================

#[tokio::test]
async fn test_start_session_bounds_max_queries() {
    let (services, conversation_id) = services_with_conversation(vec![], test_config()).await;
    assert!(start_session(&services, conversation_id, 0).await.is_err());
    assert!(start_session(&services, conversation_id, 51).await.is_err());
    assert!(start_session(&services, conversation_id, 3).await.is_ok());
}

#[tokio::test]
async fn test_start_session_unknown_conversation() {
    let (services, _) = services_with_conversation(vec![], test_config()).await;
    let res = start_session(&services, Uuid::new_v4(), 3).await;
    assert!(res.is_err());
}

#[tokio::test]
async fn test_start_session_rejects_second_running() {
    let (services, conversation_id) = services_with_conversation(vec![], test_config()).await;
    start_session(&services, conversation_id, 3).await.unwrap();
    let res = start_session(&services, conversation_id, 3).await;
    assert!(matches!(res, Err(crate::error::EngineError::InvalidQuery(_))));
}

// ============================================================================
// Full sessions
// ============================================================================

#[tokio::test]
async fn test_three_iteration_session() {
    let mut steps = Vec::new();
    steps.extend(iteration_steps("island", "Who was on the flight log?"));
    steps.extend(iteration_steps("flight", "Which depositions mention the island?"));
    steps.extend(iteration_steps("deposition", "What happened in 2002?"));

    let (services, conversation_id) = services_with_conversation(steps, test_config()).await;
    let session = start_session(&services, conversation_id, 3).await.unwrap();
    let events = run_and_collect(&services, session).await;

    // Three distinct auto queries, the first being the seed question
    let queries = auto_queries(&events);
    assert_eq!(queries.len(), 3);
    assert_eq!(queries[0], SEED_QUESTION);
    for pair in queries.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }

    assert_eq!(completion_total(&events), Some(3));
    assert!(matches!(events.last(), Some(StreamEvent::Done)));

    // Nested pipeline status events are tagged for the caller
    assert!(events.iter().any(|e| matches!(e, StreamEvent::AutoStatus { .. })));
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Status { .. })));

    // Session completed; query_count within bounds
    let session = services
        .db
        .read(move |conn| crate::db::get_running_session_sync(conn, &conversation_id))
        .await
        .unwrap();
    assert!(session.is_none(), "session must have left running state");

    // No two consecutive user questions are equal
    let messages = services
        .db
        .read(move |conn| get_messages_sync(conn, &conversation_id))
        .await
        .unwrap();
    let user_contents: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .map(|m| m.content.as_str())
        .collect();
    for pair in user_contents.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }
    // Seed question + two novel follow-ups
    assert_eq!(user_contents.len(), 3);
}

#[tokio::test]
async fn test_session_ends_early_without_novel_suggestion() {
    // The only suggestion repeats the seed question
    let steps = iteration_steps("island", SEED_QUESTION);
    let (services, conversation_id) = services_with_conversation(steps, test_config()).await;
    let session = start_session(&services, conversation_id, 5).await.unwrap();
    let events = run_and_collect(&services, session).await;

    assert_eq!(auto_queries(&events).len(), 1);
    assert_eq!(completion_total(&events), Some(1));
}

#[tokio::test]
async fn test_stop_signal_observed_at_boundary() {
    let (services, conversation_id) = services_with_conversation(vec![], test_config()).await;
    let session = start_session(&services, conversation_id, 5).await.unwrap();

    // External stop lands before the first iteration boundary
    services
        .db
        .write(move |conn| Ok(request_stop_sync(conn, &conversation_id)?))
        .await
        .unwrap();

    let events = run_and_collect(&services, session).await;
    assert!(auto_queries(&events).is_empty());
    assert_eq!(completion_total(&events), Some(0));
}

#[tokio::test]
async fn test_empty_conversation_emits_error() {
    let db = open_seeded_pool().await;
    let services = Services::assemble(test_config(), db, Arc::new(ScriptedBackend::new(vec![])));
    let conversation_id = Uuid::new_v4();
    services
        .db
        .write(move |conn| Ok(create_conversation_sync(conn, conversation_id, "empty")?))
        .await
        .unwrap();

    let session = start_session(&services, conversation_id, 3).await.unwrap();
    let events = run_and_collect(&services, session).await;

    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::Error { code: 400, .. }
    )));
    assert_eq!(completion_total(&events), Some(0));
}

#[tokio::test]
async fn test_rate_limit_mid_session_stops() {
    let mut steps = Vec::new();
    steps.extend(iteration_steps("island", "Who was on the flight log?"));

    let config = EngineConfig {
        max_per_ip_per_day: 1,
        ..test_config()
    };
    let (services, conversation_id) = services_with_conversation(steps, config).await;
    let session = start_session(&services, conversation_id, 5).await.unwrap();
    let session_id = session.id;
    let events = run_and_collect(&services, session).await;

    // One iteration ran, the second was denied admission
    assert_eq!(auto_queries(&events).len(), 1);
    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::Error { code: 429, .. }
    )));
    assert_eq!(completion_total(&events), Some(1));

    let stored = services
        .db
        .read(move |conn| crate::db::get_auto_session_sync(conn, session_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, AutoSessionStatus::Stopped);
}
