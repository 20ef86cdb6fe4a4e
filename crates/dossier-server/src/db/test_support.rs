// crates/dossier-server/src/db/test_support.rs
// Shared fixtures for engine tests

use std::sync::Arc;

use chrono::NaiveDate;
use dossier_types::{Document, DocumentKind};

use super::documents::insert_document_sync;
use super::pool::DatabasePool;

/// Open an in-memory pool (shared cache, migrated).
pub async fn open_pool() -> Arc<DatabasePool> {
    Arc::new(
        DatabasePool::open_in_memory()
            .await
            .expect("in-memory pool"),
    )
}

/// The three-document corpus used by the end-to-end scenarios:
/// a flight log, a deposition, and an unrelated newsletter.
pub fn scenario_corpus() -> Vec<Document> {
    vec![
        Document {
            id: 10,
            title: "Flight log 2002".into(),
            body: "Passenger list: A, B.".into(),
            kind: DocumentKind::Log,
            timestamp: NaiveDate::from_ymd_opt(2002, 6, 1),
            sender: None,
            metadata: serde_json::json!({}),
        },
        Document {
            id: 11,
            title: "Deposition of A".into(),
            body: "Met B on island.".into(),
            kind: DocumentKind::Deposition,
            timestamp: NaiveDate::from_ymd_opt(2004, 2, 11),
            sender: None,
            metadata: serde_json::json!({}),
        },
        Document {
            id: 12,
            title: "Unrelated newsletter".into(),
            body: "Weekly discount.".into(),
            kind: DocumentKind::Email,
            timestamp: NaiveDate::from_ymd_opt(2019, 9, 30),
            sender: Some("promo@example.com".into()),
            metadata: serde_json::json!({}),
        },
    ]
}

/// Open an in-memory pool pre-seeded with the scenario corpus.
pub async fn open_seeded_pool() -> Arc<DatabasePool> {
    let pool = open_pool().await;
    let docs = scenario_corpus();
    pool.write(move |conn| {
        for doc in &docs {
            insert_document_sync(conn, doc)?;
        }
        Ok(())
    })
    .await
    .expect("seed corpus");
    pool
}
