// crates/dossier-server/src/services.rs
// Shared service context, constructed once at startup and passed by
// reference into handlers. No module-level mutable state anywhere.

use std::sync::Arc;

use anyhow::Result;

use crate::config::EngineConfig;
use crate::db::DatabasePool;
use crate::gate::AdmissionGate;
use crate::llm::{CompletionBackend, ExternalModelClient, HttpLocalBackend, LocalModelPool};
use crate::search::SearchIndex;

/// Everything a request handler needs, behind Arcs.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<EngineConfig>,
    pub db: Arc<DatabasePool>,
    pub index: Arc<SearchIndex>,
    pub local: Arc<LocalModelPool>,
    /// None when no EXTERNAL_API_KEY is configured; analysis then always
    /// takes the local path.
    pub external: Option<Arc<ExternalModelClient>>,
    pub gate: Arc<AdmissionGate>,
}

impl Services {
    /// Wire the full service graph from configuration: opens the
    /// database, warms the local pool, and enables the external client
    /// when its key is present.
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        let db = Arc::new(DatabasePool::open(std::path::Path::new(&config.database_url)).await?);
        let backend: Arc<dyn CompletionBackend> = Arc::new(HttpLocalBackend::new(
            &config.local_model_url,
            &config.local_model_path,
            config.timeouts.local_generation,
        ));
        Ok(Self::assemble(config, db, backend))
    }

    /// Wire the graph over an existing pool and completion backend
    /// (tests inject scripted backends and in-memory databases here).
    pub fn assemble(
        config: EngineConfig,
        db: Arc<DatabasePool>,
        backend: Arc<dyn CompletionBackend>,
    ) -> Self {
        let config = Arc::new(config);
        let index = Arc::new(SearchIndex::new(db.clone(), config.ranking.clone()));
        let local = Arc::new(LocalModelPool::new(
            backend,
            config.local_pool_size,
            config.local_queue_capacity,
        ));
        let external = ExternalModelClient::from_config(&config, db.clone()).map(Arc::new);
        let gate = Arc::new(AdmissionGate::new(db.clone(), config.clone()));

        Self {
            config,
            db,
            index,
            local,
            external,
            gate,
        }
    }
}
