// crates/dossier-server/src/gate/mod.rs
// Admission: per-IP day rate limiting and global budget state
//
// Two checks in order, both strict. The rate check is an unconditional
// increment-and-compare in one statement, so concurrent requests cannot
// slip past the cap through a read-check-write gap. The budget check is
// a read: exhaustion does not deny admission, it short-circuits the
// external model so the pipeline takes the local fallback.

use std::net::IpAddr;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::db::{DatabasePool, increment_rate_counter_sync, read_budget_sync, today_utc};
use crate::error::EngineError;

/// Result of a successful admission.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    /// True when today's external budget is spent; the pipeline must
    /// route analysis through the local model.
    pub budget_exhausted: bool,
}

/// Rate and budget gatekeeper, consulted before any pipeline work.
pub struct AdmissionGate {
    db: Arc<DatabasePool>,
    config: Arc<EngineConfig>,
}

impl AdmissionGate {
    pub fn new(db: Arc<DatabasePool>, config: Arc<EngineConfig>) -> Self {
        Self { db, config }
    }

    /// Keyed hash of the client IP. Raw IPs are never persisted.
    pub fn hash_ip(&self, ip: IpAddr) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.config.ip_hash_secret.as_bytes());
        hasher.update(ip.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Admit or deny an invocation from `ip`.
    ///
    /// Denial is `RateLimited` only; budget exhaustion admits with
    /// `budget_exhausted` set.
    pub async fn admit(&self, ip: IpAddr) -> Result<Admission, EngineError> {
        let ip_hash = self.hash_ip(ip);
        let day = today_utc();
        let cap = self.config.max_per_ip_per_day;

        let count = {
            let day = day.clone();
            self.db
                .write(move |conn| {
                    increment_rate_counter_sync(conn, &ip_hash, &day).map_err(Into::into)
                })
                .await
                .map_err(|e| EngineError::Other(format!("rate counter failed: {e}")))?
        };

        if count > cap {
            info!(count, cap, "Admission denied: per-IP daily cap");
            return Err(EngineError::RateLimited);
        }

        let budget_exhausted = self.budget_exhausted(&day).await?;
        debug!(count, budget_exhausted, "Admission granted");
        Ok(Admission { budget_exhausted })
    }

    /// Read-only budget state for a day.
    async fn budget_exhausted(&self, day: &str) -> Result<bool, EngineError> {
        let day = day.to_string();
        let budget = self
            .db
            .read(move |conn| read_budget_sync(conn, &day))
            .await
            .map_err(|e| EngineError::Other(format!("budget read failed: {e}")))?;

        Ok(budget.external_calls >= self.config.external_daily_cap
            || budget.cost_micro_usd >= self.config.cost_cap_micro_usd)
    }
}
