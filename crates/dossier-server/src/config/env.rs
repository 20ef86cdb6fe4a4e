// crates/dossier-server/src/config/env.rs
// Environment-based configuration - single source of truth for all env vars

use std::time::Duration;
use tracing::{debug, info, warn};

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!("Ignoring unparseable {}={:?}, using default", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

/// Read a single string variable, filtering empty values
fn read_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Score composition weights for the search index.
///
/// The composite score is `lexical + recency_weight * decay + kind_weight`
/// where `decay` falls linearly from 1.0 (today) to 0.0 at five years old.
/// Defaults here are the documented deployment baseline; every value is
/// overridable per deploy.
#[derive(Debug, Clone)]
pub struct RankingConfig {
    pub recency_weight: f64,
    pub weight_deposition: f64,
    pub weight_filing: f64,
    pub weight_email: f64,
    pub weight_log: f64,
    pub weight_other: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            recency_weight: 2.0,
            weight_deposition: 1.5,
            weight_filing: 1.5,
            weight_email: 1.0,
            weight_log: 0.5,
            weight_other: 0.75,
        }
    }
}

impl RankingConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            recency_weight: parse_env("RANKING_RECENCY_WEIGHT", d.recency_weight),
            weight_deposition: parse_env("RANKING_WEIGHT_DEPOSITION", d.weight_deposition),
            weight_filing: parse_env("RANKING_WEIGHT_FILING", d.weight_filing),
            weight_email: parse_env("RANKING_WEIGHT_EMAIL", d.weight_email),
            weight_log: parse_env("RANKING_WEIGHT_LOG", d.weight_log),
            weight_other: parse_env("RANKING_WEIGHT_OTHER", d.weight_other),
        }
    }
}

/// Per-stage and whole-invocation deadlines.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub intent: Duration,
    pub search: Duration,
    pub analyze: Duration,
    pub format: Duration,
    pub invocation: Duration,
    pub external_call: Duration,
    pub local_generation: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            intent: Duration::from_secs(8),
            search: Duration::from_secs(2),
            analyze: Duration::from_secs(60),
            format: Duration::from_secs(30),
            invocation: Duration::from_secs(120),
            external_call: Duration::from_secs(120),
            local_generation: Duration::from_secs(60),
        }
    }
}

/// All engine configuration, read once at startup.
///
/// Handlers receive this through the shared state; nothing else in the
/// engine reads environment variables directly.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Admitted invocations per client IP per UTC day (MAX_PER_IP_PER_DAY)
    pub max_per_ip_per_day: u32,
    /// Paid-model calls per UTC day across all clients (EXTERNAL_DAILY_CAP)
    pub external_daily_cap: u32,
    /// Paid-model spend ceiling per UTC day in micro-USD (COST_CAP_MICRO_USD)
    pub cost_cap_micro_usd: u64,
    /// Local model worker count N (LOCAL_POOL_SIZE)
    pub local_pool_size: usize,
    /// Local model queue capacity Q (LOCAL_QUEUE_CAPACITY)
    pub local_queue_capacity: usize,
    /// Base URL of the local inference server (LOCAL_MODEL_URL)
    pub local_model_url: String,
    /// Model name or path served by the local server (LOCAL_MODEL_PATH)
    pub local_model_path: String,
    /// Paid external model API key (EXTERNAL_API_KEY); None disables C3
    pub external_api_key: Option<String>,
    /// Paid external model endpoint (EXTERNAL_API_URL)
    pub external_api_url: String,
    /// Paid external model name (EXTERNAL_MODEL)
    pub external_model: String,
    /// Server-secret key for the per-IP counter hash (IP_HASH_SECRET)
    pub ip_hash_secret: String,
    /// SQLite database path (DATABASE_URL)
    pub database_url: String,
    /// HTTP listen address (BIND_ADDR)
    pub bind_addr: String,
    /// Expansion tokens for the `connections` intent (CONNECTION_EXPANSION_TERMS)
    pub connection_expansion_terms: Vec<String>,
    /// Minimum normalized edit distance between an auto-generated follow-up
    /// and every previous user question (AUTO_SIMILARITY_THRESHOLD)
    pub auto_distance_threshold: f64,
    pub ranking: RankingConfig,
    pub timeouts: Timeouts,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_per_ip_per_day: 30,
            external_daily_cap: 200,
            cost_cap_micro_usd: 5_000_000,
            local_pool_size: 2,
            local_queue_capacity: 16,
            local_model_url: "http://localhost:11434".to_string(),
            local_model_path: "llama3.3".to_string(),
            external_api_key: None,
            external_api_url: "https://api.deepseek.com/chat/completions".to_string(),
            external_model: "deepseek-chat".to_string(),
            ip_hash_secret: String::new(),
            database_url: "dossier.db".to_string(),
            bind_addr: "127.0.0.1:8600".to_string(),
            connection_expansion_terms: vec![
                "with".to_string(),
                "between".to_string(),
                "meeting".to_string(),
            ],
            auto_distance_threshold: 0.25,
            ranking: RankingConfig::default(),
            timeouts: Timeouts::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Missing values fall back to documented defaults. A missing
    /// IP_HASH_SECRET gets a random per-process key (counters then reset
    /// across restarts, which is safe but noisy - hence the warning).
    pub fn from_env() -> Self {
        let d = Self::default();

        let ip_hash_secret = read_string("IP_HASH_SECRET").unwrap_or_else(|| {
            warn!("IP_HASH_SECRET not set - using a random per-process key");
            uuid::Uuid::new_v4().to_string()
        });

        let external_api_key = read_string("EXTERNAL_API_KEY");
        if external_api_key.is_none() {
            warn!("EXTERNAL_API_KEY not set - analysis will always use the local fallback");
        }

        let connection_expansion_terms = read_string("CONNECTION_EXPANSION_TERMS")
            .map(|raw| {
                raw.split(',')
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or(d.connection_expansion_terms);

        let config = Self {
            max_per_ip_per_day: parse_env("MAX_PER_IP_PER_DAY", d.max_per_ip_per_day),
            external_daily_cap: parse_env("EXTERNAL_DAILY_CAP", d.external_daily_cap),
            cost_cap_micro_usd: parse_env("COST_CAP_MICRO_USD", d.cost_cap_micro_usd),
            local_pool_size: parse_env("LOCAL_POOL_SIZE", d.local_pool_size).max(1),
            local_queue_capacity: parse_env("LOCAL_QUEUE_CAPACITY", d.local_queue_capacity).max(1),
            local_model_url: read_string("LOCAL_MODEL_URL").unwrap_or(d.local_model_url),
            local_model_path: read_string("LOCAL_MODEL_PATH").unwrap_or(d.local_model_path),
            external_api_key,
            external_api_url: read_string("EXTERNAL_API_URL").unwrap_or(d.external_api_url),
            external_model: read_string("EXTERNAL_MODEL").unwrap_or(d.external_model),
            ip_hash_secret,
            database_url: read_string("DATABASE_URL").unwrap_or(d.database_url),
            bind_addr: read_string("BIND_ADDR").unwrap_or(d.bind_addr),
            connection_expansion_terms,
            auto_distance_threshold: parse_env(
                "AUTO_SIMILARITY_THRESHOLD",
                d.auto_distance_threshold,
            ),
            ranking: RankingConfig::from_env(),
            timeouts: Timeouts::default(),
        };

        config.log_status();
        config
    }

    /// Log the effective limits (without exposing secrets)
    fn log_status(&self) {
        info!(
            max_per_ip_per_day = self.max_per_ip_per_day,
            external_daily_cap = self.external_daily_cap,
            cost_cap_micro_usd = self.cost_cap_micro_usd,
            local_pool_size = self.local_pool_size,
            local_queue_capacity = self.local_queue_capacity,
            "Engine limits configured"
        );
        debug!(
            local_model_url = %self.local_model_url,
            external_model = %self.external_model,
            bind_addr = %self.bind_addr,
            "Engine endpoints configured"
        );
    }
}
