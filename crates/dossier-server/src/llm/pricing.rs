// crates/dossier-server/src/llm/pricing.rs
// External model cost table for budget accounting
//
// Pricing last updated: 2026-01-26
// The table is a versioned configuration input: deploys pin a table by
// setting EXTERNAL_COST_TABLE to a JSON object of
// {"model": {"input_per_million_micro": N, "output_per_million_micro": N}}.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::warn;

/// Cost per million tokens, in micro-USD.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ModelPricing {
    pub input_per_million_micro: u64,
    pub output_per_million_micro: u64,
}

impl ModelPricing {
    const fn new(input: u64, output: u64) -> Self {
        Self {
            input_per_million_micro: input,
            output_per_million_micro: output,
        }
    }

    /// Cost of one call in micro-USD, rounded up so budget accounting
    /// never undercounts.
    pub fn cost_micro_usd(&self, tokens_in: u32, tokens_out: u32) -> u64 {
        let input = (tokens_in as u64 * self.input_per_million_micro).div_ceil(1_000_000);
        let output = (tokens_out as u64 * self.output_per_million_micro).div_ceil(1_000_000);
        input + output
    }
}

/// Fallback entry for models missing from the table.
const DEFAULT_PRICING: ModelPricing = ModelPricing::new(280_000, 420_000);

/// Per-model cost table.
#[derive(Debug, Clone)]
pub struct CostTable {
    entries: HashMap<String, ModelPricing>,
}

impl Default for CostTable {
    fn default() -> Self {
        let mut entries = HashMap::new();
        // $0.28/1M in, $0.42/1M out
        entries.insert("deepseek-chat".to_string(), ModelPricing::new(280_000, 420_000));
        entries.insert(
            "deepseek-reasoner".to_string(),
            ModelPricing::new(280_000, 420_000),
        );
        // $1.25/1M in, $10/1M out
        entries.insert(
            "gemini-3-pro-preview".to_string(),
            ModelPricing::new(1_250_000, 10_000_000),
        );
        Self { entries }
    }
}

impl CostTable {
    /// Load the table, applying the EXTERNAL_COST_TABLE override if set.
    pub fn from_env() -> Self {
        let mut table = Self::default();
        if let Ok(raw) = std::env::var("EXTERNAL_COST_TABLE") {
            match serde_json::from_str::<HashMap<String, ModelPricing>>(&raw) {
                Ok(overrides) => {
                    for (model, pricing) in overrides {
                        table.entries.insert(model, pricing);
                    }
                }
                Err(e) => warn!("Ignoring unparseable EXTERNAL_COST_TABLE: {e}"),
            }
        }
        table
    }

    /// Pricing for a model; unknown models use the default entry.
    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        self.entries.get(model).copied().unwrap_or(DEFAULT_PRICING)
    }
}
