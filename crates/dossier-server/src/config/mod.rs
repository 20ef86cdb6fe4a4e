// crates/dossier-server/src/config/mod.rs
// Configuration loading

mod env;

pub use env::{EngineConfig, RankingConfig, Timeouts};
