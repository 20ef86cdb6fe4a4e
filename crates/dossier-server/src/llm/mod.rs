// crates/dossier-server/src/llm/mod.rs
// Model access: local worker pool and external analyst client

pub mod backend;
pub mod external;
pub mod pool;
pub mod pricing;
pub mod types;

pub use backend::{CompletionBackend, HttpLocalBackend};
pub use external::ExternalModelClient;
pub use pool::LocalModelPool;
pub use types::CompletionRequest;
