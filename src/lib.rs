pub mod client;
pub mod config;
pub mod model;
pub mod orchestrator;
pub mod plugins;
pub mod report;
pub mod retry;

// Re-export common types for convenience
pub use config::Config;
pub use model::*;
pub use orchestrator::{default_registry, ImportSource, IngestRequest, Orchestrator};
pub use report::ReportStore;
pub use retry::CancelFlag;
