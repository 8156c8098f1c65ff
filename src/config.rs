//! Immutable process configuration.
//!
//! A [`Config`] is constructed once at startup and passed explicitly into the
//! orchestrator, retry policy, and external job clients. Core logic never
//! consults ambient/global state. How the values are loaded (environment,
//! file, flags) is up to the host process.

use std::path::PathBuf;
use std::time::Duration;

/// Selection strategy for the demo plugin when more records are available
/// than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoSelection {
    /// First N records in encounter order (deterministic).
    FirstN,

    /// Random subset per call. Intentionally non-reproducible across calls;
    /// no seeding contract is defined.
    RandomSubset,
}

/// Configuration for the ingest engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Output directory for staged intellectual entities.
    pub ie_output: PathBuf,

    /// Per-request timeout for source-system calls.
    pub source_timeout: Duration,

    /// Retry budget for transient source-system failures.
    pub source_retries: u32,

    /// Fixed interval between source-system retries.
    pub source_retry_interval: Duration,

    /// Cap on resumption tokens consumed per harvest. Zero or negative
    /// disables the cap.
    pub resumption_token_limit: i64,

    /// Whether the demo plugin is registered at all.
    pub enable_demo_plugin: bool,

    /// Upper bound on records the demo plugin may generate per call.
    pub demo_volume_cap: usize,

    /// Selection strategy for the demo plugin.
    pub demo_selection: DemoSelection,

    /// Base address of the IP builder service.
    pub builder_host: String,

    /// Base address of the object validator service.
    pub validator_host: String,

    /// Deadline for one downstream build/validation job.
    pub job_timeout: Duration,

    /// Interval between polls of a downstream job.
    pub poll_interval: Duration,

    /// Maximum number of ingest jobs running concurrently.
    pub worker_count: usize,

    /// Bounded fan-out for per-item build/validation work within one job.
    pub stage_fanout: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ie_output: PathBuf::from("ie"),
            source_timeout: Duration::from_secs(30),
            source_retries: 3,
            source_retry_interval: Duration::from_secs(360),
            resumption_token_limit: 0,
            enable_demo_plugin: false,
            demo_volume_cap: 100,
            demo_selection: DemoSelection::FirstN,
            builder_host: "http://localhost:8083".to_string(),
            validator_host: "http://localhost:8082".to_string(),
            job_timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(250),
            worker_count: 4,
            stage_fanout: 2,
        }
    }
}

impl Config {
    /// `true` when a positive resumption-token cap is configured.
    pub fn resumption_cap_enabled(&self) -> bool {
        self.resumption_token_limit > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.source_retries, 3);
        assert_eq!(config.source_timeout, Duration::from_secs(30));
        assert!(!config.enable_demo_plugin);
        assert!(!config.resumption_cap_enabled());
    }

    #[test]
    fn test_resumption_cap_enabled() {
        let mut config = Config::default();
        config.resumption_token_limit = 5;
        assert!(config.resumption_cap_enabled());
        config.resumption_token_limit = -1;
        assert!(!config.resumption_cap_enabled());
    }
}
