//! Demo import plugin generating synthetic records.
//!
//! For demonstrations and tests only; registered solely when enabled by
//! configuration. With `randomize = false` the output is deterministic and
//! stable in order across calls. The randomized mode is intentionally
//! non-reproducible; no seeding contract is defined.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::config::{Config, DemoSelection};
use crate::plugins::{
    stage_entity, Argument, ArgumentType, ImportPlugin, PluginCapabilities, PluginDescriptor,
    PluginError, RecordSink, Signature,
};
use crate::model::IntellectualEntity;
use crate::retry::CancelFlag;

pub const PLUGIN_NAME: &str = "demo";

const TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<record>
  <header>
    <identifier>IDENTIFIER</identifier>
    <datestamp>DATE</datestamp>
  </header>
  <metadata>
    <dc:title>TITLE</dc:title>
    <dc:creator>CREATOR</dc:creator>
    <dc:subject>SUBJECT</dc:subject>
    <dc:date>DATE</dc:date>
    <dc:type>article</dc:type>
    <dc:identifier>https://demo.invalid/transfer/IDENTIFIER</dc:identifier>
  </metadata>
</record>"#;

const CREATORS: &[&str] = &[
    "Thistlewood, Barnaby",
    "Quillfeather, Prudence",
    "Mortlake, Ignatius",
    "Pennyworth, Celestine",
];

const SUBJECTS: &[&str] = &[
    "Spectral Graph Theory",
    "Sediment Archaeology",
    "Comparative Phonology",
    "Orbital Mechanics",
    "Mycology",
];

const TITLES: &[&str] = &[
    "On the Taxonomy of Forgotten Things",
    "A Treatise Concerning Marginalia",
    "Field Notes from the Edge of the Catalogue",
    "The Quiet Arithmetic of Shelves",
];

#[derive(Debug, Deserialize)]
struct DemoArgs {
    #[serde(default = "default_number")]
    number: usize,
    #[serde(default)]
    randomize: bool,
    #[serde(default)]
    bad_ies: bool,
}

fn default_number() -> usize {
    1
}

/// Synthetic record generator.
pub struct DemoPlugin {
    ie_output: PathBuf,
    volume_cap: usize,
    selection: DemoSelection,
}

impl DemoPlugin {
    pub fn new(config: &Config) -> Self {
        Self {
            ie_output: config.ie_output.clone(),
            volume_cap: config.demo_volume_cap,
            selection: config.demo_selection,
        }
    }

    fn metadata(identifier: &str, randomize: bool) -> String {
        let mut rng = rand::thread_rng();
        let mut pick = |options: &[&str]| -> String {
            if randomize {
                options.choose(&mut rng).copied().unwrap_or(options[0])
            } else {
                options[0]
            }
            .to_string()
        };
        TEMPLATE
            .replace("IDENTIFIER", identifier)
            .replace("DATE", &Utc::now().format("%Y-%m-%d").to_string())
            .replace("CREATOR", &pick(CREATORS))
            .replace("SUBJECT", &pick(SUBJECTS))
            .replace("TITLE", &pick(TITLES))
    }

    /// Identifiers for one call: deterministic index-based names in plain
    /// mode, fresh UUIDs when randomized.
    fn identifiers(&self, count: usize, randomize: bool) -> Vec<String> {
        if randomize {
            return (0..count)
                .map(|_| format!("test:oai_dc:{}", Uuid::new_v4()))
                .collect();
        }
        let width = count.to_string().len();
        let candidates: Vec<String> = (0..count)
            .map(|idx| format!("test:oai_dc:{idx:0width$}"))
            .collect();
        match self.selection {
            DemoSelection::FirstN => candidates,
            DemoSelection::RandomSubset => {
                // Subset drawn from the capped pool, order preserved.
                let pool: Vec<String> = (0..self.volume_cap.max(count))
                    .map(|idx| format!("test:oai_dc:{idx:0width$}"))
                    .collect();
                let mut rng = rand::thread_rng();
                let mut picked: Vec<usize> =
                    rand::seq::index::sample(&mut rng, pool.len(), count).into_vec();
                picked.sort_unstable();
                picked.into_iter().map(|i| pool[i].clone()).collect()
            }
        }
    }
}

#[async_trait]
impl ImportPlugin for DemoPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            name: PLUGIN_NAME.to_string(),
            description: "Synthetic record generation for demonstrations and tests".to_string(),
            signature: Signature::new([
                (
                    "number",
                    Argument::new(ArgumentType::Integer, false)
                        .with_default(Value::from(1))
                        .describe("number of generated records"),
                ),
                (
                    "randomize",
                    Argument::new(ArgumentType::Boolean, false)
                        .with_default(Value::Bool(false))
                        .describe("randomize identifiers and metadata content"),
                ),
                (
                    "bad_ies",
                    Argument::new(ArgumentType::Boolean, false)
                        .with_default(Value::Bool(false))
                        .describe("include records with missing payload"),
                ),
            ]),
            capabilities: PluginCapabilities {
                test_mode: true,
                sets_and_filters: false,
            },
        }
    }

    async fn harvest(
        &self,
        args: Value,
        sink: RecordSink,
        cancel: &CancelFlag,
    ) -> Result<(), PluginError> {
        let args: DemoArgs =
            serde_json::from_value(args).map_err(|e| PluginError::InvalidArguments {
                plugin: PLUGIN_NAME.to_string(),
                reason: e.to_string(),
            })?;
        let count = args.number.min(self.volume_cap);
        info!(count, randomize = args.randomize, "Generating demo records");

        for (idx, identifier) in self.identifiers(count, args.randomize).into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let mut entity = IntellectualEntity::new(
                identifier.clone(),
                Self::metadata(&identifier, args.randomize),
            );
            entity.transfer_urls = vec![format!("https://demo.invalid/transfer/{identifier}")];
            // bad_ies alternates in missing payloads; the first record keeps its payload
            entity.fetched_payload = if args.bad_ies { idx % 2 == 0 } else { true };
            stage_entity(&self.ie_output, &mut entity).await?;
            sink.send(entity).await.map_err(|_| PluginError::SinkClosed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "demo_test_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn plugin(dir: &std::path::Path, cap: usize) -> DemoPlugin {
        let mut config = Config::default();
        config.ie_output = dir.to_path_buf();
        config.demo_volume_cap = cap;
        DemoPlugin::new(&config)
    }

    async fn generate(plugin: &DemoPlugin, args: Value) -> Vec<IntellectualEntity> {
        let (tx, mut rx) = mpsc::channel(128);
        plugin.harvest(args, tx, &CancelFlag::new()).await.unwrap();
        let mut records = Vec::new();
        while let Ok(entity) = rx.try_recv() {
            records.push(entity);
        }
        records
    }

    #[tokio::test]
    async fn test_deterministic_mode_is_stable() {
        let dir = temp_dir();
        let plugin = plugin(&dir, 100);
        let args = json!({"randomize": false, "number": 3});

        let first = generate(&plugin, args.clone()).await;
        let second = generate(&plugin, args).await;

        assert_eq!(first.len(), 3);
        let ids_first: Vec<_> = first.iter().map(|r| r.source_identifier.clone()).collect();
        let ids_second: Vec<_> = second.iter().map(|r| r.source_identifier.clone()).collect();
        assert_eq!(ids_first, ids_second);
        assert!(first.iter().all(|r| r.fetched_payload));
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_volume_cap_bounds_output() {
        let dir = temp_dir();
        let plugin = plugin(&dir, 2);
        let records = generate(&plugin, json!({"number": 50})).await;
        assert_eq!(records.len(), 2);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_bad_ies_alternate_missing_payload() {
        let dir = temp_dir();
        let plugin = plugin(&dir, 100);
        let records = generate(&plugin, json!({"number": 4, "bad_ies": true})).await;
        let flags: Vec<_> = records.iter().map(|r| r.fetched_payload).collect();
        assert_eq!(flags, [true, false, true, false]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_records_are_staged() {
        let dir = temp_dir();
        let plugin = plugin(&dir, 100);
        let records = generate(&plugin, json!({"number": 1})).await;
        let path = records[0].path.as_ref().unwrap();
        assert!(path.join("meta").join("source_metadata.xml").exists());
        assert!(path.join("data").join("preservation_master").exists());
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_randomized_identifiers_differ_across_calls() {
        let dir = temp_dir();
        let plugin = plugin(&dir, 100);
        let first = generate(&plugin, json!({"number": 2, "randomize": true})).await;
        let second = generate(&plugin, json!({"number": 2, "randomize": true})).await;
        assert_ne!(
            first[0].source_identifier,
            second[0].source_identifier
        );
        std::fs::remove_dir_all(dir).ok();
    }
}
