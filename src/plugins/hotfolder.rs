//! Hotfolder import plugin.
//!
//! Lists packages already present in local storage. In batch mode every
//! immediate subdirectory of the target is one pre-built package; otherwise
//! the target itself is the package. Emitted records skip the build stage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::plugins::{
    Argument, ArgumentType, ImportPlugin, PluginCapabilities, PluginDescriptor, PluginError,
    RecordSink, Signature,
};
use crate::model::IntellectualEntity;
use crate::retry::CancelFlag;

pub const PLUGIN_NAME: &str = "hotfolder";

#[derive(Debug, Deserialize)]
struct HotfolderArgs {
    target: String,
    #[serde(default = "default_batch")]
    batch: bool,
}

fn default_batch() -> bool {
    true
}

/// Enumerates pre-built packages from a local directory.
#[derive(Default)]
pub struct HotfolderPlugin;

impl HotfolderPlugin {
    pub fn new() -> Self {
        Self
    }

    fn entity_for(path: &Path) -> IntellectualEntity {
        let identifier = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let mut entity = IntellectualEntity::new(identifier, String::new());
        entity.fetched_payload = true;
        entity.prebuilt_path = Some(path.to_path_buf());
        entity
    }
}

#[async_trait]
impl ImportPlugin for HotfolderPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            name: PLUGIN_NAME.to_string(),
            description: "Import of packages already present in local storage".to_string(),
            signature: Signature::new([
                (
                    "target",
                    Argument::new(ArgumentType::String, true)
                        .describe("directory containing pre-built packages"),
                ),
                (
                    "batch",
                    Argument::new(ArgumentType::Boolean, false)
                        .with_default(Value::Bool(true))
                        .describe(
                            "treat every subdirectory of target as one package; \
                             false imports the target itself",
                        ),
                ),
            ]),
            capabilities: PluginCapabilities::default(),
        }
    }

    async fn harvest(
        &self,
        args: Value,
        sink: RecordSink,
        cancel: &CancelFlag,
    ) -> Result<(), PluginError> {
        let args: HotfolderArgs =
            serde_json::from_value(args).map_err(|e| PluginError::InvalidArguments {
                plugin: PLUGIN_NAME.to_string(),
                reason: e.to_string(),
            })?;
        let target = PathBuf::from(&args.target);
        if !target.is_dir() {
            return Err(PluginError::HarvestFailed(format!(
                "target '{}' is not a directory",
                target.display()
            )));
        }

        if !args.batch {
            sink.send(Self::entity_for(&target))
                .await
                .map_err(|_| PluginError::SinkClosed)?;
            return Ok(());
        }

        // Sorted for a stable emission order.
        let mut directories: Vec<PathBuf> = Vec::new();
        let mut entries = tokio::fs::read_dir(&target).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                directories.push(entry.path());
            }
        }
        directories.sort();

        info!(target = %target.display(), packages = directories.len(), "Hotfolder listed");
        for dir in directories {
            if cancel.is_cancelled() {
                return Ok(());
            }
            sink.send(Self::entity_for(&dir))
                .await
                .map_err(|_| PluginError::SinkClosed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn temp_hotfolder(packages: &[&str]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "hotfolder_test_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos()
        ));
        for package in packages {
            std::fs::create_dir_all(dir.join(package)).unwrap();
        }
        // a stray file must not be listed as a package
        std::fs::write(dir.join("notes.txt"), b"ignore me").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_batch_lists_subdirectories_sorted() {
        let dir = temp_hotfolder(&["ip2", "ip0", "ip1"]);
        let plugin = HotfolderPlugin::new();
        let (tx, mut rx) = mpsc::channel(16);
        plugin
            .harvest(
                json!({"target": dir.to_string_lossy(), "batch": true}),
                tx,
                &CancelFlag::new(),
            )
            .await
            .unwrap();

        let mut ids = Vec::new();
        while let Ok(entity) = rx.try_recv() {
            assert!(entity.is_prebuilt());
            ids.push(entity.source_identifier);
        }
        assert_eq!(ids, ["ip0", "ip1", "ip2"]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_single_target_mode() {
        let dir = temp_hotfolder(&["inner"]);
        let plugin = HotfolderPlugin::new();
        let (tx, mut rx) = mpsc::channel(16);
        plugin
            .harvest(
                json!({"target": dir.to_string_lossy(), "batch": false}),
                tx,
                &CancelFlag::new(),
            )
            .await
            .unwrap();

        let entity = rx.try_recv().unwrap();
        assert_eq!(entity.prebuilt_path.as_deref(), Some(dir.as_path()));
        assert!(rx.try_recv().is_err());
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_missing_target_fails() {
        let plugin = HotfolderPlugin::new();
        let (tx, _rx) = mpsc::channel(16);
        let result = plugin
            .harvest(
                json!({"target": "/does/not/exist"}),
                tx,
                &CancelFlag::new(),
            )
            .await;
        assert!(matches!(result, Err(PluginError::HarvestFailed(_))));
    }
}
