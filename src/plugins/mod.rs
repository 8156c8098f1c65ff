//! Import-plugin interface, argument schema, and registry.
//!
//! A plugin is identified by a string name and exposes a descriptor (argument
//! signature plus capability flags, served by the identify surface) and a
//! harvesting operation producing a lazy, finite sequence of
//! [`IntellectualEntity`] records through a channel. A fresh call re-harvests
//! from the source; sequences are not restartable.
//!
//! The registry is built once at startup and read-only afterwards. Resolving
//! an unknown name fails fast with [`PluginError::UnknownPlugin`]. Whether
//! non-production plugins (the demo generator) are available is decided at
//! registration time by configuration, never by plugin code.

pub mod demo;
pub mod hotfolder;
pub mod protocol;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::model::IntellectualEntity;
use crate::retry::CancelFlag;

/// Errors surfaced by plugin resolution, validation, and harvesting.
#[derive(Debug, Error)]
pub enum PluginError {
    /// No plugin registered under the requested name.
    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),

    /// Arguments failed validation against the plugin signature.
    #[error("invalid arguments for plugin '{plugin}': {reason}")]
    InvalidArguments { plugin: String, reason: String },

    /// Source-system requests exhausted their retry budget.
    #[error("source system gave no response after {attempts} attempt(s): {detail}")]
    SourceSystemTimeout { attempts: u32, detail: String },

    /// The configured cap on resumption tokens was reached. Reported
    /// distinctly from a timeout so operators can tell a misconfigured cap
    /// from network failure.
    #[error("resumption token limit of {limit} exceeded")]
    ResumptionLimitExceeded { limit: i64 },

    /// Any other fatal harvest failure.
    #[error("harvest failed: {0}")]
    HarvestFailed(String),

    /// Staging I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The consumer dropped the record channel mid-harvest.
    #[error("record sink closed by consumer")]
    SinkClosed,
}

/// JSON types an argument can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentType {
    String,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ArgumentType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ArgumentType::String => value.is_string(),
            ArgumentType::Integer => value.is_i64() || value.is_u64(),
            ArgumentType::Boolean => value.is_boolean(),
            ArgumentType::Array => value.is_array(),
            ArgumentType::Object => value.is_object(),
        }
    }
}

/// One argument in a plugin signature. Arguments may be primitive or nested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Argument {
    #[serde(rename = "type")]
    pub kind: ArgumentType,

    pub required: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Filled in for omitted optional arguments during completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Element type for arrays.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_type: Option<ArgumentType>,

    /// Nested arguments for objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, Argument>>,
}

impl Argument {
    pub fn new(kind: ArgumentType, required: bool) -> Self {
        Self {
            kind,
            required,
            description: None,
            default: None,
            item_type: None,
            properties: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_item_type(mut self, item_type: ArgumentType) -> Self {
        self.item_type = Some(item_type);
        self
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, Argument>) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// Declared argument schema of a plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(pub BTreeMap<String, Argument>);

impl Signature {
    pub fn new(args: impl IntoIterator<Item = (&'static str, Argument)>) -> Self {
        Self(
            args.into_iter()
                .map(|(name, arg)| (name.to_string(), arg))
                .collect(),
        )
    }

    /// Structural validation of `args` against this signature.
    pub fn validate(&self, args: &Value) -> Result<(), String> {
        let object = args
            .as_object()
            .ok_or_else(|| "arguments must be an object".to_string())?;

        for key in object.keys() {
            if !self.0.contains_key(key) {
                return Err(format!("unknown argument '{key}'"));
            }
        }
        for (name, spec) in &self.0 {
            match object.get(name) {
                None => {
                    if spec.required {
                        return Err(format!("missing required argument '{name}'"));
                    }
                }
                Some(value) => Self::validate_value(name, spec, value)?,
            }
        }
        Ok(())
    }

    fn validate_value(name: &str, spec: &Argument, value: &Value) -> Result<(), String> {
        if !spec.kind.matches(value) {
            return Err(format!(
                "argument '{name}' has wrong type (expected {:?})",
                spec.kind
            ));
        }
        if let (ArgumentType::Array, Some(item_type)) = (spec.kind, spec.item_type) {
            for (idx, item) in value.as_array().into_iter().flatten().enumerate() {
                if !item_type.matches(item) {
                    return Err(format!(
                        "argument '{name}[{idx}]' has wrong type (expected {item_type:?})"
                    ));
                }
            }
        }
        if let (ArgumentType::Object, Some(properties)) = (spec.kind, spec.properties.as_ref()) {
            let nested = Signature(properties.clone());
            nested
                .validate(value)
                .map_err(|reason| format!("in argument '{name}': {reason}"))?;
        }
        Ok(())
    }

    /// Returns `args` with defaults filled in for omitted optional arguments.
    pub fn complete(&self, args: Value) -> Value {
        let mut object = match args {
            Value::Object(map) => map,
            other => return other,
        };
        for (name, spec) in &self.0 {
            match object.get_mut(name) {
                None => {
                    if let Some(default) = &spec.default {
                        object.insert(name.clone(), default.clone());
                    }
                }
                Some(value) => {
                    if let (ArgumentType::Object, Some(properties)) =
                        (spec.kind, spec.properties.as_ref())
                    {
                        let nested = Signature(properties.clone());
                        *value = nested.complete(value.take());
                    }
                }
            }
        }
        Value::Object(object)
    }
}

/// Capability flags declared by a plugin.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginCapabilities {
    /// Generates synthetic data; only registered when enabled by config.
    pub test_mode: bool,

    /// Supports set scoping and transfer-URL filters.
    pub sets_and_filters: bool,
}

/// Self-description of a plugin, served by the identify surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    pub name: String,
    pub description: String,
    pub signature: Signature,
    pub capabilities: PluginCapabilities,
}

/// Channel through which a plugin emits harvested records. Records are
/// consumed as they are produced; the sequence is finite and lazy.
pub type RecordSink = tokio::sync::mpsc::Sender<IntellectualEntity>;

/// An import source: a remote protocol harvester, a hotfolder, or a
/// synthetic generator. Plugins know nothing about the pipeline.
#[async_trait]
pub trait ImportPlugin: Send + Sync {
    /// Stable registry name.
    fn name(&self) -> &'static str;

    /// Argument schema and capability flags.
    fn descriptor(&self) -> PluginDescriptor;

    /// Harvests records matching `args` into `sink`. Arguments have been
    /// validated and completed beforehand. Cancellation is cooperative,
    /// checked between records.
    async fn harvest(
        &self,
        args: Value,
        sink: RecordSink,
        cancel: &CancelFlag,
    ) -> Result<(), PluginError>;
}

/// Immutable name → plugin mapping, built at startup.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn ImportPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `plugin` under its own name. Later registrations under the
    /// same name replace earlier ones.
    pub fn register(mut self, plugin: Arc<dyn ImportPlugin>) -> Self {
        self.plugins.insert(plugin.name().to_string(), plugin);
        self
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ImportPlugin>, PluginError> {
        self.plugins
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))
    }

    /// Validates `args` against the named plugin's signature and returns the
    /// default-completed arguments. Fails synchronously, before any
    /// asynchronous work begins.
    pub fn validate_args(&self, name: &str, args: Value) -> Result<Value, PluginError> {
        let plugin = self.resolve(name)?;
        let signature = plugin.descriptor().signature;
        signature
            .validate(&args)
            .map_err(|reason| PluginError::InvalidArguments {
                plugin: name.to_string(),
                reason,
            })?;
        Ok(signature.complete(args))
    }

    /// Descriptors of all registered plugins, for the identify surface.
    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.plugins.values().map(|p| p.descriptor()).collect()
    }
}

/// Stages one harvested record under `ie_output`: raw metadata to
/// `meta/source_metadata.xml`, payload directory pre-created for the builder.
pub(crate) async fn stage_entity(
    ie_output: &std::path::Path,
    entity: &mut IntellectualEntity,
) -> Result<(), PluginError> {
    let dir: PathBuf = ie_output.join(Uuid::new_v4().to_string());
    let meta = dir.join("meta");
    tokio::fs::create_dir_all(&meta).await?;
    tokio::fs::write(meta.join("source_metadata.xml"), &entity.metadata).await?;
    tokio::fs::create_dir_all(dir.join("data").join("preservation_master")).await?;
    entity.path = Some(dir);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signature() -> Signature {
        Signature::new([
            (
                "base_url",
                Argument::new(ArgumentType::String, true).describe("source address"),
            ),
            (
                "number",
                Argument::new(ArgumentType::Integer, false).with_default(json!(1)),
            ),
            (
                "sets",
                Argument::new(ArgumentType::Array, false).with_item_type(ArgumentType::String),
            ),
            (
                "filter",
                Argument::new(ArgumentType::Object, false).with_properties(
                    [(
                        "regex".to_string(),
                        Argument::new(ArgumentType::String, true),
                    )]
                    .into(),
                ),
            ),
        ])
    }

    #[test]
    fn test_validate_accepts_good_args() {
        let args = json!({
            "base_url": "https://repo.example.com/oai",
            "sets": ["doc-type:article"],
            "filter": {"regex": ".*"}
        });
        assert!(signature().validate(&args).is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_required() {
        let err = signature().validate(&json!({})).unwrap_err();
        assert!(err.contains("base_url"));
    }

    #[test]
    fn test_validate_rejects_unknown_key() {
        let err = signature()
            .validate(&json!({"base_url": "x", "bogus": 1}))
            .unwrap_err();
        assert!(err.contains("bogus"));
    }

    #[test]
    fn test_validate_rejects_wrong_types() {
        let err = signature()
            .validate(&json!({"base_url": 5}))
            .unwrap_err();
        assert!(err.contains("wrong type"));

        let err = signature()
            .validate(&json!({"base_url": "x", "sets": ["a", 2]}))
            .unwrap_err();
        assert!(err.contains("sets[1]"));
    }

    #[test]
    fn test_validate_nested_object() {
        let err = signature()
            .validate(&json!({"base_url": "x", "filter": {}}))
            .unwrap_err();
        assert!(err.contains("regex"));
    }

    #[test]
    fn test_complete_fills_defaults() {
        let completed = signature().complete(json!({"base_url": "x"}));
        assert_eq!(completed["number"], 1);
        // no default declared, stays absent
        assert!(completed.get("sets").is_none());
    }

    struct NullPlugin;

    #[async_trait]
    impl ImportPlugin for NullPlugin {
        fn name(&self) -> &'static str {
            "null"
        }

        fn descriptor(&self) -> PluginDescriptor {
            PluginDescriptor {
                name: "null".to_string(),
                description: "emits nothing".to_string(),
                signature: Signature::default(),
                capabilities: PluginCapabilities::default(),
            }
        }

        async fn harvest(
            &self,
            _args: Value,
            _sink: RecordSink,
            _cancel: &CancelFlag,
        ) -> Result<(), PluginError> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_resolves_known_and_rejects_unknown() {
        let registry = PluginRegistry::new().register(Arc::new(NullPlugin));
        assert!(registry.resolve("null").is_ok());
        assert!(matches!(
            registry.resolve("nope"),
            Err(PluginError::UnknownPlugin(name)) if name == "nope"
        ));
        assert_eq!(registry.descriptors().len(), 1);
    }

    #[test]
    fn test_registry_validate_args_unknown_plugin() {
        let registry = PluginRegistry::new();
        assert!(matches!(
            registry.validate_args("ghost", json!({})),
            Err(PluginError::UnknownPlugin(_))
        ));
    }
}
