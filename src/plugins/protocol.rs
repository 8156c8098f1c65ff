//! Protocol-driven paginated harvest plugin (OAI-PMH style).
//!
//! Harvests all records matching a metadata prefix and optional set scope
//! from a remote metadata-harvesting endpoint, following server-issued
//! resumption cursors. Records are emitted in server response order within a
//! page and in configured set order across sets, so "first N" test-import
//! semantics stay reproducible.
//!
//! The network seam is [`HarvestTransport`]; the HTTP implementation speaks a
//! JSON envelope in which the raw record metadata travels as an opaque
//! string. Transfer URLs are derived per record by [`TransferUrlFilter`].

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::TransportError;
use crate::config::Config;
use crate::plugins::{
    stage_entity, Argument, ArgumentType, ImportPlugin, PluginCapabilities, PluginDescriptor,
    PluginError, RecordSink, Signature,
};
use crate::model::IntellectualEntity;
use crate::retry::{CancelFlag, RetryError, RetryPolicy};

pub const PLUGIN_NAME: &str = "oai_pmh";

/// Parameters for one list-records request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListRequest {
    pub metadata_prefix: String,
    pub set: Option<String>,
    pub from: Option<String>,
    pub until: Option<String>,

    /// Server-issued pagination cursor; exclusive with the other fields on
    /// follow-up requests.
    pub resumption_token: Option<String>,
}

/// One record as delivered by the source system.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecord {
    pub identifier: String,

    /// Raw metadata document, carried opaquely.
    #[serde(default)]
    pub metadata: String,

    /// Optional structured view of the metadata, used by path-scoped
    /// transfer-URL filters.
    #[serde(default)]
    pub fields: Option<Value>,

    /// Tombstone marker; deleted records are skipped with a warning.
    #[serde(default)]
    pub deleted: bool,
}

/// One page of a paginated harvest.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPage {
    pub records: Vec<SourceRecord>,

    /// Cursor for the next page; `None` means this scope is exhausted.
    #[serde(default)]
    pub resumption_token: Option<String>,
}

/// Network seam of the harvester.
#[async_trait]
pub trait HarvestTransport: Send + Sync {
    async fn list_records(
        &self,
        base_url: &str,
        request: &ListRequest,
    ) -> Result<RecordPage, TransportError>;

    async fn get_record(
        &self,
        base_url: &str,
        metadata_prefix: &str,
        identifier: &str,
    ) -> Result<SourceRecord, TransportError>;
}

/// HTTP transport speaking the JSON harvest envelope.
pub struct HttpHarvestTransport {
    client: reqwest::Client,
}

impl HttpHarvestTransport {
    pub fn new(request_timeout: std::time::Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self { client })
    }

    fn classify(e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else {
            TransportError::Network(e.to_string())
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        base_url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, TransportError> {
        let response = self
            .client
            .get(base_url)
            .query(query)
            .send()
            .await
            .map_err(Self::classify)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Api(status.as_u16(), body));
        }
        response
            .json()
            .await
            .map_err(|e| TransportError::Parse(e.to_string()))
    }
}

#[async_trait]
impl HarvestTransport for HttpHarvestTransport {
    async fn list_records(
        &self,
        base_url: &str,
        request: &ListRequest,
    ) -> Result<RecordPage, TransportError> {
        let mut query: Vec<(&str, &str)> = vec![("verb", "ListRecords")];
        // A resumption token replaces the original request arguments.
        if let Some(token) = &request.resumption_token {
            query.push(("resumptionToken", token));
        } else {
            query.push(("metadataPrefix", &request.metadata_prefix));
            if let Some(set) = &request.set {
                query.push(("set", set));
            }
            if let Some(from) = &request.from {
                query.push(("from", from));
            }
            if let Some(until) = &request.until {
                query.push(("until", until));
            }
        }
        self.get_json(base_url, &query).await
    }

    async fn get_record(
        &self,
        base_url: &str,
        metadata_prefix: &str,
        identifier: &str,
    ) -> Result<SourceRecord, TransportError> {
        self.get_json(
            base_url,
            &[
                ("verb", "GetRecord"),
                ("metadataPrefix", metadata_prefix),
                ("identifier", identifier),
            ],
        )
        .await
    }
}

/// Policy for records whose metadata yields no transfer URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnNoMatch {
    /// Drop the record entirely.
    Omit,

    /// Emit the record with `fetched_payload = false`.
    Flag,
}

/// Derives transfer URLs from a record: a regex applied either to the value
/// at a structural path into the record's metadata fields, or to the raw
/// metadata document when no path is given.
struct TransferUrlFilter {
    path: Option<Vec<String>>,
    pattern: Regex,
    on_no_match: OnNoMatch,
}

impl TransferUrlFilter {
    fn apply(&self, record: &SourceRecord) -> Vec<String> {
        let mut urls = Vec::new();
        match (&self.path, &record.fields) {
            (Some(path), Some(fields)) => {
                let mut node = fields;
                for key in path {
                    match node.get(key) {
                        Some(next) => node = next,
                        None => return urls,
                    }
                }
                self.collect(node, &mut urls);
            }
            _ => self.matches_into(&record.metadata, &mut urls),
        }
        urls
    }

    fn collect(&self, node: &Value, urls: &mut Vec<String>) {
        match node {
            Value::String(s) => self.matches_into(s, urls),
            Value::Array(items) => {
                for item in items {
                    self.collect(item, urls);
                }
            }
            _ => {}
        }
    }

    fn matches_into(&self, text: &str, urls: &mut Vec<String>) {
        for captures in self.pattern.captures_iter(text) {
            // With a capture group, take the group (re.findall semantics);
            // otherwise the whole match.
            let m = captures
                .get(1)
                .or_else(|| captures.get(0))
                .map(|m| m.as_str().to_string());
            if let Some(url) = m {
                urls.push(url);
            }
        }
    }
}

/// Validated and default-completed arguments of a harvest call.
#[derive(Debug, Deserialize)]
struct HarvestArgs {
    base_url: String,
    metadata_prefix: String,
    #[serde(default)]
    sets: Vec<String>,
    #[serde(default)]
    identifiers: Vec<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    until: Option<String>,
    transfer_url_filter: FilterArgs,
}

#[derive(Debug, Deserialize)]
struct FilterArgs {
    #[serde(default)]
    path: Option<Vec<String>>,
    regex: String,
    #[serde(default = "default_on_no_match")]
    on_no_match: String,
}

fn default_on_no_match() -> String {
    "omit".to_string()
}

/// Per-invocation cursor state. Owned exclusively by one harvest call and
/// discarded on completion.
struct HarvestContext {
    /// Remaining set scopes; a single `None` entry for unscoped harvests.
    sets: VecDeque<Option<String>>,

    /// Cursor within the current scope.
    resumption: Option<String>,

    /// Resumption tokens consumed so far across all scopes.
    tokens_consumed: i64,

    /// Positive cap on `tokens_consumed`; `<= 0` disables the cap.
    limit: i64,
}

impl HarvestContext {
    fn new(sets: &[String], limit: i64) -> Self {
        let sets = if sets.is_empty() {
            VecDeque::from([None])
        } else {
            sets.iter().cloned().map(Some).collect()
        };
        Self {
            sets,
            resumption: None,
            tokens_consumed: 0,
            limit,
        }
    }

    /// Registers a server-issued cursor. Fails once the configured cap would
    /// be exceeded by following it.
    fn follow(&mut self, token: String) -> Result<(), PluginError> {
        self.tokens_consumed += 1;
        if self.limit > 0 && self.tokens_consumed > self.limit {
            return Err(PluginError::ResumptionLimitExceeded { limit: self.limit });
        }
        self.resumption = Some(token);
        Ok(())
    }
}

/// The protocol harvest plugin.
pub struct ProtocolHarvestPlugin {
    transport: Arc<dyn HarvestTransport>,
    ie_output: PathBuf,
    retry: RetryPolicy,
    resumption_token_limit: i64,
}

impl ProtocolHarvestPlugin {
    pub fn new(transport: Arc<dyn HarvestTransport>, config: &Config) -> Self {
        Self {
            transport,
            ie_output: config.ie_output.clone(),
            retry: RetryPolicy::new(config.source_retries, config.source_retry_interval),
            resumption_token_limit: config.resumption_token_limit,
        }
    }

    fn parse_args(&self, args: Value) -> Result<(HarvestArgs, TransferUrlFilter), PluginError> {
        let args: HarvestArgs =
            serde_json::from_value(args).map_err(|e| PluginError::InvalidArguments {
                plugin: PLUGIN_NAME.to_string(),
                reason: e.to_string(),
            })?;
        let pattern =
            Regex::new(&args.transfer_url_filter.regex).map_err(|e| {
                PluginError::InvalidArguments {
                    plugin: PLUGIN_NAME.to_string(),
                    reason: format!("invalid filter regex: {e}"),
                }
            })?;
        let on_no_match = match args.transfer_url_filter.on_no_match.as_str() {
            "omit" => OnNoMatch::Omit,
            "flag" => OnNoMatch::Flag,
            other => {
                return Err(PluginError::InvalidArguments {
                    plugin: PLUGIN_NAME.to_string(),
                    reason: format!("unknown onNoMatch policy '{other}'"),
                })
            }
        };
        let filter = TransferUrlFilter {
            path: args.transfer_url_filter.path.clone(),
            pattern,
            on_no_match,
        };
        Ok((args, filter))
    }

    async fn emit(
        &self,
        record: SourceRecord,
        filter: &TransferUrlFilter,
        sink: &RecordSink,
    ) -> Result<(), PluginError> {
        if record.deleted {
            warn!(identifier = %record.identifier, "Record is marked 'deleted', skipping");
            return Ok(());
        }
        let urls = filter.apply(&record);
        if urls.is_empty() && filter.on_no_match == OnNoMatch::Omit {
            debug!(identifier = %record.identifier, "No transfer URL matched, omitting record");
            return Ok(());
        }
        let mut entity = IntellectualEntity::new(record.identifier, record.metadata);
        entity.fetched_payload = !urls.is_empty();
        entity.transfer_urls = urls;
        stage_entity(&self.ie_output, &mut entity).await?;
        sink.send(entity).await.map_err(|_| PluginError::SinkClosed)
    }

    async fn list_page(
        &self,
        args: &HarvestArgs,
        set: &Option<String>,
        resumption: &Option<String>,
        cancel: &CancelFlag,
    ) -> Result<Option<RecordPage>, PluginError> {
        let request = ListRequest {
            metadata_prefix: args.metadata_prefix.clone(),
            set: set.clone(),
            from: args.from.clone(),
            until: args.until.clone(),
            resumption_token: resumption.clone(),
        };
        let result = self
            .retry
            .run("listing records", cancel, || {
                self.transport.list_records(&args.base_url, &request)
            })
            .await;
        match result {
            Ok(page) => Ok(Some(page)),
            Err(RetryError::Cancelled) => Ok(None),
            Err(e) => Err(map_retry(e)),
        }
    }

    /// Full paginated harvest across all configured set scopes.
    async fn run_paginated(
        &self,
        args: &HarvestArgs,
        filter: &TransferUrlFilter,
        sink: &RecordSink,
        cancel: &CancelFlag,
    ) -> Result<(), PluginError> {
        let mut context = HarvestContext::new(&args.sets, self.resumption_token_limit);

        while let Some(set) = context.sets.pop_front() {
            context.resumption = None;
            loop {
                if cancel.is_cancelled() {
                    info!("Harvest cancelled");
                    return Ok(());
                }
                let page = match self
                    .list_page(args, &set, &context.resumption, cancel)
                    .await?
                {
                    Some(page) => page,
                    None => return Ok(()), // cancelled mid-retry
                };
                debug!(
                    set = set.as_deref().unwrap_or("-"),
                    records = page.records.len(),
                    "Received page"
                );
                for record in page.records {
                    self.emit(record, filter, sink).await?;
                }
                match page.resumption_token {
                    Some(token) => context.follow(token)?,
                    None => break, // scope exhausted, advance to next set
                }
            }
        }
        Ok(())
    }

    /// Direct fetch of explicitly requested identifiers; bypasses pagination.
    async fn run_identifiers(
        &self,
        args: &HarvestArgs,
        filter: &TransferUrlFilter,
        sink: &RecordSink,
        cancel: &CancelFlag,
    ) -> Result<(), PluginError> {
        for identifier in &args.identifiers {
            if cancel.is_cancelled() {
                info!("Harvest cancelled");
                return Ok(());
            }
            let result = self
                .retry
                .run("fetching record", cancel, || {
                    self.transport
                        .get_record(&args.base_url, &args.metadata_prefix, identifier)
                })
                .await;
            let record = match result {
                Ok(record) => record,
                Err(RetryError::Cancelled) => return Ok(()),
                Err(e) => return Err(map_retry(e)),
            };
            self.emit(record, filter, sink).await?;
        }
        Ok(())
    }
}

fn map_retry(e: RetryError<TransportError>) -> PluginError {
    match e {
        RetryError::Exhausted { attempts, source } => PluginError::SourceSystemTimeout {
            attempts,
            detail: source.to_string(),
        },
        RetryError::Fatal(source) => PluginError::HarvestFailed(source.to_string()),
        RetryError::Cancelled => PluginError::HarvestFailed("cancelled".to_string()),
    }
}

#[async_trait]
impl ImportPlugin for ProtocolHarvestPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn descriptor(&self) -> PluginDescriptor {
        let filter_properties: BTreeMap<String, Argument> = [
            (
                "path".to_string(),
                Argument::new(ArgumentType::Array, false)
                    .with_item_type(ArgumentType::String)
                    .describe(
                        "structural path into the record metadata; if omitted, \
                         the regex is applied to the raw metadata document",
                    ),
            ),
            (
                "regex".to_string(),
                Argument::new(ArgumentType::String, true)
                    .describe("pattern matching transfer URLs"),
            ),
            (
                "on_no_match".to_string(),
                Argument::new(ArgumentType::String, false)
                    .with_default(Value::String("omit".to_string()))
                    .describe("'omit' drops unmatched records, 'flag' emits them without payload"),
            ),
        ]
        .into();

        PluginDescriptor {
            name: PLUGIN_NAME.to_string(),
            description: "Paginated import from a metadata-harvesting endpoint".to_string(),
            signature: Signature::new([
                (
                    "base_url",
                    Argument::new(ArgumentType::String, true)
                        .describe("address of the source repository"),
                ),
                (
                    "metadata_prefix",
                    Argument::new(ArgumentType::String, true).describe("metadata format"),
                ),
                (
                    "sets",
                    Argument::new(ArgumentType::Array, false)
                        .with_item_type(ArgumentType::String)
                        .describe("set scopes, harvested in the given order"),
                ),
                (
                    "identifiers",
                    Argument::new(ArgumentType::Array, false)
                        .with_item_type(ArgumentType::String)
                        .describe("explicit record identifiers; bypasses pagination"),
                ),
                (
                    "from",
                    Argument::new(ArgumentType::String, false)
                        .describe("selective harvesting, lower datestamp bound"),
                ),
                (
                    "until",
                    Argument::new(ArgumentType::String, false)
                        .describe("selective harvesting, upper datestamp bound"),
                ),
                (
                    "transfer_url_filter",
                    Argument::new(ArgumentType::Object, true)
                        .with_properties(filter_properties)
                        .describe("how to derive payload URLs from record metadata"),
                ),
            ]),
            capabilities: PluginCapabilities {
                test_mode: false,
                sets_and_filters: true,
            },
        }
    }

    async fn harvest(
        &self,
        args: Value,
        sink: RecordSink,
        cancel: &CancelFlag,
    ) -> Result<(), PluginError> {
        let (args, filter) = self.parse_args(args)?;
        info!(base_url = %args.base_url, prefix = %args.metadata_prefix, "Starting harvest");

        if args.identifiers.is_empty() {
            self.run_paginated(&args, &filter, &sink, cancel).await
        } else {
            // Explicit identifiers take priority over selective harvesting.
            self.run_identifiers(&args, &filter, &sink, cancel).await
        }
    }
}
