//! Core data model for the ingest pipeline.
//!
//! These are the externally visible records: harvested intellectual entities
//! (IEs), built information packages (IPs), and the token-keyed [`Report`]
//! projection of a running job. Wire names follow the module's JSON surface
//! (camelCase).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, unguessable identifier for one submitted ingest job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobToken(Uuid);

impl JobToken {
    /// Allocates a fresh token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One harvested intellectual entity: a descriptive-metadata surrogate for an
/// archival object, prior to packaging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntellectualEntity {
    /// Source-system identifier for this record.
    pub source_identifier: String,

    /// Raw metadata payload as delivered by the source.
    pub metadata: String,

    /// Transfer URLs derived from the metadata via the configured filters.
    pub transfer_urls: Vec<String>,

    /// Whether the payload reference could be resolved. Records flagged
    /// `false` are carried through the report but never built.
    pub fetched_payload: bool,

    /// Staging directory, set once the record has been written out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Pre-built package (internal import); skips the build stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prebuilt_path: Option<PathBuf>,

    /// Identifier of the IP built from this IE, once known.
    #[serde(rename = "ipIdentifier", skip_serializing_if = "Option::is_none")]
    pub ip_identifier: Option<String>,
}

impl IntellectualEntity {
    pub fn new(source_identifier: impl Into<String>, metadata: impl Into<String>) -> Self {
        Self {
            source_identifier: source_identifier.into(),
            metadata: metadata.into(),
            transfer_urls: Vec::new(),
            fetched_payload: false,
            path: None,
            prebuilt_path: None,
            ip_identifier: None,
        }
    }

    /// `true` when this entity already is a built package and the build
    /// stage must be skipped.
    pub fn is_prebuilt(&self) -> bool {
        self.prebuilt_path.is_some()
    }
}

/// One built information package.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InformationPackage {
    /// Package location as reported by the builder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Validation outcome; `None` until validated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,

    /// Identifier of the IE this package was built from.
    #[serde(rename = "ieIdentifier", skip_serializing_if = "Option::is_none")]
    pub ie_identifier: Option<String>,
}

/// Pipeline stage of a job. Ordered; a report's stage never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Import,
    Build,
    Validate,
    Done,
}

/// Overall status of a job. The three terminal values are equal in rank so
/// that status only ever moves toward a terminal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    PartialSuccess,
}

impl JobStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::PartialSuccess
        )
    }

    pub(crate) fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            _ => 2,
        }
    }
}

/// Severity of a report log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// One entry in a report's ordered event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub stage: JobStage,

    /// Component that produced the event (plugin name, service name, ...).
    pub origin: String,

    pub message: String,

    /// Item the event refers to, when applicable (IE/IP identifier).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
}

impl LogEvent {
    pub fn new(
        level: LogLevel,
        stage: JobStage,
        origin: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            stage,
            origin: origin.into(),
            message: message.into(),
            item: None,
        }
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.item = Some(item.into());
        self
    }
}

/// Aggregated result of one ingest job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    /// Records produced by the import stage.
    pub processed: usize,

    /// Items that passed every stage they were subjected to.
    pub succeeded: usize,

    /// Items that failed build or validation.
    pub failed: usize,

    /// Harvested IEs by identifier. BTreeMap keeps report output stable.
    #[serde(rename = "ies")]
    pub entities: BTreeMap<String, IntellectualEntity>,

    /// Built IPs by identifier.
    #[serde(rename = "ips")]
    pub packages: BTreeMap<String, InformationPackage>,
}

/// Externally visible projection of one job, retrieved by token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub token: JobToken,
    pub stage: JobStage,
    pub status: JobStatus,
    pub log: Vec<LogEvent>,
    pub summary: IngestSummary,
    pub created: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl Report {
    /// Fresh pending report for a newly allocated token.
    pub fn pending(token: JobToken) -> Self {
        let now = Utc::now();
        Self {
            token,
            stage: JobStage::Import,
            status: JobStatus::Pending,
            log: Vec::new(),
            summary: IngestSummary::default(),
            created: now,
            last_update: now,
        }
    }
}
