//! Token-indexed, concurrency-safe report store.
//!
//! One writer per token (the worker owning that job), many concurrent
//! readers. Updates are monotonic: stage never regresses, status only moves
//! toward a terminal value, the log only appends. Critical sections are
//! short and never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::model::{JobStage, JobStatus, JobToken, LogEvent, Report};
use crate::retry::CancelFlag;

/// Errors surfaced by the report store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportError {
    /// Queried token is unknown or has been evicted.
    #[error("no report found for token '{0}'")]
    TokenNotFound(JobToken),

    /// A token was registered twice. Tokens are UUIDs; this indicates a bug
    /// in the caller.
    #[error("token '{0}' already registered")]
    DuplicateToken(JobToken),
}

struct JobSlot {
    report: RwLock<Report>,
    cancel: CancelFlag,
}

/// Shared store mapping job tokens to live reports.
#[derive(Default)]
pub struct ReportStore {
    slots: RwLock<HashMap<JobToken, Arc<JobSlot>>>,
}

impl ReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh pending report under `token`.
    pub fn create(&self, token: JobToken) -> Result<(), ReportError> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if slots.contains_key(&token) {
            return Err(ReportError::DuplicateToken(token));
        }
        slots.insert(
            token,
            Arc::new(JobSlot {
                report: RwLock::new(Report::pending(token)),
                cancel: CancelFlag::new(),
            }),
        );
        Ok(())
    }

    /// Snapshot of the current report for `token`. Never creates an entry.
    pub fn get(&self, token: JobToken) -> Result<Report, ReportError> {
        let slot = self.slot(token)?;
        let report = slot.report.read().unwrap_or_else(|e| e.into_inner());
        Ok(report.clone())
    }

    /// Atomically appends a log event and advances stage/status where the
    /// update would not regress. A terminal status is final.
    pub fn append(
        &self,
        token: JobToken,
        event: Option<LogEvent>,
        stage: Option<JobStage>,
        status: Option<JobStatus>,
    ) -> Result<(), ReportError> {
        let slot = self.slot(token)?;
        let mut report = slot.report.write().unwrap_or_else(|e| e.into_inner());
        if let Some(event) = event {
            report.log.push(event);
        }
        if let Some(stage) = stage {
            if stage > report.stage {
                report.stage = stage;
            }
        }
        if let Some(status) = status {
            if !report.status.is_terminal() && status.rank() >= report.status.rank() {
                report.status = status;
            } else {
                debug!(%token, ?status, current = ?report.status, "Ignoring status regression");
            }
        }
        report.last_update = Utc::now();
        Ok(())
    }

    /// Replaces the result summary via `update`, under the same write lock
    /// as log/stage updates.
    pub fn update_summary<F>(&self, token: JobToken, update: F) -> Result<(), ReportError>
    where
        F: FnOnce(&mut crate::model::IngestSummary),
    {
        let slot = self.slot(token)?;
        let mut report = slot.report.write().unwrap_or_else(|e| e.into_inner());
        update(&mut report.summary);
        report.last_update = Utc::now();
        Ok(())
    }

    /// Marks the job for cooperative cancellation.
    pub fn request_cancel(&self, token: JobToken) -> Result<(), ReportError> {
        self.slot(token)?.cancel.cancel();
        Ok(())
    }

    /// Cancellation flag shared with the worker owning `token`.
    pub fn cancel_flag(&self, token: JobToken) -> Result<CancelFlag, ReportError> {
        Ok(self.slot(token)?.cancel.clone())
    }

    /// Drops the report for `token`, e.g. on retention expiry. A later `get`
    /// yields `TokenNotFound`.
    pub fn evict(&self, token: JobToken) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.remove(&token);
    }

    fn slot(&self, token: JobToken) -> Result<Arc<JobSlot>, ReportError> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots
            .get(&token)
            .cloned()
            .ok_or(ReportError::TokenNotFound(token))
    }
}
