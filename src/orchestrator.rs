//! Pipeline orchestrator and worker pool.
//!
//! `submit` validates the request synchronously, allocates a token, and
//! enqueues the job; the returned token is live immediately while the job
//! runs on a semaphore-bounded worker pool (FIFO under contention). Each job
//! walks Import → Build → Validate → Done, pushing every transition into the
//! report store. Build/Validate sub-items fan out concurrently within a
//! bounded limit; per-item failures never abort sibling items.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::client::{ExternalJobClient, HttpJobApi, TransportError};
use crate::config::Config;
use crate::model::{
    InformationPackage, IntellectualEntity, JobStage, JobStatus, JobToken, LogEvent, LogLevel,
};
use crate::plugins::{hotfolder, PluginDescriptor, PluginError, PluginRegistry};
use crate::report::{ReportError, ReportStore};
use crate::retry::{CancelFlag, RetryPolicy};

/// Where a job's records come from.
#[derive(Debug, Clone)]
pub enum ImportSource {
    /// Harvest from a remote source system through a named plugin.
    External { plugin: String, args: Value },

    /// Pick up pre-built packages from local hotfolder storage. Skips the
    /// build stage.
    Internal { target: String, batch: bool },
}

/// One submission: import source plus the configurations forwarded to the
/// downstream services. A missing build configuration ends the job after
/// Import; a missing validation configuration skips Validate.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub source: ImportSource,
    pub build: Option<Value>,
    pub validation: Option<Value>,
}

/// Synchronous submission failures; the job never starts.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Report(#[from] ReportError),

    /// The build/validation configuration is not a JSON object and cannot
    /// be forwarded to the downstream service.
    #[error("{0} configuration must be a JSON object")]
    InvalidServiceConfig(&'static str),
}

/// Self-description served by the identify surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceIdentity {
    pub description: String,
    pub version: String,
    pub plugins: Vec<PluginDescriptor>,
    pub services: BTreeMap<String, String>,
}

/// Drives submitted jobs from creation to terminal status. Cheap to clone;
/// clones share the report store, registry, and worker pool.
#[derive(Clone)]
pub struct Orchestrator {
    config: Config,
    registry: Arc<PluginRegistry>,
    store: Arc<ReportStore>,
    builder: ExternalJobClient,
    validator: ExternalJobClient,
    workers: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        registry: Arc<PluginRegistry>,
        store: Arc<ReportStore>,
        builder: ExternalJobClient,
        validator: ExternalJobClient,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_count.max(1)));
        Self {
            config,
            registry,
            store,
            builder,
            validator,
            workers,
        }
    }

    /// Convenience constructor wiring HTTP clients against the configured
    /// builder and validator hosts.
    pub fn with_http_services(
        config: Config,
        registry: Arc<PluginRegistry>,
        store: Arc<ReportStore>,
    ) -> Result<Self, TransportError> {
        let retry = RetryPolicy::new(config.source_retries, config.source_retry_interval);
        let builder = ExternalJobClient::new(
            Arc::new(HttpJobApi::new(
                config.builder_host.clone(),
                "/build",
                config.source_timeout,
            )?),
            "ip_builder",
            config.poll_interval,
            config.job_timeout,
            retry,
        );
        let validator = ExternalJobClient::new(
            Arc::new(HttpJobApi::new(
                config.validator_host.clone(),
                "/validate",
                config.source_timeout,
            )?),
            "object_validator",
            config.poll_interval,
            config.job_timeout,
            retry,
        );
        Ok(Self::new(config, registry, store, builder, validator))
    }

    /// Registered plugin descriptors and service addresses.
    pub fn identify(&self) -> ServiceIdentity {
        ServiceIdentity {
            description: "Collects IEs from source systems via protocol-specific plugins \
                          and converts them into IPs using builder and validator services"
                .to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            plugins: self.registry.descriptors(),
            services: BTreeMap::from([
                ("ip_builder".to_string(), self.config.builder_host.clone()),
                (
                    "object_validator".to_string(),
                    self.config.validator_host.clone(),
                ),
            ]),
        }
    }

    pub fn store(&self) -> &Arc<ReportStore> {
        &self.store
    }

    /// Marks a running job for cooperative cancellation.
    pub fn cancel(&self, token: JobToken) -> Result<(), ReportError> {
        self.store.request_cancel(token)
    }

    /// Validates the request, creates a pending report, enqueues the job,
    /// and returns its token without blocking on execution.
    pub fn submit(&self, request: IngestRequest) -> Result<JobToken, SubmitError> {
        let (plugin_name, raw_args, skip_build) = match &request.source {
            ImportSource::External { plugin, args } => (plugin.clone(), args.clone(), false),
            ImportSource::Internal { target, batch } => (
                hotfolder::PLUGIN_NAME.to_string(),
                json!({"target": target, "batch": batch}),
                true,
            ),
        };
        // Fails synchronously, before any asynchronous work begins.
        let args = self.registry.validate_args(&plugin_name, raw_args)?;
        let plugin = self.registry.resolve(&plugin_name)?;
        if matches!(&request.build, Some(build) if !build.is_object()) {
            return Err(SubmitError::InvalidServiceConfig("build"));
        }
        if matches!(&request.validation, Some(validation) if !validation.is_object()) {
            return Err(SubmitError::InvalidServiceConfig("validation"));
        }

        let token = JobToken::new();
        self.store.create(token)?;

        let orchestrator = self.clone();
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            // FIFO under contention; the permit bounds running jobs.
            let _permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            orchestrator
                .run_job(token, plugin_name, plugin, args, request, skip_build)
                .await;
        });
        Ok(token)
    }

    fn push(
        &self,
        token: JobToken,
        event: Option<LogEvent>,
        stage: Option<JobStage>,
        status: Option<JobStatus>,
    ) {
        if let Err(e) = self.store.append(token, event, stage, status) {
            // Eviction mid-run; nothing left to report to.
            warn!(%token, error = %e, "Report update dropped");
        }
    }

    async fn run_job(
        &self,
        token: JobToken,
        plugin_name: String,
        plugin: Arc<dyn crate::plugins::ImportPlugin>,
        args: Value,
        request: IngestRequest,
        skip_build: bool,
    ) {
        let cancel = match self.store.cancel_flag(token) {
            Ok(flag) => flag,
            Err(_) => return, // evicted before start
        };
        info!(%token, plugin = %plugin_name, "Job starting");
        self.push(
            token,
            Some(LogEvent::new(
                LogLevel::Info,
                JobStage::Import,
                "orchestrator",
                format!("importing IEs with plugin '{plugin_name}'"),
            )),
            Some(JobStage::Import),
            Some(JobStatus::Running),
        );

        // ---- Import ----
        let entities = match self.import_stage(token, &plugin_name, plugin, args, &cancel).await {
            Ok(entities) => entities,
            Err(e) => {
                error!(%token, error = %e, "Import stage failed");
                self.push(
                    token,
                    Some(LogEvent::new(
                        LogLevel::Error,
                        JobStage::Import,
                        &plugin_name,
                        e.to_string(),
                    )),
                    Some(JobStage::Done),
                    Some(JobStatus::Failed),
                );
                return;
            }
        };
        if self.abort_if_cancelled(token, JobStage::Import, &cancel) {
            return;
        }

        let processed = entities.len();
        let with_payload = entities.values().filter(|e| e.fetched_payload).count();
        self.push(
            token,
            Some(LogEvent::new(
                LogLevel::Info,
                JobStage::Import,
                "orchestrator",
                format!(
                    "collected {processed} IE(s) with {} error(s)",
                    processed - with_payload
                ),
            )),
            None,
            None,
        );

        if processed == 0 {
            // Zero records is not an error; the result set is empty.
            self.push(
                token,
                Some(LogEvent::new(
                    LogLevel::Info,
                    JobStage::Import,
                    "orchestrator",
                    "list of IEs is empty",
                )),
                Some(JobStage::Done),
                Some(JobStatus::Success),
            );
            return;
        }

        // ---- Build ----
        let packages = if skip_build {
            self.adopt_prebuilt(token, &entities)
        } else if let Some(build) = &request.build {
            self.build_stage(token, &entities, build, &cancel).await
        } else {
            self.push(
                token,
                Some(LogEvent::new(
                    LogLevel::Info,
                    JobStage::Import,
                    "orchestrator",
                    "skip building IPs (request does not contain build information)",
                )),
                Some(JobStage::Done),
                Some(if with_payload == processed {
                    JobStatus::Success
                } else if with_payload == 0 {
                    JobStatus::Failed
                } else {
                    JobStatus::PartialSuccess
                }),
            );
            return;
        };
        if self.abort_if_cancelled(token, JobStage::Build, &cancel) {
            return;
        }

        // ---- Validate ----
        let packages = if let Some(validation) = &request.validation {
            self.validate_stage(token, packages, validation, &cancel).await
        } else {
            packages
        };
        if self.abort_if_cancelled(token, JobStage::Validate, &cancel) {
            return;
        }

        // ---- Aggregate ----
        let succeeded = packages
            .values()
            .filter(|ip| ip.path.is_some() && ip.valid.unwrap_or(true))
            .count();
        let failed = processed - succeeded;
        let status = if failed == 0 {
            JobStatus::Success
        } else if succeeded == 0 {
            JobStatus::Failed
        } else {
            JobStatus::PartialSuccess
        };

        let _ = self.store.update_summary(token, |summary| {
            summary.succeeded = succeeded;
            summary.failed = failed;
        });
        info!(%token, ?status, succeeded, failed, "Job finished");
        self.push(
            token,
            Some(LogEvent::new(
                LogLevel::Info,
                JobStage::Done,
                "orchestrator",
                format!("built {} IP(s), {failed} item(s) failed", packages.len()),
            )),
            Some(JobStage::Done),
            Some(status),
        );
    }

    /// Drains the plugin's record channel into the report summary.
    async fn import_stage(
        &self,
        token: JobToken,
        plugin_name: &str,
        plugin: Arc<dyn crate::plugins::ImportPlugin>,
        args: Value,
        cancel: &CancelFlag,
    ) -> Result<BTreeMap<String, IntellectualEntity>, PluginError> {
        let (tx, mut rx) = mpsc::channel::<IntellectualEntity>(32);
        let harvest_cancel = cancel.clone();
        let harvest = {
            let plugin = Arc::clone(&plugin);
            tokio::spawn(async move { plugin.harvest(args, tx, &harvest_cancel).await })
        };

        let mut entities = BTreeMap::new();
        let mut index = 0usize;
        while let Some(entity) = rx.recv().await {
            let ie_id = format!("ie{index:04}");
            index += 1;
            self.push(
                token,
                Some(
                    LogEvent::new(
                        LogLevel::Info,
                        JobStage::Import,
                        plugin_name,
                        format!("collected record '{}'", entity.source_identifier),
                    )
                    .with_item(ie_id.clone()),
                ),
                None,
                None,
            );
            entities.insert(ie_id, entity);
        }

        match harvest.await {
            Ok(result) => result?,
            Err(e) => return Err(PluginError::HarvestFailed(format!("harvest task: {e}"))),
        }

        let _ = self.store.update_summary(token, |summary| {
            summary.processed = entities.len();
            summary.entities = entities.clone();
        });
        Ok(entities)
    }

    /// Internal imports arrive pre-built; register their packages directly.
    fn adopt_prebuilt(
        &self,
        token: JobToken,
        entities: &BTreeMap<String, IntellectualEntity>,
    ) -> BTreeMap<String, InformationPackage> {
        let mut packages = BTreeMap::new();
        for (ie_id, entity) in entities {
            let ip_id = ie_id.replace("ie", "ip");
            packages.insert(
                ip_id.clone(),
                InformationPackage {
                    path: entity.prebuilt_path.clone(),
                    valid: None,
                    ie_identifier: Some(ie_id.clone()),
                },
            );
        }
        let _ = self.store.update_summary(token, |summary| {
            for (ie_id, _) in entities {
                if let Some(ie) = summary.entities.get_mut(ie_id) {
                    ie.ip_identifier = Some(ie_id.replace("ie", "ip"));
                }
            }
            summary.packages = packages.clone();
        });
        self.push(
            token,
            Some(LogEvent::new(
                LogLevel::Info,
                JobStage::Build,
                "orchestrator",
                "packages are pre-built, skipping build stage",
            )),
            Some(JobStage::Build),
            None,
        );
        packages
    }

    /// Submits one build job per payload-complete entity, with bounded
    /// fan-out. Per-item failures are recorded and isolated.
    async fn build_stage(
        &self,
        token: JobToken,
        entities: &BTreeMap<String, IntellectualEntity>,
        build: &Value,
        cancel: &CancelFlag,
    ) -> BTreeMap<String, InformationPackage> {
        self.push(token, None, Some(JobStage::Build), None);
        let fanout = Arc::new(Semaphore::new(self.config.stage_fanout.max(1)));
        let mut tasks = JoinSet::new();

        for (ie_id, entity) in entities {
            let ip_id = ie_id.replace("ie", "ip");
            if !entity.fetched_payload {
                self.push(
                    token,
                    Some(
                        LogEvent::new(
                            LogLevel::Warning,
                            JobStage::Build,
                            "orchestrator",
                            format!("skip building IP from IE '{ie_id}' (missing payload)"),
                        )
                        .with_item(ie_id.clone()),
                    ),
                    None,
                    None,
                );
                continue;
            }
            // Cooperative cancellation: stop submitting new per-item work.
            if cancel.is_cancelled() {
                break;
            }
            let Some(target) = entity.path.clone() else {
                continue;
            };

            let mut body = json!({ "build": build.clone() });
            body["build"]["target"] = json!({ "path": target });

            let builder = self.builder.clone();
            let fanout = Arc::clone(&fanout);
            let cancel = cancel.clone();
            let ids = (ie_id.clone(), ip_id);
            tasks.spawn(async move {
                let _permit = fanout.acquire_owned().await;
                let result = builder.run(body, &cancel).await;
                (ids, result)
            });
        }

        let mut packages = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok(((ie_id, ip_id), result)) = joined else {
                continue;
            };
            match result {
                Ok(payload) => {
                    let path = payload
                        .get("path")
                        .and_then(Value::as_str)
                        .map(std::path::PathBuf::from);
                    let valid = payload.get("valid").and_then(Value::as_bool);
                    if path.is_none() {
                        self.push(
                            token,
                            Some(
                                LogEvent::new(
                                    LogLevel::Error,
                                    JobStage::Build,
                                    "ip_builder",
                                    format!(
                                        "failed to build IP for IE '{ie_id}' \
                                         (missing 'path' in response)"
                                    ),
                                )
                                .with_item(ie_id.clone()),
                            ),
                            None,
                            None,
                        );
                        continue;
                    }
                    self.push(
                        token,
                        Some(
                            LogEvent::new(
                                LogLevel::Info,
                                JobStage::Build,
                                "ip_builder",
                                format!("built IP '{ip_id}' from IE '{ie_id}'"),
                            )
                            .with_item(ip_id.clone()),
                        ),
                        None,
                        None,
                    );
                    let package = InformationPackage {
                        path,
                        valid,
                        ie_identifier: Some(ie_id.clone()),
                    };
                    let _ = self.store.update_summary(token, |summary| {
                        if let Some(ie) = summary.entities.get_mut(&ie_id) {
                            ie.ip_identifier = Some(ip_id.clone());
                        }
                        summary.packages.insert(ip_id.clone(), package.clone());
                    });
                    packages.insert(ip_id, package);
                }
                Err(e) => {
                    self.push(
                        token,
                        Some(
                            LogEvent::new(
                                LogLevel::Error,
                                JobStage::Build,
                                "ip_builder",
                                format!("failed to build IP for IE '{ie_id}': {e}"),
                            )
                            .with_item(ie_id.clone()),
                        ),
                        None,
                        None,
                    );
                }
            }
        }
        packages
    }

    /// Submits one validation job per built package, with bounded fan-out.
    async fn validate_stage(
        &self,
        token: JobToken,
        packages: BTreeMap<String, InformationPackage>,
        validation: &Value,
        cancel: &CancelFlag,
    ) -> BTreeMap<String, InformationPackage> {
        self.push(token, None, Some(JobStage::Validate), None);
        let fanout = Arc::new(Semaphore::new(self.config.stage_fanout.max(1)));
        let mut tasks = JoinSet::new();
        let mut validated = BTreeMap::new();

        for (ip_id, package) in packages {
            if cancel.is_cancelled() {
                validated.insert(ip_id, package);
                continue;
            }
            let Some(path) = package.path.clone() else {
                validated.insert(ip_id, package);
                continue;
            };

            let mut body = json!({ "validation": validation.clone() });
            body["validation"]["target"] = json!({ "path": path });

            let validator = self.validator.clone();
            let fanout = Arc::clone(&fanout);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = fanout.acquire_owned().await;
                let result = validator.run(body, &cancel).await;
                (ip_id, package, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((ip_id, mut package, result)) = joined else {
                continue;
            };
            match result {
                Ok(payload) => {
                    let valid = payload.get("valid").and_then(Value::as_bool).unwrap_or(false);
                    package.valid = Some(package.valid.unwrap_or(true) && valid);
                    self.push(
                        token,
                        Some(
                            LogEvent::new(
                                if valid { LogLevel::Info } else { LogLevel::Error },
                                JobStage::Validate,
                                "object_validator",
                                format!(
                                    "IP '{ip_id}' is {}",
                                    if valid { "valid" } else { "invalid" }
                                ),
                            )
                            .with_item(ip_id.clone()),
                        ),
                        None,
                        None,
                    );
                }
                Err(e) => {
                    package.valid = Some(false);
                    self.push(
                        token,
                        Some(
                            LogEvent::new(
                                LogLevel::Error,
                                JobStage::Validate,
                                "object_validator",
                                format!("failed payload validation for IP '{ip_id}': {e}"),
                            )
                            .with_item(ip_id.clone()),
                        ),
                        None,
                        None,
                    );
                }
            }
            let _ = self.store.update_summary(token, |summary| {
                summary.packages.insert(ip_id.clone(), package.clone());
            });
            validated.insert(ip_id, package);
        }
        validated
    }

    /// Finalizes the job as failed when cancellation was requested.
    fn abort_if_cancelled(&self, token: JobToken, stage: JobStage, cancel: &CancelFlag) -> bool {
        if !cancel.is_cancelled() {
            return false;
        }
        warn!(%token, "Job cancelled");
        self.push(
            token,
            Some(LogEvent::new(
                LogLevel::Error,
                stage,
                "orchestrator",
                "job cancelled; outstanding remote jobs were abandoned",
            )),
            Some(JobStage::Done),
            Some(JobStatus::Failed),
        );
        true
    }
}

/// Builds the standard plugin registry for a configuration: the protocol
/// harvester and the hotfolder plugin always, the demo generator only when
/// enabled.
pub fn default_registry(
    config: &Config,
    transport: Arc<dyn crate::plugins::protocol::HarvestTransport>,
) -> PluginRegistry {
    let mut registry = PluginRegistry::new()
        .register(Arc::new(crate::plugins::protocol::ProtocolHarvestPlugin::new(
            transport, config,
        )))
        .register(Arc::new(crate::plugins::hotfolder::HotfolderPlugin::new()));
    if config.enable_demo_plugin {
        registry = registry.register(Arc::new(crate::plugins::demo::DemoPlugin::new(config)));
    }
    registry
}
