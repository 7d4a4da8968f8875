//! Schema Registry - main interface
//!
//! [`SchemaRegistry`] is the only component that originates mutation
//! records. Every write follows the same path:
//!
//! 1. Not the primary? Forward to the primary and wait to observe the result.
//! 2. Take the write lock, wait until the log reader has applied everything
//!    currently in the log.
//! 3. Validate against that state (mode, references, compatibility).
//! 4. Append the record and wait until the reader has applied it.
//!
//! Losing leadership during steps 3 or 4 fails the write with `NotPrimary`.
//! Reads wait (bounded) for the reader to become ready.

use crate::auth::{AllowAll, AuthorizedRegistry, Authorizer};
use crate::compatibility::{incompatibilities, CompareResult, CompatibilityChecker};
use crate::config::{LeadershipConfig, RegistryConfig};
use crate::error::{SchemaError, SchemaResult};
use crate::forward::{unexpected, ForwardRequest, ForwardResponse, PrimaryForwarder};
use crate::leadership::{
    LeadershipCoordinator, LeaseCoordinator, LeaseStore, PrimaryInfo, StaticCoordinator,
};
use crate::log::CommitLog;
use crate::model::ParsedSchema;
use crate::reader::{LogReader, ReaderState};
use crate::record::MutationRecord;
use crate::resolver::ReferenceResolver;
use crate::state::RegistryState;
use crate::types::{
    CompatibilityLevel, Mode, Schema, SchemaId, SchemaReference, SchemaType, SchemaVersion,
    Subject, SubjectVersion,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info};

#[cfg(feature = "metrics")]
use crate::metrics::RegistryMetrics;

/// Outcome of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: SchemaId,
    pub version: u32,
    /// False when the schema was already registered under the subject
    pub created: bool,
}

enum RegisterPlan {
    Existing { id: SchemaId, version: u32 },
    New { version: u32, schema: Schema },
}

/// Schema registry node
pub struct SchemaRegistry {
    config: RegistryConfig,
    log: Arc<dyn CommitLog>,
    reader: Arc<LogReader>,
    leadership: Arc<dyn LeadershipCoordinator>,
    /// Lease election started by this node, released on shutdown
    lease: Option<Arc<LeaseCoordinator>>,
    forwarder: Option<Arc<dyn PrimaryForwarder>>,
    authorizer: Arc<dyn Authorizer>,
    /// Serializes validate-then-append on the primary
    write_lock: Mutex<()>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<RegistryMetrics>>,
}

/// Builder for [`SchemaRegistry`]
///
/// Parts not supplied are created from the config: the log backend, a
/// static or lease coordinator, and the HTTP forwarder. A lease coordinator
/// needs the [`LeaseStore`] shared by every node on the log.
pub struct RegistryBuilder {
    config: RegistryConfig,
    log: Option<Arc<dyn CommitLog>>,
    leadership: Option<Arc<dyn LeadershipCoordinator>>,
    lease_store: Option<Arc<dyn LeaseStore>>,
    forwarder: Option<Arc<dyn PrimaryForwarder>>,
    authorizer: Arc<dyn Authorizer>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<RegistryMetrics>>,
}

impl RegistryBuilder {
    /// Share an existing log (several nodes in one process)
    pub fn log(mut self, log: Arc<dyn CommitLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn leadership(mut self, leadership: Arc<dyn LeadershipCoordinator>) -> Self {
        self.leadership = Some(leadership);
        self
    }

    /// Lease store for `LeadershipConfig::Lease`
    pub fn lease_store(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.lease_store = Some(store);
        self
    }

    pub fn forwarder(mut self, forwarder: Arc<dyn PrimaryForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(mut self, metrics: Arc<RegistryMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Open the log and start consuming it
    pub async fn start(self) -> SchemaResult<Arc<SchemaRegistry>> {
        let config = self.config;
        config.validate()?;

        let log = match self.log {
            Some(log) => log,
            None => crate::log::open(&config.log).await?,
        };

        let mut lease = None;
        let leadership: Arc<dyn LeadershipCoordinator> = match self.leadership {
            Some(leadership) => leadership,
            None => match &config.leadership {
                LeadershipConfig::Static {
                    primary,
                    primary_url,
                } => {
                    let url = if *primary {
                        config.advertised_url.clone()
                    } else {
                        primary_url.clone()
                    };
                    Arc::new(StaticCoordinator::new(*primary, url))
                }
                LeadershipConfig::Lease { ttl_ms, eligible } => {
                    let store = self.lease_store.ok_or_else(|| {
                        SchemaError::Config(
                            "lease leadership requires a shared lease store".to_string(),
                        )
                    })?;
                    let coordinator = Arc::new(LeaseCoordinator::new(
                        config.node_id.clone(),
                        config.advertised_url.clone(),
                        Duration::from_millis(*ttl_ms),
                        *eligible,
                        store,
                    ));
                    coordinator.start();
                    lease = Some(coordinator.clone());
                    coordinator
                }
            },
        };

        let forwarder = match self.forwarder {
            Some(forwarder) => Some(forwarder),
            None => default_forwarder(&config)?,
        };

        let reader = LogReader::new(log.clone(), config.log.clone());
        #[cfg(feature = "metrics")]
        let reader = match &self.metrics {
            Some(metrics) => {
                track_leadership(metrics.clone(), leadership.subscribe());
                reader.with_metrics(metrics.clone())
            }
            None => reader,
        };
        let reader = Arc::new(reader);
        reader.start();

        info!(
            node = %config.node_id,
            topic = %log.topic(),
            is_primary = leadership.is_primary(),
            "Schema registry started"
        );

        Ok(Arc::new(SchemaRegistry {
            config,
            log,
            reader,
            leadership,
            lease,
            forwarder,
            authorizer: self.authorizer,
            write_lock: Mutex::new(()),
            #[cfg(feature = "metrics")]
            metrics: self.metrics,
        }))
    }
}

#[cfg(feature = "http-forward")]
fn default_forwarder(config: &RegistryConfig) -> SchemaResult<Option<Arc<dyn PrimaryForwarder>>> {
    let forwarder = crate::forward::HttpForwarder::new(config.timeouts.forward())?;
    Ok(Some(Arc::new(forwarder)))
}

#[cfg(not(feature = "http-forward"))]
fn default_forwarder(_config: &RegistryConfig) -> SchemaResult<Option<Arc<dyn PrimaryForwarder>>> {
    Ok(None)
}

#[cfg(feature = "metrics")]
fn track_leadership(metrics: Arc<RegistryMetrics>, mut changes: watch::Receiver<PrimaryInfo>) {
    metrics.set_primary(changes.borrow_and_update().is_primary);
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let is_primary = changes.borrow_and_update().is_primary;
            metrics.set_primary(is_primary);
        }
    });
}

/// Resolves once `changes` reports that this node is no longer the primary
async fn lost_leadership(changes: &mut watch::Receiver<PrimaryInfo>) {
    let lost = changes.wait_for(|info| !info.is_primary).await.is_ok();
    if !lost {
        // Coordinator gone; nothing more will be reported
        std::future::pending::<()>().await;
    }
}

/// Link the prior versions a checker selects and compare the candidate with them
fn check_against(
    state: &RegistryState,
    checker: &CompatibilityChecker,
    candidate: &ParsedSchema,
    prior: &[(u32, &Schema)],
) -> SchemaResult<Vec<CompareResult>> {
    let mut linked = Vec::new();
    for (version, schema) in checker.select_history(prior) {
        let parsed = ReferenceResolver::new(state).link(
            schema.schema_type,
            &schema.schema,
            &schema.references,
        )?;
        linked.push((*version, Arc::new(parsed)));
    }
    checker.check(candidate, &linked)
}

/// Fail deletion of `version` while live schemas pin it
fn ensure_unreferenced(state: &RegistryState, subject: &Subject, version: u32) -> SchemaResult<()> {
    if state.referrers(subject, version, false).is_empty() {
        Ok(())
    } else {
        Err(SchemaError::ReferenceExists {
            subject: subject.to_string(),
            version,
        })
    }
}

impl SchemaRegistry {
    pub fn builder(config: RegistryConfig) -> RegistryBuilder {
        RegistryBuilder {
            config,
            log: None,
            leadership: None,
            lease_store: None,
            forwarder: None,
            authorizer: Arc::new(AllowAll),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Start a node with every part created from `config`
    pub async fn new(config: RegistryConfig) -> SchemaResult<Arc<Self>> {
        Self::builder(config).start().await
    }

    /// Stop the log reader and give up a held lease
    pub async fn shutdown(&self) -> SchemaResult<()> {
        self.reader.shutdown();
        if let Some(lease) = &self.lease {
            lease.shutdown().await?;
        }
        info!(node = %self.config.node_id, "Schema registry stopped");
        Ok(())
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn is_primary(&self) -> bool {
        self.leadership.is_primary()
    }

    pub fn primary_location(&self) -> Option<String> {
        self.leadership.primary_location()
    }

    pub fn reader_status(&self) -> ReaderState {
        self.reader.status()
    }

    /// Copy of the current state
    pub fn state_snapshot(&self) -> RegistryState {
        self.reader.snapshot()
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&Arc<RegistryMetrics>> {
        self.metrics.as_ref()
    }

    /// View that checks `principal`'s permissions before each operation
    pub fn as_principal(&self, principal: impl Into<String>) -> AuthorizedRegistry<'_> {
        AuthorizedRegistry::new(self, self.authorizer.as_ref(), principal.into())
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
    async fn timed<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = SchemaResult<T>>,
    ) -> SchemaResult<T> {
        #[cfg(feature = "metrics")]
        let timer = self.metrics.as_ref().map(|m| m.start_timer(operation));
        let result = call.await;
        #[cfg(feature = "metrics")]
        if let Some(timer) = timer {
            timer.finish(&result);
        }
        result
    }

    async fn ready(&self) -> SchemaResult<()> {
        self.reader
            .wait_until_ready(self.config.timeouts.ready())
            .await
    }

    /// Wait until every record currently in the log has been applied
    async fn catch_up(&self) -> SchemaResult<()> {
        self.ready().await?;
        let high_watermark = tokio::time::timeout(self.config.timeouts.append(), self.log.high_watermark())
            .await
            .map_err(|_| SchemaError::Timeout("log high-water mark".to_string()))??;
        if high_watermark > 0 {
            self.reader
                .wait_for_offset(high_watermark - 1, self.config.timeouts.ack())
                .await?;
        }
        Ok(())
    }

    fn not_primary(&self) -> SchemaError {
        SchemaError::NotPrimary {
            primary: self.leadership.primary_location(),
        }
    }

    /// Write lock plus an up-to-date state on the primary
    async fn prepare_write(&self) -> SchemaResult<MutexGuard<'_, ()>> {
        if !self.leadership.is_primary() {
            return Err(self.not_primary());
        }
        let guard = self.write_lock.lock().await;
        self.catch_up().await?;
        Ok(guard)
    }

    fn ensure_writable(&self, subject: &Subject) -> SchemaResult<Mode> {
        let mode = self.reader.read(|state| state.effective_mode(subject));
        if mode.allows_writes() {
            Ok(mode)
        } else {
            Err(SchemaError::OperationNotPermitted(format!(
                "subject '{}' is in {} mode",
                subject, mode
            )))
        }
    }

    /// Append a record and wait until it has been applied
    async fn append(&self, record: MutationRecord) -> SchemaResult<u64> {
        let record = record.with_producer(self.config.node_id.clone());
        let key = record.key();
        let value = record.encode()?;

        let mut changes = self.leadership.subscribe();
        changes.borrow_and_update();
        if !self.leadership.is_primary() {
            return Err(self.not_primary());
        }

        let offset = tokio::select! {
            appended = tokio::time::timeout(
                self.config.timeouts.append(),
                self.log.append(Some(key), value),
            ) => appended.map_err(|_| SchemaError::Timeout("log append".to_string()))??,
            _ = lost_leadership(&mut changes) => return Err(self.not_primary()),
        };

        tokio::select! {
            applied = self.reader.wait_for_offset(offset, self.config.timeouts.ack()) => applied?,
            _ = lost_leadership(&mut changes) => return Err(self.not_primary()),
        }
        debug!(offset, op = record.op.as_str(), "Record appended and applied");
        Ok(offset)
    }

    /// Send a request to the primary, then catch up so the caller reads its write
    async fn forward(&self, request: ForwardRequest) -> SchemaResult<ForwardResponse> {
        let primary = self
            .leadership
            .primary_location()
            .ok_or(SchemaError::PrimaryUnknown)?;
        let forwarder = self.forwarder.as_ref().ok_or_else(|| SchemaError::NotPrimary {
            primary: Some(primary.clone()),
        })?;

        let operation = request.operation();
        debug!(primary = %primary, operation, "Forwarding request to primary");
        let result = tokio::time::timeout(self.config.timeouts.forward(), forwarder.forward(&primary, request))
            .await
            .map_err(|_| SchemaError::Timeout(format!("forwarded {} to {}", operation, primary)))
            .and_then(|r| r);

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_forward(operation, result.is_ok());
        }

        let response = result?;
        if operation != "get_schema_by_id" {
            self.catch_up().await?;
        }
        Ok(response)
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a schema under `subject`.
    ///
    /// Returns the existing binding, without appending, when the same
    /// canonical schema is already a live version of the subject. Content
    /// registered under another subject keeps its schema id.
    pub async fn register(
        &self,
        subject: impl Into<Subject>,
        schema_type: SchemaType,
        schema: &str,
        references: Vec<SchemaReference>,
    ) -> SchemaResult<Registration> {
        let subject = subject.into();
        self.timed("register", async {
            if self.leadership.is_primary() {
                return self
                    .register_local(&subject, schema_type, schema, &references)
                    .await;
            }
            match self
                .forward(ForwardRequest::Register {
                    subject: subject.clone(),
                    schema_type,
                    schema: schema.to_string(),
                    references,
                })
                .await?
            {
                ForwardResponse::Registered {
                    id,
                    version,
                    created,
                } => Ok(Registration {
                    id,
                    version,
                    created,
                }),
                other => Err(unexpected("register", &other)),
            }
        })
        .await
    }

    async fn register_local(
        &self,
        subject: &Subject,
        schema_type: SchemaType,
        text: &str,
        references: &[SchemaReference],
    ) -> SchemaResult<Registration> {
        let _guard = self.prepare_write().await?;
        let mode = self.ensure_writable(subject)?;
        let default_level = self.config.compatibility;

        let plan = self.reader.read(|state| -> SchemaResult<RegisterPlan> {
            let parsed = ReferenceResolver::new(state)
                .for_subject(subject)
                .link(schema_type, text, references)?;
            let fingerprint = parsed.fingerprint(references).sha256_hex();

            let known = state.schema_by_fingerprint(&fingerprint).map(|s| s.id);
            if let Some(id) = known {
                if let Some(version) = state.version_with_id(subject, id) {
                    return Ok(RegisterPlan::Existing { id, version });
                }
            }

            if mode != Mode::Import {
                let level = state.effective_compatibility(subject, default_level);
                let checker = CompatibilityChecker::new(level);
                let results = check_against(state, &checker, &parsed, &state.live_history(subject))?;
                let problems = incompatibilities(&results);
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_compatibility_check(&level.to_string(), problems.is_empty());
                }
                if !problems.is_empty() {
                    return Err(SchemaError::Incompatible(problems));
                }
            }

            let id = known.unwrap_or(SchemaId::new(state.max_schema_id() + 1));
            Ok(RegisterPlan::New {
                version: state.next_version(subject),
                schema: Schema {
                    id,
                    schema_type,
                    schema: parsed.canonical_form().to_string(),
                    fingerprint,
                    references: references.to_vec(),
                },
            })
        })?;

        match plan {
            RegisterPlan::Existing { id, version } => {
                debug!(subject = %subject, version, id = %id, "Schema already registered");
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_registration(schema_type.as_str(), false);
                }
                Ok(Registration {
                    id,
                    version,
                    created: false,
                })
            }
            RegisterPlan::New { version, schema } => {
                self.append(MutationRecord::register(subject, version, &schema))
                    .await?;
                info!(subject = %subject, version, id = %schema.id, "Registered schema");
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.metrics {
                    metrics.record_registration(schema_type.as_str(), true);
                    metrics.record_schema_size(schema_type.as_str(), schema.schema.len());
                }
                Ok(Registration {
                    id: schema.id,
                    version,
                    created: true,
                })
            }
        }
    }

    /// Check a candidate against `version` of `subject` without registering it.
    ///
    /// `latest` applies the subject's level in full (all live versions for
    /// transitive levels); a concrete version is checked alone.
    pub async fn check_compatibility(
        &self,
        subject: impl Into<Subject>,
        version: SchemaVersion,
        schema_type: SchemaType,
        schema: &str,
        references: Vec<SchemaReference>,
    ) -> SchemaResult<Vec<CompareResult>> {
        let subject = subject.into();
        self.timed("check_compatibility", async {
            self.ready().await?;
            let default_level = self.config.compatibility;
            self.reader.read(|state| -> SchemaResult<Vec<CompareResult>> {
                let parsed = ReferenceResolver::new(state)
                    .for_subject(&subject)
                    .link(schema_type, schema, &references)?;
                let level = state.effective_compatibility(&subject, default_level);
                let checker = CompatibilityChecker::new(level);

                let history = state.live_history(&subject);
                let prior: Vec<(u32, &Schema)> = if version.is_latest() {
                    state.resolve_version(&subject, version, false)?;
                    history
                } else {
                    let (number, _) = state.resolve_version(&subject, version, false)?;
                    history.into_iter().filter(|(v, _)| *v == number).collect()
                };
                let results = check_against(state, &checker, &parsed, &prior)?;
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.metrics {
                    let compatible = results.iter().all(CompareResult::is_compatible);
                    metrics.record_compatibility_check(&level.to_string(), compatible);
                }
                Ok(results)
            })
        })
        .await
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Delete one version. Permanent deletion requires a prior soft delete.
    pub async fn delete_version(
        &self,
        subject: impl Into<Subject>,
        version: SchemaVersion,
        permanent: bool,
    ) -> SchemaResult<u32> {
        let subject = subject.into();
        self.timed("delete_version", async {
            if !self.leadership.is_primary() {
                return match self
                    .forward(ForwardRequest::DeleteVersion {
                        subject: subject.clone(),
                        version,
                        permanent,
                    })
                    .await?
                {
                    ForwardResponse::Version { version } => Ok(version),
                    other => Err(unexpected("delete_version", &other)),
                };
            }
            self.delete_version_local(&subject, version, permanent).await
        })
        .await
    }

    async fn delete_version_local(
        &self,
        subject: &Subject,
        version: SchemaVersion,
        permanent: bool,
    ) -> SchemaResult<u32> {
        let _guard = self.prepare_write().await?;
        self.ensure_writable(subject)?;

        let number = self.reader.read(|state| -> SchemaResult<u32> {
            let (number, entry) = state.resolve_version(subject, version, permanent)?;
            if permanent && !entry.deleted {
                return Err(SchemaError::VersionNotSoftDeleted {
                    subject: subject.to_string(),
                    version: number,
                });
            }
            ensure_unreferenced(state, subject, number)?;
            Ok(number)
        })?;

        self.append(MutationRecord::delete_version(subject, number, permanent))
            .await?;
        info!(subject = %subject, version = number, permanent, "Deleted schema version");
        Ok(number)
    }

    /// Delete every version of a subject; returns the versions deleted.
    /// Permanent deletion requires a prior soft delete.
    pub async fn delete_subject(
        &self,
        subject: impl Into<Subject>,
        permanent: bool,
    ) -> SchemaResult<Vec<u32>> {
        let subject = subject.into();
        self.timed("delete_subject", async {
            if !self.leadership.is_primary() {
                return match self
                    .forward(ForwardRequest::DeleteSubject {
                        subject: subject.clone(),
                        permanent,
                    })
                    .await?
                {
                    ForwardResponse::Versions { versions } => Ok(versions),
                    other => Err(unexpected("delete_subject", &other)),
                };
            }
            self.delete_subject_local(&subject, permanent).await
        })
        .await
    }

    async fn delete_subject_local(&self, subject: &Subject, permanent: bool) -> SchemaResult<Vec<u32>> {
        let _guard = self.prepare_write().await?;
        self.ensure_writable(subject)?;

        let versions = self.reader.read(|state| -> SchemaResult<Vec<u32>> {
            let versions = state.versions(subject, permanent)?;
            if permanent && !state.versions(subject, false).map(|v| v.is_empty()).unwrap_or(true) {
                return Err(SchemaError::SubjectNotSoftDeleted(subject.to_string()));
            }
            for version in &versions {
                ensure_unreferenced(state, subject, *version)?;
            }
            Ok(versions)
        })?;

        self.append(MutationRecord::delete_subject(subject, permanent))
            .await?;
        info!(subject = %subject, permanent, versions = versions.len(), "Deleted subject");
        Ok(versions)
    }

    // ========================================================================
    // Config and mode
    // ========================================================================

    /// Effective compatibility level: subject override, global, then default
    pub async fn get_config(&self, subject: Option<&Subject>) -> SchemaResult<CompatibilityLevel> {
        self.ready().await?;
        let default_level = self.config.compatibility;
        Ok(self.reader.read(|state| match subject {
            Some(subject) => state.effective_compatibility(subject, default_level),
            None => state.compatibility(None).unwrap_or(default_level),
        }))
    }

    /// Set the level for a subject, or globally with `None`
    pub async fn set_config(
        &self,
        subject: Option<Subject>,
        level: CompatibilityLevel,
    ) -> SchemaResult<CompatibilityLevel> {
        self.timed("set_config", async {
            if !self.leadership.is_primary() {
                return match self
                    .forward(ForwardRequest::SetConfig {
                        subject,
                        compatibility: level,
                    })
                    .await?
                {
                    ForwardResponse::Config {
                        compatibility: Some(level),
                    } => Ok(level),
                    other => Err(unexpected("set_config", &other)),
                };
            }
            self.set_config_local(subject.as_ref(), level).await
        })
        .await
    }

    async fn set_config_local(
        &self,
        subject: Option<&Subject>,
        level: CompatibilityLevel,
    ) -> SchemaResult<CompatibilityLevel> {
        let _guard = self.prepare_write().await?;
        self.append(MutationRecord::update_config(subject, Some(level)))
            .await?;
        info!(subject = ?subject.map(Subject::as_str), level = %level, "Updated compatibility");
        Ok(level)
    }

    /// Remove a subject's override; returns the level that was removed
    pub async fn delete_config(&self, subject: impl Into<Subject>) -> SchemaResult<Option<CompatibilityLevel>> {
        let subject = subject.into();
        self.timed("delete_config", async {
            if !self.leadership.is_primary() {
                return match self
                    .forward(ForwardRequest::DeleteConfig {
                        subject: subject.clone(),
                    })
                    .await?
                {
                    ForwardResponse::Config { compatibility } => Ok(compatibility),
                    other => Err(unexpected("delete_config", &other)),
                };
            }
            self.delete_config_local(&subject).await
        })
        .await
    }

    async fn delete_config_local(&self, subject: &Subject) -> SchemaResult<Option<CompatibilityLevel>> {
        let _guard = self.prepare_write().await?;
        let previous = self.reader.read(|state| state.compatibility(Some(subject)));
        if previous.is_some() {
            self.append(MutationRecord::update_config(Some(subject), None))
                .await?;
            info!(subject = %subject, "Removed compatibility override");
        }
        Ok(previous)
    }

    /// Effective mode: subject override, global, then READWRITE
    pub async fn get_mode(&self, subject: Option<&Subject>) -> SchemaResult<Mode> {
        self.ready().await?;
        Ok(self.reader.read(|state| match subject {
            Some(subject) => state.effective_mode(subject),
            None => state.mode(None).unwrap_or_default(),
        }))
    }

    /// Set the mode for a subject, or globally with `None`.
    ///
    /// Allowed in every mode, so a read-only registry can be reopened.
    pub async fn set_mode(&self, subject: Option<Subject>, mode: Mode) -> SchemaResult<Mode> {
        self.timed("set_mode", async {
            if !self.leadership.is_primary() {
                return match self
                    .forward(ForwardRequest::SetMode { subject, mode })
                    .await?
                {
                    ForwardResponse::Mode { mode } => Ok(mode),
                    other => Err(unexpected("set_mode", &other)),
                };
            }
            self.set_mode_local(subject.as_ref(), mode).await
        })
        .await
    }

    async fn set_mode_local(&self, subject: Option<&Subject>, mode: Mode) -> SchemaResult<Mode> {
        let _guard = self.prepare_write().await?;
        self.append(MutationRecord::update_mode(subject, Some(mode)))
            .await?;
        info!(subject = ?subject.map(Subject::as_str), mode = %mode, "Updated mode");
        Ok(mode)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn list_subjects(&self, include_deleted: bool) -> SchemaResult<Vec<Subject>> {
        self.ready().await?;
        Ok(self.reader.read(|state| state.subjects(include_deleted)))
    }

    pub async fn list_versions(
        &self,
        subject: impl Into<Subject>,
        include_deleted: bool,
    ) -> SchemaResult<Vec<u32>> {
        let subject = subject.into();
        self.ready().await?;
        self.reader
            .read(|state| state.versions(&subject, include_deleted))
    }

    /// Schema by global id.
    ///
    /// A follower still catching up asks the primary instead of waiting,
    /// when `forward_reads_when_not_ready` is set.
    pub async fn get_schema_by_id(&self, id: SchemaId) -> SchemaResult<Schema> {
        self.timed("get_schema_by_id", async {
            if self.config.forward_reads_when_not_ready
                && !self.reader.is_ready()
                && !self.leadership.is_primary()
                && self.forwarder.is_some()
            {
                return match self.forward(ForwardRequest::GetSchemaById { id }).await? {
                    ForwardResponse::Schema { schema } => Ok(schema),
                    other => Err(unexpected("get_schema_by_id", &other)),
                };
            }
            self.get_schema_by_id_local(id).await
        })
        .await
    }

    async fn get_schema_by_id_local(&self, id: SchemaId) -> SchemaResult<Schema> {
        self.ready().await?;
        self.reader
            .read(|state| state.schema(id).cloned())
            .ok_or_else(|| SchemaError::NotFound(format!("schema id {}", id)))
    }

    /// A live version; `latest` is the highest live version
    pub async fn get_version(
        &self,
        subject: impl Into<Subject>,
        version: SchemaVersion,
    ) -> SchemaResult<SubjectVersion> {
        let subject = subject.into();
        self.ready().await?;
        self.reader
            .read(|state| state.subject_version(&subject, version, false))
    }

    /// Live version of `subject` whose canonical form matches the candidate
    pub async fn lookup(
        &self,
        subject: impl Into<Subject>,
        schema_type: SchemaType,
        schema: &str,
        references: Vec<SchemaReference>,
    ) -> SchemaResult<SubjectVersion> {
        let subject = subject.into();
        self.ready().await?;
        self.reader.read(|state| {
            state.versions(&subject, false)?;
            let parsed = ReferenceResolver::new(state).link(schema_type, schema, &references)?;
            let fingerprint = parsed.fingerprint(&references).sha256_hex();
            let version = state
                .schema_by_fingerprint(&fingerprint)
                .and_then(|s| state.version_with_id(&subject, s.id))
                .ok_or_else(|| {
                    SchemaError::NotFound(format!("schema not registered under '{}'", subject))
                })?;
            state.subject_version(&subject, SchemaVersion::new(version), false)
        })
    }

    /// Live subject/version pairs bound to a schema id
    pub async fn subjects_for_schema(&self, id: SchemaId) -> SchemaResult<Vec<(Subject, u32)>> {
        self.ready().await?;
        self.reader.read(|state| {
            if state.schema(id).is_none() {
                return Err(SchemaError::NotFound(format!("schema id {}", id)));
            }
            Ok(state.subjects_for_schema(id))
        })
    }

    /// Ids of live schemas that reference `version` of `subject`
    pub async fn referenced_by(
        &self,
        subject: impl Into<Subject>,
        version: SchemaVersion,
    ) -> SchemaResult<Vec<SchemaId>> {
        let subject = subject.into();
        self.ready().await?;
        self.reader.read(|state| {
            let (number, _) = state.resolve_version(&subject, version, false)?;
            Ok(state.referrers(&subject, number, true))
        })
    }

    // ========================================================================
    // Forwarded requests
    // ========================================================================

    /// Run a request forwarded by another node.
    ///
    /// Writes never hop again: a node that is not the primary answers
    /// `NotPrimary` and the sender re-resolves the primary.
    pub async fn execute_forwarded(&self, request: ForwardRequest) -> SchemaResult<ForwardResponse> {
        debug!(operation = request.operation(), "Executing forwarded request");
        match request {
            ForwardRequest::Register {
                subject,
                schema_type,
                schema,
                references,
            } => {
                let registration = self
                    .register_local(&subject, schema_type, &schema, &references)
                    .await?;
                Ok(ForwardResponse::Registered {
                    id: registration.id,
                    version: registration.version,
                    created: registration.created,
                })
            }
            ForwardRequest::DeleteVersion {
                subject,
                version,
                permanent,
            } => Ok(ForwardResponse::Version {
                version: self.delete_version_local(&subject, version, permanent).await?,
            }),
            ForwardRequest::DeleteSubject { subject, permanent } => Ok(ForwardResponse::Versions {
                versions: self.delete_subject_local(&subject, permanent).await?,
            }),
            ForwardRequest::SetConfig {
                subject,
                compatibility,
            } => Ok(ForwardResponse::Config {
                compatibility: Some(self.set_config_local(subject.as_ref(), compatibility).await?),
            }),
            ForwardRequest::DeleteConfig { subject } => Ok(ForwardResponse::Config {
                compatibility: self.delete_config_local(&subject).await?,
            }),
            ForwardRequest::SetMode { subject, mode } => Ok(ForwardResponse::Mode {
                mode: self.set_mode_local(subject.as_ref(), mode).await?,
            }),
            ForwardRequest::GetSchemaById { id } => Ok(ForwardResponse::Schema {
                schema: self.get_schema_by_id_local(id).await?,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::error_codes;

    const AVRO_V1: &str = r#"{"type":"record","name":"User","fields":[{"name":"id","type":"long"},{"name":"name","type":"string"}]}"#;
    const AVRO_V2: &str = r#"{"type":"record","name":"User","fields":[{"name":"id","type":"long"},{"name":"name","type":"string"},{"name":"email","type":["null","string"],"default":null}]}"#;
    // drops a field that readers of v1 require
    const AVRO_BREAKING: &str = r#"{"type":"record","name":"User","fields":[{"name":"id","type":"long"}]}"#;

    async fn registry() -> Arc<SchemaRegistry> {
        SchemaRegistry::new(RegistryConfig::memory()).await.unwrap()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    #[tokio::test]
    async fn test_register_assigns_ids_and_versions() {
        let registry = registry().await;

        let first = registry
            .register("users-value", SchemaType::Avro, AVRO_V1, vec![])
            .await
            .unwrap();
        assert_eq!(first, Registration { id: SchemaId(1), version: 1, created: true });

        let second = registry
            .register("users-value", SchemaType::Avro, AVRO_V2, vec![])
            .await
            .unwrap();
        assert_eq!(second.id, SchemaId(2));
        assert_eq!(second.version, 2);

        // read-your-writes: visible as soon as register returns
        let latest = registry
            .get_version("users-value", SchemaVersion::latest())
            .await
            .unwrap();
        assert_eq!(latest.id, SchemaId(2));
    }

    #[tokio::test]
    async fn test_duplicate_registration_does_not_append() {
        let registry = registry().await;
        registry
            .register("users-value", SchemaType::Avro, AVRO_V1, vec![])
            .await
            .unwrap();
        let offset = registry.reader.next_offset();

        // whitespace differences canonicalize away
        let pretty = serde_json::to_string_pretty(&serde_json::from_str::<serde_json::Value>(AVRO_V1).unwrap()).unwrap();
        let again = registry
            .register("users-value", SchemaType::Avro, &pretty, vec![])
            .await
            .unwrap();
        assert_eq!(again, Registration { id: SchemaId(1), version: 1, created: false });
        assert_eq!(registry.reader.next_offset(), offset);
    }

    #[tokio::test]
    async fn test_same_schema_other_subject_reuses_id() {
        let registry = registry().await;
        let a = registry
            .register("a", SchemaType::Avro, AVRO_V1, vec![])
            .await
            .unwrap();
        let b = registry
            .register("b", SchemaType::Avro, AVRO_V1, vec![])
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
        assert!(b.created);
        assert_eq!(
            registry.subjects_for_schema(a.id).await.unwrap(),
            vec![(Subject::new("a"), 1), (Subject::new("b"), 1)]
        );
    }

    #[tokio::test]
    async fn test_incompatible_registration_is_rejected() {
        let registry = registry().await;
        registry
            .register("users-value", SchemaType::Avro, AVRO_V1, vec![])
            .await
            .unwrap();
        let offset = registry.reader.next_offset();

        let err = registry
            .register("users-value", SchemaType::Avro, AVRO_BREAKING, vec![])
            .await
            .unwrap_err();
        match &err {
            SchemaError::Incompatible(records) => assert!(!records.is_empty()),
            other => panic!("expected incompatibility, got {:?}", other),
        }
        assert_eq!(err.error_code(), error_codes::INCOMPATIBLE_SCHEMA);
        assert_eq!(registry.reader.next_offset(), offset);
    }

    #[tokio::test]
    async fn test_invalid_schema_is_rejected() {
        let registry = registry().await;
        let err = registry
            .register("bad", SchemaType::Avro, "{not json", vec![])
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 422);
    }

    // ========================================================================
    // Compatibility preview
    // ========================================================================

    #[tokio::test]
    async fn test_check_compatibility_does_not_register() {
        let registry = registry().await;
        registry
            .register("users-value", SchemaType::Avro, AVRO_V1, vec![])
            .await
            .unwrap();

        let results = registry
            .check_compatibility("users-value", SchemaVersion::latest(), SchemaType::Avro, AVRO_BREAKING, vec![])
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].is_compatible());

        let results = registry
            .check_compatibility("users-value", SchemaVersion::new(1), SchemaType::Avro, AVRO_V2, vec![])
            .await
            .unwrap();
        assert!(results.iter().all(CompareResult::is_compatible));
        assert_eq!(registry.list_versions("users-value", false).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_check_compatibility_unknown_version() {
        let registry = registry().await;
        let err = registry
            .check_compatibility("ghost", SchemaVersion::latest(), SchemaType::Avro, AVRO_V1, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::SubjectNotFound(_)));
    }

    // ========================================================================
    // Config and mode
    // ========================================================================

    #[tokio::test]
    async fn test_config_levels() {
        let registry = registry().await;
        let subject = Subject::new("users-value");
        assert_eq!(registry.get_config(None).await.unwrap(), CompatibilityLevel::Backward);

        registry.set_config(None, CompatibilityLevel::Full).await.unwrap();
        registry
            .set_config(Some(subject.clone()), CompatibilityLevel::None)
            .await
            .unwrap();
        assert_eq!(registry.get_config(Some(&subject)).await.unwrap(), CompatibilityLevel::None);

        assert_eq!(
            registry.delete_config(subject.clone()).await.unwrap(),
            Some(CompatibilityLevel::None)
        );
        assert_eq!(registry.get_config(Some(&subject)).await.unwrap(), CompatibilityLevel::Full);
        assert_eq!(registry.delete_config(subject).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_none_level_accepts_breaking_change() {
        let registry = registry().await;
        registry
            .set_config(Some(Subject::new("users-value")), CompatibilityLevel::None)
            .await
            .unwrap();
        registry
            .register("users-value", SchemaType::Avro, AVRO_V1, vec![])
            .await
            .unwrap();
        registry
            .register("users-value", SchemaType::Avro, AVRO_BREAKING, vec![])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_readonly_and_import_modes() {
        let registry = registry().await;
        registry.set_mode(None, Mode::Readonly).await.unwrap();
        let err = registry
            .register("users-value", SchemaType::Avro, AVRO_V1, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::OperationNotPermitted(_)));

        let subject = Subject::new("users-value");
        registry.set_mode(Some(subject.clone()), Mode::Import).await.unwrap();
        assert_eq!(registry.get_mode(Some(&subject)).await.unwrap(), Mode::Import);
        assert_eq!(registry.get_mode(None).await.unwrap(), Mode::Readonly);

        // import skips the compatibility check
        registry
            .register("users-value", SchemaType::Avro, AVRO_V1, vec![])
            .await
            .unwrap();
        registry
            .register("users-value", SchemaType::Avro, AVRO_BREAKING, vec![])
            .await
            .unwrap();
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    #[tokio::test]
    async fn test_permanent_delete_requires_soft_delete() {
        let registry = registry().await;
        registry
            .register("users-value", SchemaType::Avro, AVRO_V1, vec![])
            .await
            .unwrap();

        let err = registry
            .delete_version("users-value", SchemaVersion::new(1), true)
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::VersionNotSoftDeleted { version: 1, .. }));
        let err = registry.delete_subject("users-value", true).await.unwrap_err();
        assert!(matches!(err, SchemaError::SubjectNotSoftDeleted(_)));

        assert_eq!(
            registry.delete_subject("users-value", false).await.unwrap(),
            vec![1]
        );
        assert!(registry.list_subjects(false).await.unwrap().is_empty());
        assert_eq!(
            registry.delete_subject("users-value", true).await.unwrap(),
            vec![1]
        );
        assert!(registry.list_subjects(true).await.unwrap().is_empty());

        // the schema stays reachable by id
        registry.get_schema_by_id(SchemaId(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_soft_deleted_version_is_hidden() {
        let registry = registry().await;
        registry
            .register("users-value", SchemaType::Avro, AVRO_V1, vec![])
            .await
            .unwrap();
        registry
            .register("users-value", SchemaType::Avro, AVRO_V2, vec![])
            .await
            .unwrap();

        assert_eq!(
            registry
                .delete_version("users-value", SchemaVersion::latest(), false)
                .await
                .unwrap(),
            2
        );
        assert_eq!(registry.list_versions("users-value", false).await.unwrap(), vec![1]);
        assert_eq!(registry.list_versions("users-value", true).await.unwrap(), vec![1, 2]);
        let err = registry
            .get_version("users-value", SchemaVersion::new(2))
            .await
            .unwrap_err();
        assert!(matches!(err, SchemaError::VersionNotFound { .. }));

        // re-registering deleted content creates a new version with the old id
        let again = registry
            .register("users-value", SchemaType::Avro, AVRO_V2, vec![])
            .await
            .unwrap();
        assert_eq!(again, Registration { id: SchemaId(2), version: 3, created: true });
    }

    #[tokio::test]
    async fn test_get_schema_by_unknown_id() {
        let registry = registry().await;
        let err = registry.get_schema_by_id(SchemaId(42)).await.unwrap_err();
        assert!(matches!(err, SchemaError::NotFound(_)));
        assert_eq!(err.http_status(), 404);
    }

    // ========================================================================
    // Leadership
    // ========================================================================

    #[tokio::test]
    async fn test_lease_leadership_needs_a_shared_store() {
        let config = RegistryConfig::memory()
            .with_leadership(LeadershipConfig::lease(Duration::from_millis(300), true));

        let err = SchemaRegistry::builder(config.clone()).start().await.err().unwrap();
        assert!(matches!(err, SchemaError::Config(_)));

        let registry = SchemaRegistry::builder(config)
            .lease_store(Arc::new(crate::leadership::MemoryLeaseStore::new()))
            .start()
            .await
            .unwrap();
        registry.shutdown().await.unwrap();
    }
}
