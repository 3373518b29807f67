//! Capture orchestration
//!
//! Drives a capture through `spec`, local config validation, `discover`,
//! binding resolution and connector `validate`, then reads every binding
//! concurrently. For each checkpoint a binding emits, the buffered records are
//! committed to the target collection first and the checkpoint is persisted
//! second, so a persisted checkpoint never covers records that were not
//! durably written.

use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::config::RuntimeConfig;
use crate::connector::{Connector, ConnectorRegistry};
use crate::error::{Result, RuntimeError};
use crate::protocol::{
    ConnectorError, DiscoverResponse, ReadMessage, ReadRequest, SpecResponse, SyncMode,
    ValidateRequest, ValidationStatus,
};
use crate::resolver::{self, BindingPlan, ResolvedBinding};
use crate::schema::{
    self, ConfigValidationError, FieldViolation, SchemaNode, ValidatedConfig, ViolationKind,
};
use crate::session::{BindingOutcome, BindingReport, CaptureSession, SessionReport};
use crate::sink::CollectionSink;
use crate::spec::CaptureSpec;
use crate::state::{BindingState, ResumePoint};
use capflow_common::RetryPolicy;
use futures::{stream, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Knobs of a capture session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Bindings read at the same time
    pub max_concurrency: usize,
    /// Applies to connector calls and to transient read failures
    pub retry: RetryPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_concurrency: crate::config::DEFAULT_MAX_CONCURRENCY,
            retry: RetryPolicy::default(),
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        Ok(Self {
            max_concurrency: config.max_concurrency,
            retry: config.retry_policy()?,
        })
    }
}

/// A capture that passed every check and is ready to read
pub struct PreparedCapture {
    pub connector: Arc<dyn Connector>,
    pub spec: SpecResponse,
    pub config: ValidatedConfig,
    pub catalog: DiscoverResponse,
    pub plan: BindingPlan,
}

pub struct CaptureOrchestrator {
    registry: ConnectorRegistry,
    store: Arc<dyn CheckpointStore>,
    sink: Arc<dyn CollectionSink>,
    options: SessionOptions,
}

impl CaptureOrchestrator {
    pub fn new(
        registry: ConnectorRegistry,
        store: Arc<dyn CheckpointStore>,
        sink: Arc<dyn CollectionSink>,
        options: SessionOptions,
    ) -> Self {
        Self {
            registry,
            store,
            sink,
            options: SessionOptions {
                max_concurrency: options.max_concurrency.max(1),
                ..options
            },
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    fn connector_for(&self, capture: &CaptureSpec) -> Result<Arc<dyn Connector>> {
        self.registry
            .resolve(&capture.image)
            .ok_or_else(|| RuntimeError::UnknownConnector(capture.image.clone()))
    }

    async fn call<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ConnectorError>>,
    {
        Ok(self
            .options
            .retry
            .retry(operation, ConnectorError::is_transient, op)
            .await?)
    }

    /// Validate the endpoint config and, optionally, every enabled binding's
    /// resource config. All violations are reported together.
    fn validate_config(
        &self,
        capture: &CaptureSpec,
        spec: &SpecResponse,
        with_resources: bool,
    ) -> Result<ValidatedConfig> {
        let endpoint_schema = SchemaNode::compile(&spec.config_schema).map_err(|source| {
            RuntimeError::InvalidSchema {
                which: "endpoint config",
                source,
            }
        })?;

        let mut violations = Vec::new();
        let config = match schema::validate(&endpoint_schema, &capture.config, "endpoint config") {
            Ok(config) => Some(config),
            Err(e) => {
                violations.extend(e.violations);
                None
            },
        };

        if let (true, Some(resource_schema)) = (with_resources, &spec.resource_schema) {
            let resource_schema = SchemaNode::compile(resource_schema).map_err(|source| {
                RuntimeError::InvalidSchema {
                    which: "resource config",
                    source,
                }
            })?;

            for (i, binding) in capture.bindings.iter().enumerate() {
                if binding.disable {
                    continue;
                }
                if let Err(e) = schema::validate(&resource_schema, &binding.resource, "resource") {
                    violations.extend(e.prefixed(&format!("bindings[{}].resource", i)).violations);
                }
            }
        }

        match config {
            Some(config) if violations.is_empty() => {
                debug!(config = %config.redacted(), "Endpoint configuration validated");
                Ok(config)
            },
            _ => Err(ConfigValidationError::new(format!("capture {}", capture.name), violations).into()),
        }
    }

    /// Streams the connector offers for this capture's endpoint config
    #[tracing::instrument(skip(self, capture), fields(capture = %capture.name))]
    pub async fn discover(&self, capture: &CaptureSpec) -> Result<DiscoverResponse> {
        let connector = self.connector_for(capture)?;
        let spec = self.call("spec", || connector.spec()).await?;
        let config = self.validate_config(capture, &spec, false)?;
        let catalog = self
            .call("discover", || connector.discover(config.as_value()))
            .await?;
        info!(streams = catalog.streams.len(), "Discovered streams");
        Ok(catalog)
    }

    /// Run every check short of reading: config validation, discovery,
    /// binding resolution and connector validation
    #[tracing::instrument(skip(self, capture), fields(capture = %capture.name, image = %capture.image))]
    pub async fn prepare(&self, capture: &CaptureSpec) -> Result<PreparedCapture> {
        let connector = self.connector_for(capture)?;
        let spec = self.call("spec", || connector.spec()).await?;
        let config = self.validate_config(capture, &spec, true)?;

        let catalog = self
            .call("discover", || connector.discover(config.as_value()))
            .await?;
        let plan = resolver::resolve(&capture.bindings, &catalog)?;
        for stream in &plan.disabled {
            info!(stream = %stream, "Skipping disabled binding");
        }

        let request = ValidateRequest {
            capture: capture.name.clone(),
            config: config.as_value().clone(),
            bindings: plan.bindings.iter().map(ResolvedBinding::to_request).collect(),
        };
        let response = self.call("validate", || connector.validate(&request)).await?;
        if response.status == ValidationStatus::Failed {
            let message = response
                .message
                .unwrap_or_else(|| "connector rejected the configuration".to_string());
            return Err(ConfigValidationError::new(
                format!("capture {}", capture.name),
                vec![FieldViolation::new("", ViolationKind::Rejected(message))],
            )
            .into());
        }

        info!(bindings = plan.bindings.len(), "Capture is ready");
        Ok(PreparedCapture {
            connector,
            spec,
            config,
            catalog,
            plan,
        })
    }

    /// Run a capture session until every binding finished or `cancel` fires
    ///
    /// Failures before reading starts are returned as errors. Failures of
    /// individual bindings are reported in the [`SessionReport`]; the first
    /// fatal one cancels the remaining bindings.
    pub async fn run(&self, capture: &CaptureSpec, cancel: CancellationToken) -> Result<SessionReport> {
        let prepared = self.prepare(capture).await?;
        let session = CaptureSession::new(capture.name.clone(), prepared.config, prepared.plan, &cancel);
        let connector = prepared.connector;

        let span = info_span!("session", capture = %capture.name, session_id = %session.id());
        async {
            info!(
                bindings = session.bindings().len(),
                max_concurrency = self.options.max_concurrency,
                "Starting capture session"
            );

            let reports: Vec<BindingReport> = stream::iter(session.bindings())
                .map(|binding| self.run_binding(&session, &connector, binding))
                .buffer_unordered(self.options.max_concurrency)
                .collect()
                .await;

            let report = session.finish(reports);
            info!(
                status = %report.status,
                records = report.total_records(),
                "Capture session finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Run `capture` repeatedly, waiting its `interval` after each session
    ///
    /// Returns the last report once a session does not complete, once `cancel`
    /// fires, or after a single session when the capture has no interval.
    /// `on_report` sees every session report as it finishes.
    pub async fn run_on_interval<F>(
        &self,
        capture: &CaptureSpec,
        cancel: CancellationToken,
        mut on_report: F,
    ) -> Result<SessionReport>
    where
        F: FnMut(&SessionReport),
    {
        loop {
            let report = self.run(capture, cancel.clone()).await?;
            on_report(&report);

            let Some(interval) = capture.interval else {
                return Ok(report);
            };
            if !report.is_success() {
                warn!(capture = %capture.name, status = %report.status, "Not scheduling another session");
                return Ok(report);
            }

            info!(
                capture = %capture.name,
                interval = %humantime::format_duration(interval),
                "Waiting for next session"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(report),
                _ = tokio::time::sleep(interval) => {},
            }
        }
    }

    async fn run_binding(
        &self,
        session: &CaptureSession,
        connector: &Arc<dyn Connector>,
        binding: &ResolvedBinding,
    ) -> BindingReport {
        let span = info_span!(
            "binding",
            stream = %binding.qualified_stream(),
            target = %binding.target,
            sync_mode = %binding.sync_mode
        );

        async {
            let mut state = BindingState::new(binding.qualified_stream(), binding.sync_mode);
            let mut attempts = 0;
            let outcome = match self
                .drive_binding(session, connector, binding, &mut state, &mut attempts)
                .await
            {
                Ok(()) => {
                    info!(
                        records = state.records_forwarded(),
                        commits = state.commits(),
                        "Binding completed"
                    );
                    BindingOutcome::Completed
                },
                Err(RuntimeError::Cancelled) => {
                    info!(records = state.records_forwarded(), "Binding cancelled");
                    BindingOutcome::Cancelled
                },
                Err(e) => {
                    error!(kind = %e.kind(), error = %e, "Binding failed");
                    if let Err(transition) = state.fail() {
                        warn!(error = %transition, "Binding already finished");
                    }
                    session.abort();
                    BindingOutcome::from_error(&e)
                },
            };

            BindingReport {
                index: binding.index,
                stream: binding.qualified_stream(),
                target: binding.target.clone(),
                sync_mode: binding.sync_mode,
                phase: state.phase(),
                outcome,
                records_forwarded: state.records_forwarded(),
                commits: state.commits(),
                regressions: state.regressions(),
                attempts,
                resume_checkpoint: session.checkpoint_of(binding),
            }
        }
        .instrument(span)
        .await
    }

    async fn drive_binding(
        &self,
        session: &CaptureSession,
        connector: &Arc<dyn Connector>,
        binding: &ResolvedBinding,
        state: &mut BindingState,
        attempts: &mut u32,
    ) -> Result<()> {
        if session.cancel_token().is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }

        let key = session.key_for(binding);
        let (prior, start_cursor) = match binding.sync_mode {
            SyncMode::Incremental => {
                if binding.backfill > 0 {
                    self.clear_superseded(&key).await?;
                }
                let prior = self.store.load(&key).await?;
                if let Some(cp) = &prior {
                    info!(cursor = ?cp.cursor, records = cp.records, "Resuming from checkpoint");
                    session.record_checkpoint(binding, cp);
                }
                (prior, session.config().start_cursor())
            },
            SyncMode::FullRefresh => {
                if self.store.clear(&key).await? {
                    info!("Cleared stale checkpoint of full-refresh binding");
                }
                (None, None)
            },
        };

        let mut resume = state.start(prior, start_cursor)?;
        let mut buffer = Vec::new();

        loop {
            *attempts += 1;
            match self
                .read_binding(session, connector, binding, state, &resume, &mut buffer)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && self.options.retry.should_retry(*attempts) => {
                    let backoff = self.options.retry.backoff_for(*attempts);
                    warn!(
                        attempt = *attempts,
                        max_attempts = self.options.retry.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        discarded = buffer.len(),
                        error = %e,
                        "Transient read failure, resuming from last checkpoint"
                    );
                    buffer.clear();

                    tokio::select! {
                        biased;
                        _ = session.cancel_token().cancelled() => return Err(RuntimeError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {},
                    }
                    resume = state.restart()?;
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// One `read` attempt: buffer records and commit them at each checkpoint
    async fn read_binding(
        &self,
        session: &CaptureSession,
        connector: &Arc<dyn Connector>,
        binding: &ResolvedBinding,
        state: &mut BindingState,
        resume: &ResumePoint,
        buffer: &mut Vec<Value>,
    ) -> Result<()> {
        let cancel = session.cancel_token();
        let request = ReadRequest {
            capture: session.capture().to_string(),
            config: session.config().as_value().clone(),
            binding: binding.to_request(),
            state: resume.state.clone(),
            start_cursor: resume.start_cursor.clone(),
        };
        debug!(start_cursor = ?request.start_cursor, "Starting read");

        let mut messages = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
            messages = connector.read(request) => messages?,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                next = messages.next() => next,
            };

            match next {
                Some(Ok(ReadMessage::Record(record))) => {
                    if record.stream != binding.stream {
                        return Err(ConnectorError::protocol(format!(
                            "record for stream '{}' while reading '{}'",
                            record.stream, binding.stream
                        ))
                        .into());
                    }
                    state.record()?;
                    buffer.push(record.data);
                },
                Some(Ok(ReadMessage::Checkpoint(checkpoint))) => {
                    if let Some(stream) = checkpoint.stream.as_deref() {
                        if stream != binding.stream {
                            return Err(ConnectorError::protocol(format!(
                                "checkpoint for stream '{}' while reading '{}'",
                                stream, binding.stream
                            ))
                            .into());
                        }
                    }

                    let plan = state.plan_commit(&checkpoint)?;
                    self.flush(binding, buffer).await?;

                    if let Some(durable) = &plan.checkpoint {
                        self.store.persist(&session.key_for(binding), durable).await?;
                        session.record_checkpoint(binding, durable);
                        debug!(cursor = ?durable.cursor, records = durable.records, "Checkpoint persisted");
                    } else if plan.regressed {
                        warn!(
                            cursor = ?checkpoint.cursor,
                            bound = ?state.bound(),
                            "Checkpoint cursor moved backwards, keeping previous checkpoint"
                        );
                    }
                    state.committed(plan)?;
                },
                Some(Err(e)) => return Err(e.into()),
                None => {
                    self.flush(binding, buffer).await?;
                    state.complete()?;
                    return Ok(());
                },
            }
        }
    }

    /// Drop checkpoints left behind by earlier backfills of this binding
    async fn clear_superseded(&self, key: &CheckpointKey) -> Result<()> {
        for (old, _) in self.store.list(Some(&key.capture)).await? {
            if key.supersedes(&old) && self.store.clear(&old).await? {
                info!(backfill = key.backfill, previous = old.backfill, "Discarded checkpoint of earlier backfill");
            }
        }
        Ok(())
    }

    async fn flush(&self, binding: &ResolvedBinding, buffer: &mut Vec<Value>) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        self.sink.commit(&binding.target, buffer).await?;
        debug!(documents = buffer.len(), "Committed documents");
        buffer.clear();
        Ok(())
    }
}
