//! Request pipeline: aliases, validation, datasets, a bounded worker pool,
//! and one execution per submission.

use crate::aliases::AliasResolver;
use crate::analyzer::SafetyValidator;
use crate::cancel::{self, CancelHandle, CancelSignal};
use crate::config::{EngineConfig, PoolPolicy};
use crate::datasets::{DatasetProvider, FileDatasetProvider};
use crate::engine::{BoundDataset, EngineCapabilities, RenderEngine, RenderJob};
use crate::errors::{Result, SandboxError};
use crate::executor::SandboxExecutor;
use crate::types::{
    AliasBinding, CodeSubmission, ExecutionOptions, ExecutionResult, ExecutionStatus, ValidationVerdict,
    ValidationWarning,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A held pool slot. Releases the permit and the active count on drop.
struct PoolSlot {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl PoolSlot {
    fn new(permit: OwnedSemaphorePermit, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self { _permit: permit, active }
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-flight runs per session. A new run for a session cancels the previous one.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inflight: DashMap<String, (u64, CancelHandle)>,
    generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run for `session`, cancelling the one it supersedes.
    pub fn begin(&self, session: &str) -> (u64, CancelSignal) {
        let (handle, signal) = cancel::pair();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((previous, old)) = self.inflight.insert(session.to_string(), (generation, handle)) {
            old.cancel();
            info!("[POOL] Run {} of session {} superseded by run {}", previous, session, generation);
        }
        (generation, signal)
    }

    /// Forget a finished run unless a newer one already replaced it.
    pub fn finish(&self, session: &str, generation: u64) {
        self.inflight.remove_if(session, |_, (current, _)| *current == generation);
    }

    /// Cancel whatever is in flight for `session`.
    pub fn cancel(&self, session: &str) -> bool {
        match self.inflight.remove(session) {
            Some((_, (_, handle))) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

/// Snapshot for health checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub engine: EngineCapabilities,
    pub max_concurrent: usize,
    pub active_slots: usize,
    pub live_workers: usize,
    pub spawned_workers: u64,
    pub sessions_in_flight: usize,
    pub pool_policy: PoolPolicy,
}

pub struct Orchestrator {
    config: EngineConfig,
    validator: SafetyValidator,
    aliases: AliasResolver,
    engine: Arc<dyn RenderEngine>,
    datasets: Arc<dyn DatasetProvider>,
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    sessions: SessionRegistry,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, engine: Arc<dyn RenderEngine>, datasets: Arc<dyn DatasetProvider>) -> Self {
        let max_concurrent = config.pool.max_concurrent.max(1);
        info!(
            "[POOL] {} worker slot(s), {}",
            max_concurrent,
            config.pool.policy.description()
        );
        Self {
            validator: SafetyValidator::new(config.policy.clone()),
            aliases: AliasResolver::new(),
            engine,
            datasets,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            active: Arc::new(AtomicUsize::new(0)),
            sessions: SessionRegistry::new(),
            config,
        }
    }

    /// Wire the sandboxed executor and local dataset files.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let executor = SandboxExecutor::new(config.executor.clone(), &config.policy)?;
        Ok(Self::new(config, Arc::new(executor), Arc::new(FileDatasetProvider::new())))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn default_options(&self) -> ExecutionOptions {
        self.config.defaults.clone()
    }

    pub fn resolve_aliases(&self, dataset_paths: &[PathBuf]) -> Vec<AliasBinding> {
        self.aliases.resolve(dataset_paths)
    }

    pub fn validate(&self, code: &str) -> Result<ValidationVerdict> {
        self.validator.validate(code)
    }

    pub async fn run_submission(
        &self,
        code: &str,
        dataset_paths: &[PathBuf],
        options: ExecutionOptions,
    ) -> ExecutionResult {
        self.run_submission_with_cancel(code, dataset_paths, options, CancelSignal::never())
            .await
    }

    pub async fn run_submission_with_cancel(
        &self,
        code: &str,
        dataset_paths: &[PathBuf],
        options: ExecutionOptions,
        cancel: CancelSignal,
    ) -> ExecutionResult {
        let bindings = self.aliases.resolve(dataset_paths);
        let submission = CodeSubmission::new(code, bindings, options);
        self.execute_submission(&submission, cancel).await
    }

    /// Run for `session`, superseding any run of that session still in flight.
    pub async fn run_latest(
        &self,
        session: &str,
        code: &str,
        dataset_paths: &[PathBuf],
        options: ExecutionOptions,
    ) -> ExecutionResult {
        let (generation, signal) = self.sessions.begin(session);
        let result = self
            .run_submission_with_cancel(code, dataset_paths, options, signal)
            .await;
        self.sessions.finish(session, generation);
        result
    }

    pub fn cancel_session(&self, session: &str) -> bool {
        self.sessions.cancel(session)
    }

    /// Run an already-built submission. Every outcome is a result.
    pub async fn execute_submission(&self, submission: &CodeSubmission, cancel: CancelSignal) -> ExecutionResult {
        let started = Instant::now();
        let result = self.pipeline(submission, cancel).await;
        let result = result
            .with_submission(submission.id())
            .with_wall_time(started.elapsed());
        info!(
            submission = %submission.id(),
            status = result.status.as_str(),
            wall_time_ms = result.wall_time_ms,
            "[POOL] Submission complete"
        );
        result
    }

    async fn pipeline(&self, submission: &CodeSubmission, mut cancel: CancelSignal) -> ExecutionResult {
        let verdict = match self.validator.validate(submission.source()) {
            Ok(verdict) => verdict,
            Err(e) => {
                error!("[VALIDATOR] Validation failed for {}: {}", submission.id(), e);
                return ExecutionResult::failure(ExecutionStatus::InternalError, e.to_string());
            }
        };

        if let Some(status) = verdict.rejection_status() {
            let summary = verdict.rejection_summary().unwrap_or_default();
            info!("[VALIDATOR] Submission {} rejected: {}", submission.id(), summary);
            return ExecutionResult::failure(status, summary).with_violations(verdict.violations);
        }
        let validation_warnings: Vec<String> = verdict.warnings.iter().map(describe_warning).collect();

        let mut datasets = Vec::with_capacity(submission.bindings().len());
        for binding in submission.bindings() {
            match self.datasets.load(&binding.path).await {
                Ok(handle) => datasets.push(BoundDataset {
                    alias: binding.alias.clone(),
                    handle,
                }),
                Err(e) => {
                    warn!("[SANDBOX] Dataset {:?} unavailable: {}", binding.path, e);
                    let reason = match e {
                        SandboxError::DatasetUnavailable(detail) => detail,
                        other => other.to_string(),
                    };
                    let mut result = ExecutionResult::failure(
                        ExecutionStatus::RuntimeError,
                        format!("dataset unavailable: {reason}"),
                    );
                    result.warnings = validation_warnings;
                    return result;
                }
            }
        }

        let job = RenderJob {
            submission_id: submission.id(),
            source: verdict.sanitized_source,
            datasets,
            injected_imports: verdict.injected_imports,
            options: submission.options().clone(),
        };

        let slot = match self.acquire_slot(&mut cancel).await {
            Ok(slot) => slot,
            Err(result) => return result,
        };
        debug!(
            "[POOL] Slot acquired for {} ({} active)",
            submission.id(),
            self.active.load(Ordering::SeqCst)
        );

        let mut result = if cancel.is_cancelled() {
            ExecutionResult::failure(ExecutionStatus::Cancelled, "execution cancelled")
        } else {
            self.engine.render(&job, cancel).await
        };
        drop(slot);

        if !validation_warnings.is_empty() {
            let mut merged = validation_warnings;
            merged.append(&mut result.warnings);
            result.warnings = merged;
        }
        result
    }

    async fn acquire_slot(&self, cancel: &mut CancelSignal) -> std::result::Result<PoolSlot, ExecutionResult> {
        match self.config.pool.policy {
            PoolPolicy::Reject => match self.permits.clone().try_acquire_owned() {
                Ok(permit) => Ok(PoolSlot::new(permit, self.active.clone())),
                Err(_) => {
                    warn!("[POOL] Saturated, rejecting submission");
                    Err(ExecutionResult::failure(
                        ExecutionStatus::ResourceExceeded,
                        "execution pool saturated",
                    ))
                }
            },
            PoolPolicy::Queue { max_wait_ms } => {
                let acquire = self.permits.clone().acquire_owned();
                let wait = async move {
                    match max_wait_ms {
                        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), acquire).await.ok(),
                        None => Some(acquire.await),
                    }
                };
                tokio::select! {
                    waited = wait => match waited {
                        Some(Ok(permit)) => Ok(PoolSlot::new(permit, self.active.clone())),
                        Some(Err(_)) => {
                            error!("[POOL] Semaphore closed");
                            Err(ExecutionResult::failure(ExecutionStatus::InternalError, "execution pool closed"))
                        }
                        None => {
                            warn!("[POOL] Gave up waiting for a slot after {:?}ms", max_wait_ms);
                            Err(ExecutionResult::failure(
                                ExecutionStatus::ResourceExceeded,
                                format!("pool wait exceeded {}ms", max_wait_ms.unwrap_or_default()),
                            ))
                        }
                    },
                    _ = cancel.cancelled() => Err(ExecutionResult::failure(
                        ExecutionStatus::Cancelled,
                        "cancelled while waiting for a worker slot",
                    )),
                }
            }
        }
    }

    pub fn active_slots(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            engine: self.engine.capabilities(),
            max_concurrent: self.config.pool.max_concurrent.max(1),
            active_slots: self.active_slots(),
            live_workers: self.engine.live_workers(),
            spawned_workers: self.engine.spawn_count(),
            sessions_in_flight: self.sessions.in_flight(),
            pool_policy: self.config.pool.policy,
        }
    }
}

fn describe_warning(warning: &ValidationWarning) -> String {
    format!("{} (line {}): {}", warning.rule.as_str(), warning.line, warning.message)
}
