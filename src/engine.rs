use crate::cancel::CancelSignal;
use crate::datasets::DatasetHandle;
use crate::types::{ExecutionOptions, ExecutionResult, InjectedImport};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A dataset with the identifier it is bound to inside the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundDataset {
    pub alias: String,
    pub handle: DatasetHandle,
}

/// Everything a worker needs for one render. Only validated, sanitized
/// source ever ends up here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderJob {
    pub submission_id: Uuid,
    pub source: String,
    pub datasets: Vec<BoundDataset>,
    pub injected_imports: Vec<InjectedImport>,
    pub options: ExecutionOptions,
}

impl RenderJob {
    pub fn new(source: impl Into<String>, options: ExecutionOptions) -> Self {
        Self {
            submission_id: Uuid::new_v4(),
            source: source.into(),
            datasets: Vec::new(),
            injected_imports: Vec::new(),
            options,
        }
    }
}

/// Capabilities of a render engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineCapabilities {
    /// Engine name
    pub name: String,
    /// Interpreter the workers run
    pub interpreter: String,
    /// Worker filesystem view is restricted
    pub filesystem_confinement: bool,
    /// Workers are moved into a private network namespace when permitted
    pub network_isolation: bool,
    /// Memory caps are enforced by the OS
    pub memory_caps: bool,
}

/// Runs render jobs in isolated workers
#[async_trait]
pub trait RenderEngine: Send + Sync {
    /// Run one job to completion, timeout or cancellation. Never fails;
    /// every outcome is an `ExecutionResult`.
    async fn render(&self, job: &RenderJob, cancel: CancelSignal) -> ExecutionResult;

    fn capabilities(&self) -> EngineCapabilities;

    /// Workers spawned since creation
    fn spawn_count(&self) -> u64;

    /// Workers currently alive (spawned and not yet reaped)
    fn live_workers(&self) -> usize;
}
