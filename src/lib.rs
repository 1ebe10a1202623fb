pub mod aliases;
pub mod analyzer;
pub mod cancel;
pub mod config;
pub mod confinement;
pub mod datasets;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod extractor;
pub mod harness;
pub mod orchestrator;
pub mod policy;
pub mod reply;
pub mod types;
pub mod workspace;

pub use aliases::{resolve_aliases, AliasResolver};
pub use analyzer::SafetyValidator;
pub use cancel::{CancelHandle, CancelSignal};
pub use config::{EngineConfig, ExecutorConfig, PoolConfig, PoolPolicy};
pub use datasets::{DatasetHandle, DatasetProvider, FileDatasetProvider};
pub use engine::{RenderEngine, RenderJob};
pub use errors::{Result, SandboxError};
pub use executor::SandboxExecutor;
pub use orchestrator::{HealthReport, Orchestrator};
pub use policy::ValidationPolicy;
pub use reply::AssistantReply;
pub use types::{
    AliasBinding, BoundingBox, CodeSubmission, ElementKind, ExecutionOptions, ExecutionResult, ExecutionStatus,
    ImageFormat, InteractionElement, RuleId, ValidationVerdict, Violation,
};

/// Validates and renders plotting code in a sandboxed Python worker.
///
/// Builds an [`Orchestrator`] from environment configuration for a single
/// call. Long-running callers should keep one `Orchestrator` instead, so the
/// worker pool bound applies across requests.
///
/// # Returns
/// - `Ok(ExecutionResult)` for every outcome of the code itself, including
///   rejections, runtime errors and timeouts.
/// - `Err(SandboxError)` only if the engine cannot be set up (no Python
///   interpreter, invalid configuration).
///
/// # Example
/// ```no_run
/// use plotsandbox::{render_plot, ExecutionStatus};
/// use std::path::PathBuf;
///
/// # async fn demo() -> plotsandbox::Result<()> {
/// let code = "plt.plot(df_sales['month'], df_sales['revenue'])\nplt.title('Revenue')";
/// let result = render_plot(code, &[PathBuf::from("sales.csv")]).await?;
/// if result.status == ExecutionStatus::Success {
///     println!("{} bytes, {} elements", result.artifact.unwrap().len(), result.elements.len());
/// }
/// # Ok(())
/// # }
/// ```
pub async fn render_plot(code: &str, dataset_paths: &[std::path::PathBuf]) -> Result<ExecutionResult> {
    let orchestrator = Orchestrator::from_config(EngineConfig::from_env())?;
    let options = orchestrator.default_options();
    Ok(orchestrator.run_submission(code, dataset_paths, options).await)
}
