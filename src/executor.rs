//! One worker per render: spawn, feed, collect, and always reap.

use crate::cancel::CancelSignal;
use crate::config::ExecutorConfig;
use crate::confinement::{AccessPlan, Confinement, WorkerLimits};
use crate::engine::{EngineCapabilities, RenderEngine, RenderJob};
use crate::errors::{Result, SandboxError};
use crate::extractor::extract_elements;
use crate::harness::{parse_response, WorkerDataset, WorkerRequest, WorkerResponse, WorkerStatus, WORKER_HARNESS};
use crate::policy::ValidationPolicy;
use crate::types::{ExecutionOptions, ExecutionResult, ExecutionStatus, ImageFormat};
use crate::workspace::IsolatedWorkspace;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const STDERR_TAIL_BYTES: usize = 8 * 1024;
const MB: u64 = 1024 * 1024;

/// Decrements the live-worker count once the worker has been reaped.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(live)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Collected {
    stdout: Vec<u8>,
    stderr_tail: String,
    status: Option<ExitStatus>,
    overflowed: bool,
}

enum Outcome {
    Finished(Result<Collected>),
    TimedOut,
    Cancelled,
}

/// Executes sanitized code in fresh, confined Python workers
#[derive(Debug)]
pub struct SandboxExecutor {
    config: ExecutorConfig,
    python: PathBuf,
    allowed_modules: Vec<String>,
    denied_submodules: Vec<String>,
    spawned: AtomicU64,
    live: Arc<AtomicUsize>,
}

impl SandboxExecutor {
    /// Create an executor; the guarded import inside workers mirrors `policy`.
    pub fn new(config: ExecutorConfig, policy: &ValidationPolicy) -> Result<Self> {
        let python = config.resolve_python()?;
        std::fs::create_dir_all(&config.workspace_base)?;
        info!(
            "[SANDBOX] Executor ready (python={:?}, confinement={}, network_isolation={})",
            python, config.confine_filesystem, config.isolate_network
        );
        Ok(Self {
            config,
            python,
            allowed_modules: policy.allowed_modules.iter().cloned().collect(),
            denied_submodules: policy.denied_submodules.clone(),
            spawned: AtomicU64::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn python_path(&self) -> &PathBuf {
        &self.python
    }

    /// Run `job` in a new worker. Internal failures are reported as
    /// `internal_error`, never returned.
    pub async fn execute(&self, job: &RenderJob, cancel: CancelSignal) -> ExecutionResult {
        let started = Instant::now();
        let result = match self.run(job, cancel).await {
            Ok(result) => result,
            Err(e) => {
                error!("[SANDBOX] Internal error for {}: {}", job.submission_id, e);
                ExecutionResult::failure(ExecutionStatus::InternalError, e.to_string())
            }
        };
        let result = result.with_wall_time(started.elapsed());
        info!(
            submission = %job.submission_id,
            status = result.status.as_str(),
            wall_time_ms = result.wall_time_ms,
            "[SANDBOX] Worker finished"
        );
        result
    }

    async fn run(&self, job: &RenderJob, mut cancel: CancelSignal) -> Result<ExecutionResult> {
        let format = self.config.image_format;
        let mut workspace = IsolatedWorkspace::new(&self.config.workspace_base)?;
        if self.config.keep_workspaces {
            workspace.keep();
        }

        let request = WorkerRequest {
            code: job.source.clone(),
            datasets: job
                .datasets
                .iter()
                .map(|d| WorkerDataset {
                    alias: d.alias.clone(),
                    path: d.handle.path.clone(),
                    format: d.handle.format,
                })
                .collect(),
            injected_imports: job.injected_imports.clone(),
            allowed_modules: self.allowed_modules.clone(),
            denied_submodules: self.denied_submodules.clone(),
            artifact_path: workspace.artifact_path(format),
            format,
            dpi: self.config.dpi,
            tight_bbox: self.config.tight_bbox,
            enforce_style: job.options.enforce_style_policy,
        };
        let mut payload = serde_json::to_vec(&request)?;
        payload.push(b'\n');

        let limits = WorkerLimits::for_run(&self.config, &job.options);
        let dataset_paths: Vec<PathBuf> = job.datasets.iter().map(|d| d.handle.path.clone()).collect();
        let plan = self
            .config
            .confine_filesystem
            .then(|| AccessPlan::build(&self.config, &self.python, workspace.path(), &dataset_paths));
        let confinement = Confinement::prepare(&self.config, limits, plan.as_ref())?;

        let mut cmd = self.command(&workspace);
        confinement.apply(&mut cmd);

        let mut child = cmd.spawn()?;
        let deadline = Instant::now() + job.options.timeout();
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let _live = LiveGuard::new(self.live.clone());
        debug!("[SANDBOX] Spawned worker pid={:?} for {}", child.id(), job.submission_id);

        let outcome = {
            let io = collect(&mut child, payload, self.config.max_output_bytes);
            tokio::pin!(io);
            tokio::select! {
                res = &mut io => Outcome::Finished(res),
                _ = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
                _ = cancel.cancelled() => Outcome::Cancelled,
            }
        };

        let result = match outcome {
            Outcome::Finished(Ok(collected)) if collected.overflowed => {
                terminate(&mut child).await;
                ExecutionResult::failure(
                    ExecutionStatus::ResourceExceeded,
                    format!("worker output exceeded {} bytes", self.config.max_output_bytes),
                )
            }
            Outcome::Finished(Ok(collected)) => classify(collected, &job.options, format),
            Outcome::Finished(Err(e)) => {
                terminate(&mut child).await;
                return Err(e);
            }
            Outcome::TimedOut => {
                terminate(&mut child).await;
                warn!(
                    "[SANDBOX] Worker for {} exceeded {}s and was killed",
                    job.submission_id, job.options.timeout_seconds
                );
                ExecutionResult::failure(
                    ExecutionStatus::Timeout,
                    format!(
                        "execution exceeded the {}s wall-clock limit",
                        job.options.timeout().as_secs()
                    ),
                )
            }
            Outcome::Cancelled => {
                terminate(&mut child).await;
                info!("[SANDBOX] Worker for {} cancelled", job.submission_id);
                ExecutionResult::failure(ExecutionStatus::Cancelled, "execution cancelled")
            }
        };

        Ok(result.with_submission(job.submission_id))
    }

    fn command(&self, workspace: &IsolatedWorkspace) -> Command {
        let threads = self.config.max_threads.max(1).to_string();
        let mut cmd = Command::new(&self.python);
        cmd.arg("-B")
            .arg("-c")
            .arg(WORKER_HARNESS)
            .current_dir(workspace.path())
            .env_clear()
            .env("HOME", workspace.home_dir())
            .env("TMPDIR", workspace.path())
            .env("MPLCONFIGDIR", workspace.mpl_config_dir())
            .env("MPLBACKEND", "Agg")
            .env("PATH", "/usr/bin:/bin")
            .env("LANG", "C.UTF-8")
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONNOUSERSITE", "1")
            .env("OMP_NUM_THREADS", &threads)
            .env("OPENBLAS_NUM_THREADS", &threads)
            .env("MKL_NUM_THREADS", &threads)
            .env("NUMEXPR_NUM_THREADS", &threads)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !self.config.python_path_entries.is_empty() {
            match std::env::join_paths(&self.config.python_path_entries) {
                Ok(joined) => {
                    cmd.env("PYTHONPATH", joined);
                }
                Err(e) => warn!("[SANDBOX] Ignoring unusable PYTHONPATH entries: {}", e),
            }
        }

        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

#[async_trait]
impl RenderEngine for SandboxExecutor {
    async fn render(&self, job: &RenderJob, cancel: CancelSignal) -> ExecutionResult {
        self.execute(job, cancel).await
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            name: "Sandboxed Python worker".to_string(),
            interpreter: self.python.display().to_string(),
            filesystem_confinement: self.config.confine_filesystem && cfg!(target_os = "linux"),
            network_isolation: self.config.isolate_network && cfg!(target_os = "linux"),
            memory_caps: cfg!(all(unix, not(target_os = "macos"))),
        }
    }

    fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

/// Feed the request, drain both pipes and wait for exit. Stops early if the
/// worker writes more than `max_output` bytes.
async fn collect(child: &mut Child, payload: Vec<u8>, max_output: usize) -> Result<Collected> {
    let stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Protocol("worker stdout not captured".to_string()))?;
    let stderr = child.stderr.take();

    // A worker that dies early closes its stdin; the exit status explains why.
    let writer = tokio::spawn(async move {
        if let Some(mut stdin) = stdin {
            let _ = stdin.write_all(&payload).await;
            let _ = stdin.shutdown().await;
        }
    });
    let stderr_reader = tokio::spawn(async move {
        match stderr {
            Some(stderr) => read_tail(stderr, STDERR_TAIL_BYTES).await,
            None => String::new(),
        }
    });

    let mut buf = Vec::new();
    stdout.take(max_output as u64 + 1).read_to_end(&mut buf).await?;
    if buf.len() > max_output {
        writer.abort();
        stderr_reader.abort();
        return Ok(Collected {
            stdout: buf,
            stderr_tail: String::new(),
            status: None,
            overflowed: true,
        });
    }

    let status = child.wait().await?;
    let _ = writer.await;
    let stderr_tail = stderr_reader.await.unwrap_or_default();

    Ok(Collected {
        stdout: buf,
        stderr_tail,
        status: Some(status),
        overflowed: false,
    })
}

async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, keep: usize) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > keep {
                    tail.drain(..tail.len() - keep);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

/// Kill the worker's whole process group and reap it.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!("[SANDBOX] killpg({}) failed: {}", pid, e);
        }
    }
    let _ = child.start_kill();
    match child.wait().await {
        Ok(status) => debug!("[SANDBOX] Worker reaped: {}", status),
        Err(e) => warn!("[SANDBOX] Failed to reap worker: {}", e),
    }
}

fn classify(collected: Collected, options: &ExecutionOptions, format: ImageFormat) -> ExecutionResult {
    match parse_response(&collected.stdout) {
        Ok(response) => from_response(response, options, format),
        Err(e) => from_exit(&collected, options, e),
    }
}

fn from_response(response: WorkerResponse, options: &ExecutionOptions, format: ImageFormat) -> ExecutionResult {
    if let Some(output) = response.output.as_deref().filter(|o| !o.is_empty()) {
        debug!("[SANDBOX] Submission printed {} bytes", output.len());
    }

    if response.status != WorkerStatus::Success && response.is_memory_error() && options.has_memory_cap() {
        return ExecutionResult::failure(
            ExecutionStatus::ResourceExceeded,
            format!(
                "memory cap of {} MB exceeded ({})",
                options.memory_cap_bytes / MB,
                response.describe_error()
            ),
        );
    }

    match response.status {
        WorkerStatus::Success => {
            let artifact = response
                .artifact
                .as_deref()
                .and_then(|encoded| STANDARD.decode(encoded).ok())
                .filter(|bytes| !bytes.is_empty());
            let Some(artifact) = artifact else {
                error!("[SANDBOX] Worker reported success without a usable artifact");
                return ExecutionResult::failure(
                    ExecutionStatus::InternalError,
                    "worker reported success without a usable artifact",
                );
            };
            let elements = response.figure.as_ref().map(extract_elements).unwrap_or_default();
            let mut result = ExecutionResult::success(artifact, format, elements);
            result.warnings = response.warnings;
            result
        }
        WorkerStatus::RuntimeError => {
            ExecutionResult::failure(ExecutionStatus::RuntimeError, response.describe_error())
        }
        WorkerStatus::SyntaxError => {
            ExecutionResult::failure(ExecutionStatus::SyntaxError, response.describe_error())
        }
        WorkerStatus::SetupError => {
            error!(
                "[SANDBOX] Worker setup failed in phase {:?}: {}",
                response.phase,
                response.describe_error()
            );
            ExecutionResult::failure(
                ExecutionStatus::InternalError,
                format!("worker setup failed: {}", response.describe_error()),
            )
        }
    }
}

/// No usable response: decide from how the worker died.
fn from_exit(collected: &Collected, options: &ExecutionOptions, cause: SandboxError) -> ExecutionResult {
    #[cfg(unix)]
    if let Some(signal) = collected.status.and_then(|s| {
        use std::os::unix::process::ExitStatusExt;
        s.signal()
    }) {
        if signal == libc::SIGXCPU {
            return ExecutionResult::failure(ExecutionStatus::Timeout, "worker exceeded its CPU time limit");
        }
        if signal == libc::SIGXFSZ {
            return ExecutionResult::failure(
                ExecutionStatus::ResourceExceeded,
                "worker exceeded its file size limit",
            );
        }
        if options.has_memory_cap()
            && matches!(signal, libc::SIGKILL | libc::SIGSEGV | libc::SIGABRT | libc::SIGBUS)
        {
            return ExecutionResult::failure(
                ExecutionStatus::ResourceExceeded,
                format!(
                    "worker killed by signal {} under a {} MB memory cap",
                    signal,
                    options.memory_cap_bytes / MB
                ),
            );
        }
    }

    if options.has_memory_cap() && collected.stderr_tail.contains("MemoryError") {
        return ExecutionResult::failure(
            ExecutionStatus::ResourceExceeded,
            format!("memory cap of {} MB exceeded", options.memory_cap_bytes / MB),
        );
    }

    error!(
        "[SANDBOX] Worker channel broken: {} (exit={:?}, stderr tail={:?})",
        cause, collected.status, collected.stderr_tail
    );
    ExecutionResult::failure(
        ExecutionStatus::InternalError,
        format!("worker channel broken: {cause}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{RESULT_END, RESULT_START};

    fn collected(stdout: &str) -> Collected {
        Collected {
            stdout: stdout.as_bytes().to_vec(),
            stderr_tail: String::new(),
            status: None,
            overflowed: false,
        }
    }

    fn framed(json: &str) -> String {
        format!("{RESULT_START}\n{json}\n{RESULT_END}\n")
    }

    #[test]
    fn test_memory_error_with_cap_is_resource_exceeded() {
        let options = ExecutionOptions {
            memory_cap_bytes: 256 * MB,
            ..Default::default()
        };
        let out = framed(r#"{"status": "runtime_error", "error_type": "MemoryError", "message": ""}"#);
        let result = classify(collected(&out), &options, ImageFormat::Png);
        assert_eq!(result.status, ExecutionStatus::ResourceExceeded);
        assert!(result.diagnostic.unwrap().contains("256 MB"));
    }

    #[test]
    fn test_memory_error_without_cap_is_runtime_error() {
        let out = framed(r#"{"status": "runtime_error", "error_type": "MemoryError", "message": ""}"#);
        let result = classify(collected(&out), &ExecutionOptions::default(), ImageFormat::Png);
        assert_eq!(result.status, ExecutionStatus::RuntimeError);
    }

    #[test]
    fn test_success_decodes_artifact_and_elements() {
        let out = framed(
            r#"{"status": "success", "artifact": "iVBORw0KGgo=", "warnings": ["UserWarning: tight"],
                "figure": {"canvas": {"x0": 0, "y0": 0, "x1": 100, "y1": 100},
                           "texts": [{"kind": "title", "text": "T", "extent": {"x0": 40, "y0": 90, "x1": 60, "y1": 98}, "axes_index": 0}]}}"#,
        );
        let result = classify(collected(&out), &ExecutionOptions::default(), ImageFormat::Png);
        assert!(result.is_success());
        assert_eq!(result.artifact.as_deref().unwrap()[..4], [0x89, b'P', b'N', b'G']);
        assert_eq!(result.elements.len(), 1);
        assert_eq!(result.warnings, vec!["UserWarning: tight".to_string()]);
        assert!(result.diagnostic.is_none());
    }

    #[test]
    fn test_success_without_artifact_is_internal() {
        let out = framed(r#"{"status": "success"}"#);
        let result = classify(collected(&out), &ExecutionOptions::default(), ImageFormat::Png);
        assert_eq!(result.status, ExecutionStatus::InternalError);
    }

    #[test]
    fn test_garbage_output_is_internal() {
        let result = classify(collected("Fatal Python error"), &ExecutionOptions::default(), ImageFormat::Png);
        assert_eq!(result.status, ExecutionStatus::InternalError);
        assert!(result.artifact.is_none());
    }

    #[test]
    fn test_worker_syntax_error() {
        let out = framed(r#"{"status": "syntax_error", "error_type": "SyntaxError", "message": "invalid syntax", "line": 2}"#);
        let result = classify(collected(&out), &ExecutionOptions::default(), ImageFormat::Png);
        assert_eq!(result.status, ExecutionStatus::SyntaxError);
        assert_eq!(result.diagnostic.as_deref(), Some("SyntaxError: invalid syntax (line 2)"));
    }
}
