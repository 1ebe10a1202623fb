use crate::errors::{Result, SandboxError};
use crate::policy::ValidationPolicy;
use crate::types::{ExecutionOptions, ImageFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// What happens when every worker slot is busy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum PoolPolicy {
    /// Wait in FIFO order for a slot, optionally bounded
    Queue {
        #[serde(default)]
        max_wait_ms: Option<u64>,
    },
    /// Fail immediately with `resource_exceeded`
    Reject,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        PoolPolicy::Queue {
            max_wait_ms: Some(30_000),
        }
    }
}

impl PoolPolicy {
    pub fn description(&self) -> &'static str {
        match self {
            PoolPolicy::Queue { max_wait_ms: None } => "queue (unbounded wait)",
            PoolPolicy::Queue { .. } => "queue (bounded wait)",
            PoolPolicy::Reject => "reject when saturated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of live workers
    pub max_concurrent: usize,
    pub policy: PoolPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            policy: PoolPolicy::default(),
        }
    }
}

/// Configuration for spawning and confining workers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Python interpreter; resolved from PATH when unset
    pub python_path: Option<PathBuf>,
    /// Base directory for per-run workspaces
    pub workspace_base: PathBuf,
    /// Artifact encoding
    pub image_format: ImageFormat,
    /// Artifact resolution
    pub dpi: u32,
    /// Crop the artifact to the drawn content
    pub tight_bbox: bool,
    /// Ceiling on the worker's response size in bytes
    pub max_output_bytes: usize,
    /// Thread count for BLAS/OpenMP inside the worker
    pub max_threads: u32,
    /// Restrict the worker's filesystem view (Linux Landlock)
    pub confine_filesystem: bool,
    /// Move the worker into a fresh network namespace when permitted
    pub isolate_network: bool,
    /// Extra read-only locations, e.g. a virtualenv outside the usual prefixes
    pub extra_read_paths: Vec<PathBuf>,
    /// Entries for the worker's PYTHONPATH
    pub python_path_entries: Vec<PathBuf>,
    /// Maximum processes for the worker's user; unset leaves the limit alone
    pub max_processes: Option<u64>,
    /// Keep workspaces on disk after the run (debugging)
    pub keep_workspaces: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            python_path: None,
            workspace_base: std::env::temp_dir().join("plotsandbox-workspaces"),
            image_format: ImageFormat::Png,
            dpi: 300,
            tight_bbox: true,
            max_output_bytes: 64 * 1024 * 1024,
            max_threads: 1,
            confine_filesystem: true,
            isolate_network: true,
            extra_read_paths: Vec::new(),
            python_path_entries: Vec::new(),
            max_processes: None,
            keep_workspaces: false,
        }
    }
}

impl ExecutorConfig {
    /// The configured interpreter, or the first `python3`/`python` on PATH.
    pub fn resolve_python(&self) -> Result<PathBuf> {
        if let Some(path) = &self.python_path {
            return Ok(path.clone());
        }
        which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| SandboxError::PythonNotFound)
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub executor: ExecutorConfig,
    pub pool: PoolConfig,
    /// Options applied when a request does not carry its own
    pub defaults: ExecutionOptions,
    pub policy: ValidationPolicy,
}

impl EngineConfig {
    /// Load a JSON config file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        Ok(config.with_env_overrides())
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        EngineConfig::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mb) = parse_var::<u64, _>(&lookup, "PLOT_EXEC_MEMORY_MB") {
            self.defaults.memory_cap_bytes = mb.saturating_mul(1024 * 1024);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "PLOT_EXEC_TIMEOUT_SECONDS") {
            self.defaults.timeout_seconds = secs.max(1);
        }
        if let Some(flag) = lookup("PLOT_ENFORCE_STYLE") {
            self.defaults.enforce_style_policy = parse_flag(&flag);
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, "PLOTSANDBOX_MAX_WORKERS") {
            self.pool.max_concurrent = n.max(1);
        }
        if let Some(policy) = lookup("PLOTSANDBOX_POOL_POLICY") {
            match policy.trim().to_ascii_lowercase().as_str() {
                "reject" => self.pool.policy = PoolPolicy::Reject,
                "queue" => {
                    if matches!(self.pool.policy, PoolPolicy::Reject) {
                        self.pool.policy = PoolPolicy::default();
                    }
                }
                other => warn!("Ignoring unknown PLOTSANDBOX_POOL_POLICY value: {}", other),
            }
        }
        if let Some(path) = lookup("PLOTSANDBOX_PYTHON").filter(|p| !p.is_empty()) {
            self.executor.python_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = lookup("PLOTSANDBOX_WORKSPACE_DIR").filter(|p| !p.is_empty()) {
            self.executor.workspace_base = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("PLOTSANDBOX_FS_CONFINEMENT") {
            self.executor.confine_filesystem = parse_flag(&flag);
        }
        if let Some(flag) = lookup("PLOTSANDBOX_NETWORK_ISOLATION") {
            self.executor.isolate_network = parse_flag(&flag);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.max_concurrent == 0 {
            return Err(SandboxError::InvalidConfig(
                "pool.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.executor.dpi == 0 {
            return Err(SandboxError::InvalidConfig("executor.dpi must be positive".to_string()));
        }
        if self.executor.max_output_bytes == 0 {
            return Err(SandboxError::InvalidConfig(
                "executor.max_output_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.defaults.timeout_seconds, 8);
        assert_eq!(config.defaults.memory_cap_bytes, 0);
        assert_eq!(config.executor.dpi, 300);
        assert_eq!(config.pool.max_concurrent, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::default().with_overrides(lookup(&[
            ("PLOT_EXEC_MEMORY_MB", "256"),
            ("PLOT_ENFORCE_STYLE", "true"),
            ("PLOTSANDBOX_MAX_WORKERS", "2"),
            ("PLOTSANDBOX_POOL_POLICY", "reject"),
            ("PLOTSANDBOX_FS_CONFINEMENT", "0"),
        ]));
        assert_eq!(config.defaults.memory_cap_bytes, 256 * 1024 * 1024);
        assert!(config.defaults.enforce_style_policy);
        assert_eq!(config.pool.max_concurrent, 2);
        assert_eq!(config.pool.policy, PoolPolicy::Reject);
        assert!(!config.executor.confine_filesystem);
    }

    #[test]
    fn test_bad_override_is_ignored() {
        let config = EngineConfig::default().with_overrides(lookup(&[("PLOT_EXEC_MEMORY_MB", "lots")]));
        assert_eq!(config.defaults.memory_cap_bytes, 0);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"pool": {"policy": {"mode": "reject"}}, "executor": {"dpi": 150}}"#).unwrap();
        assert_eq!(config.pool.policy, PoolPolicy::Reject);
        assert_eq!(config.pool.max_concurrent, 4);
        assert_eq!(config.executor.dpi, 150);
        assert_eq!(config.executor.image_format, ImageFormat::Png);
    }

    #[test]
    fn test_zero_workers_is_invalid() {
        let mut config = EngineConfig::default();
        config.pool.max_concurrent = 0;
        assert!(config.validate().is_err());
    }
}
