//! OS-level limits applied to a worker between fork and exec.
//!
//! - **rlimits**: address space (the memory cap), CPU seconds, file size, core
//! - **namespaces**: a fresh user + network namespace when the kernel allows it
//! - **Landlock** (Linux 5.13+): filesystem view reduced to the system
//!   library roots, a few loader and font files from `/etc`, the interpreter
//!   prefix, the bound dataset files and the workspace; TCP bind/connect
//!   denied on 6.7+
//!
//! Everything that allocates is prepared in the parent. The closure that runs
//! in the child only makes syscalls.

use crate::config::ExecutorConfig;
use crate::errors::Result;
use crate::types::ExecutionOptions;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

const SYSTEM_READ_ROOTS: &[&str] = &["/usr", "/lib", "/lib64", "/lib32", "/bin", "/sbin", "/etc/fonts"];

/// Single files under `/etc` the loader, libc and matplotlib read
const SYSTEM_READ_FILES: &[&str] = &["/etc/ld.so.cache", "/etc/localtime", "/etc/matplotlibrc"];

/// Store-based interpreters link against sibling store paths.
const NIX_STORE: &str = "/nix/store";

/// rlimit values for one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerLimits {
    /// 0 leaves the address space unlimited
    pub memory_cap_bytes: u64,
    pub cpu_seconds: u64,
    pub max_file_bytes: u64,
    pub max_processes: Option<u64>,
}

impl WorkerLimits {
    pub fn for_run(config: &ExecutorConfig, options: &ExecutionOptions) -> Self {
        Self {
            memory_cap_bytes: options.memory_cap_bytes,
            // Backstop only; the wall-clock deadline normally fires first.
            cpu_seconds: options.timeout_seconds.max(1) + 1,
            max_file_bytes: config.max_output_bytes as u64,
            max_processes: config.max_processes,
        }
    }
}

/// Paths the worker may touch, by access level
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPlan {
    pub read_exec: Vec<PathBuf>,
    pub read_files: Vec<PathBuf>,
    pub read_write: Vec<PathBuf>,
}

impl AccessPlan {
    pub fn build(config: &ExecutorConfig, python: &Path, workspace: &Path, datasets: &[PathBuf]) -> Self {
        let mut read_exec: Vec<PathBuf> = SYSTEM_READ_ROOTS
            .iter()
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .collect();

        for prefix in interpreter_prefixes(python) {
            if prefix.starts_with(NIX_STORE) {
                push_unique(&mut read_exec, PathBuf::from(NIX_STORE));
            }
            push_unique(&mut read_exec, prefix);
        }
        for dir in python_config_dirs(Path::new("/etc")) {
            push_unique(&mut read_exec, dir);
        }
        for extra in config.extra_read_paths.iter().chain(&config.python_path_entries) {
            push_unique(&mut read_exec, extra.clone());
        }

        let mut read_files: Vec<PathBuf> = ["/dev/urandom", "/dev/random", "/dev/zero"]
            .iter()
            .chain(SYSTEM_READ_FILES)
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .collect();
        for dataset in datasets {
            push_unique(&mut read_files, dataset.clone());
        }

        Self {
            read_exec,
            read_files,
            read_write: vec![workspace.to_path_buf(), PathBuf::from("/dev/null")],
        }
    }
}

fn push_unique(paths: &mut Vec<PathBuf>, path: PathBuf) {
    if !paths.iter().any(|p| path.starts_with(p)) {
        paths.push(path);
    }
}

/// Distribution config for the interpreter (`/etc/python3.11`), which
/// `site` reads through `sitecustomize` on some systems.
fn python_config_dirs(etc: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(etc) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("python"))
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

/// `<prefix>/bin/python3` -> `<prefix>`, for both the given path and its
/// symlink target (virtualenvs point at a base interpreter elsewhere).
fn interpreter_prefixes(python: &Path) -> Vec<PathBuf> {
    let mut prefixes = Vec::new();
    let candidates = [Some(python.to_path_buf()), python.canonicalize().ok()];
    for candidate in candidates.into_iter().flatten() {
        if let Some(prefix) = candidate.parent().and_then(Path::parent) {
            if prefix != Path::new("/") && !prefixes.iter().any(|p: &PathBuf| p == prefix) {
                prefixes.push(prefix.to_path_buf());
            }
        }
    }
    prefixes
}

/// Everything needed to confine one worker.
pub struct Confinement {
    limits: WorkerLimits,
    isolate_network: bool,
    #[cfg(target_os = "linux")]
    ruleset: Option<landlock::RulesetCreated>,
}

impl std::fmt::Debug for Confinement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Confinement");
        s.field("limits", &self.limits);
        s.field("isolate_network", &self.isolate_network);
        #[cfg(target_os = "linux")]
        s.field("landlock", &self.ruleset.is_some());
        s.finish()
    }
}

impl Confinement {
    pub fn prepare(config: &ExecutorConfig, limits: WorkerLimits, plan: Option<&AccessPlan>) -> Result<Self> {
        #[cfg(target_os = "linux")]
        let ruleset = match plan {
            Some(plan) if config.confine_filesystem => Some(landlock_ruleset(plan, config.isolate_network)?),
            _ => None,
        };
        #[cfg(not(target_os = "linux"))]
        let _ = plan;

        Ok(Self {
            limits,
            isolate_network: config.isolate_network,
            #[cfg(target_os = "linux")]
            ruleset,
        })
    }

    pub fn limits(&self) -> &WorkerLimits {
        &self.limits
    }

    /// Install the confinement on `cmd`. Runs in the child after fork.
    #[cfg(unix)]
    pub fn apply(self, cmd: &mut Command) {
        let limits = self.limits;
        #[cfg(target_os = "linux")]
        let isolate_network = self.isolate_network;
        #[cfg(target_os = "linux")]
        let ruleset = std::sync::Mutex::new(self.ruleset);

        unsafe {
            cmd.pre_exec(move || {
                apply_rlimits(&limits)?;

                #[cfg(target_os = "linux")]
                {
                    if isolate_network {
                        // Best effort: fails in many containers, Landlock still
                        // denies TCP there.
                        libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET);
                    }
                    let taken = match ruleset.lock() {
                        Ok(mut guard) => guard.take(),
                        Err(_) => None,
                    };
                    if let Some(ruleset) = taken {
                        ruleset
                            .restrict_self()
                            .map_err(|_| std::io::Error::from_raw_os_error(libc::EPERM))?;
                    }
                }

                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    pub fn apply(self, _cmd: &mut Command) {
        // Only the wall-clock deadline applies here.
    }
}

#[cfg(target_os = "linux")]
fn landlock_ruleset(plan: &AccessPlan, deny_tcp: bool) -> Result<landlock::RulesetCreated> {
    use crate::errors::SandboxError;
    use landlock::{
        Access, AccessFs, AccessNet, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreatedAttr, ABI,
    };

    let abi = ABI::V4;
    let build = || -> std::result::Result<landlock::RulesetCreated, landlock::RulesetError> {
        let mut ruleset = Ruleset::default().handle_access(AccessFs::from_all(abi))?;
        if deny_tcp {
            // No port rules are added, so every bind/connect is refused.
            ruleset = ruleset.handle_access(AccessNet::from_all(abi))?;
        }
        let mut created = ruleset.create()?;

        for path in &plan.read_exec {
            if let Ok(fd) = PathFd::new(path) {
                created = created.add_rule(PathBeneath::new(fd, AccessFs::from_read(abi)))?;
            }
        }
        for path in &plan.read_files {
            if let Ok(fd) = PathFd::new(path) {
                created = created.add_rule(PathBeneath::new(fd, AccessFs::ReadFile))?;
            }
        }
        for path in &plan.read_write {
            if let Ok(fd) = PathFd::new(path) {
                let access = if path.is_dir() {
                    AccessFs::from_all(abi)
                } else {
                    AccessFs::ReadFile | AccessFs::WriteFile
                };
                created = created.add_rule(PathBeneath::new(fd, access))?;
            }
        }
        Ok(created)
    };

    let created = build().map_err(|e| SandboxError::Confinement(e.to_string()))?;
    debug!(
        "[SANDBOX] Landlock ruleset prepared ({} read/exec, {} read, {} read/write)",
        plan.read_exec.len(),
        plan.read_files.len(),
        plan.read_write.len()
    );
    Ok(created)
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type RlimitResource = libc::c_int;

/// Lower a limit, never raising it above the inherited hard limit.
#[cfg(unix)]
unsafe fn set_limit(resource: RlimitResource, soft: u64, hard: u64) -> std::io::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if libc::getrlimit(resource, &mut current) != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let hard = (hard as libc::rlim_t).min(current.rlim_max);
    let soft = (soft as libc::rlim_t).min(hard);
    let rlimit = libc::rlimit {
        rlim_cur: soft,
        rlim_max: hard,
    };
    if libc::setrlimit(resource, &rlimit) != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
unsafe fn apply_rlimits(limits: &WorkerLimits) -> std::io::Result<()> {
    // macOS doesn't enforce RLIMIT_AS, skip it
    #[cfg(not(target_os = "macos"))]
    if limits.memory_cap_bytes > 0 {
        set_limit(libc::RLIMIT_AS, limits.memory_cap_bytes, limits.memory_cap_bytes)?;
    }

    set_limit(libc::RLIMIT_CPU, limits.cpu_seconds, limits.cpu_seconds + 1)?;
    set_limit(libc::RLIMIT_FSIZE, limits.max_file_bytes, limits.max_file_bytes)?;
    set_limit(libc::RLIMIT_CORE, 0, 0)?;

    #[cfg(not(target_os = "macos"))]
    if let Some(max) = limits.max_processes {
        set_limit(libc::RLIMIT_NPROC, max, max)?;
    }

    Ok(())
}
