use crate::errors::Result;
use crate::types::ImageFormat;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Per-run scratch directory. The worker's home, matplotlib config and the
/// artifact all live here; nothing else is writable for it.
#[derive(Debug)]
pub struct IsolatedWorkspace {
    path: PathBuf,
    cleanup_on_drop: bool,
}

impl IsolatedWorkspace {
    /// Create a fresh workspace under `base`
    pub fn new(base: &Path) -> Result<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        let path = base.join(&id);
        std::fs::create_dir_all(path.join("home"))?;
        std::fs::create_dir_all(path.join("output"))?;
        std::fs::create_dir_all(path.join("mplconfig"))?;
        let path = path.canonicalize()?;

        debug!("[SANDBOX] Created workspace: {:?}", path);

        Ok(Self {
            path,
            cleanup_on_drop: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn home_dir(&self) -> PathBuf {
        self.path.join("home")
    }

    pub fn mpl_config_dir(&self) -> PathBuf {
        self.path.join("mplconfig")
    }

    /// Where the worker writes the artifact
    pub fn artifact_path(&self, format: ImageFormat) -> PathBuf {
        self.path
            .join("output")
            .join(format!("figure.{}", format.extension()))
    }

    /// Keep the workspace (don't cleanup on drop)
    pub fn keep(&mut self) {
        self.cleanup_on_drop = false;
    }
}

impl Drop for IsolatedWorkspace {
    fn drop(&mut self) {
        if !self.cleanup_on_drop {
            debug!("[SANDBOX] Keeping workspace: {:?}", self.path);
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(
                "[SANDBOX] Failed to cleanup workspace {:?}: {}",
                self.path, e
            );
        } else {
            debug!("[SANDBOX] Cleaned up workspace: {:?}", self.path);
        }
    }
}
