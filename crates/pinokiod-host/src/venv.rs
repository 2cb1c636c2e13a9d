//! Per-app isolated interpreter environments, rooted under `venvs/<appId>`.
//! Activation is performed by the shell runner via env injection; this
//! module only creates and destroys the trees.

use crate::cancel::CancelToken;
use crate::platform::which;
use pinokiod_core::{HostError, HostResult, VenvHandle, VenvKind};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

pub struct VenvManager {
    venvs_root: PathBuf,
}

impl VenvManager {
    pub fn new(venvs_root: PathBuf) -> Self {
        Self { venvs_root }
    }

    pub fn root(&self) -> &Path {
        &self.venvs_root
    }

    /// Where a named environment for `app_id` lives.
    pub fn path_for(&self, app_id: &str, name: &str) -> PathBuf {
        self.venvs_root.join(app_id).join(name)
    }

    /// Create the environment if it does not exist yet; idempotent.
    pub async fn ensure(
        &self,
        path: &Path,
        kind: VenvKind,
        cancel: &CancelToken,
    ) -> HostResult<VenvHandle> {
        cancel.check()?;
        let handle = VenvHandle {
            path: path.to_path_buf(),
            kind,
        };
        let marker = match kind {
            VenvKind::Python => path.join("bin"),
            VenvKind::Node => path.join("node_modules"),
        };
        if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
            return Ok(handle);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(HostError::io)?;
        }
        match kind {
            VenvKind::Python => self.create_python(path).await?,
            VenvKind::Node => {
                // Node "environments" are just a local node_modules root;
                // npm installs into it when given a prefix.
                tokio::fs::create_dir_all(path.join("node_modules"))
                    .await
                    .map_err(HostError::io)?;
            }
        }
        tracing::info!(path = %path.display(), kind = ?kind, "virtual environment ready");
        Ok(handle)
    }

    async fn create_python(&self, path: &Path) -> HostResult<()> {
        let python = which("python3")
            .or_else(|| which("python"))
            .ok_or_else(|| HostError::VenvFailed {
                reason: "no python interpreter on PATH".into(),
            })?;
        let output = Command::new(&python)
            .arg("-m")
            .arg("venv")
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(HostError::io)?;
        if !output.status.success() {
            return Err(HostError::VenvFailed {
                reason: format!(
                    "python -m venv exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }

    /// Remove every environment belonging to `app_id`.
    pub async fn remove_all(&self, app_id: &str) -> HostResult<()> {
        let dir = self.venvs_root.join(app_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(HostError::io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn node_env_is_a_local_modules_root() {
        let tmp = TempDir::new().unwrap();
        let manager = VenvManager::new(tmp.path().join("venvs"));
        let path = manager.path_for("hello", "env");
        let handle = manager
            .ensure(&path, VenvKind::Node, &CancelToken::never())
            .await
            .unwrap();
        assert!(handle.path.join("node_modules").is_dir());
        // Second ensure is a no-op.
        manager
            .ensure(&path, VenvKind::Node, &CancelToken::never())
            .await
            .unwrap();
        manager.remove_all("hello").await.unwrap();
        assert!(!path.exists());
        manager.remove_all("hello").await.unwrap();
    }

    #[tokio::test]
    async fn python_env_creates_bin_dir() {
        if which("python3").is_none() && which("python").is_none() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let manager = VenvManager::new(tmp.path().join("venvs"));
        let path = manager.path_for("hello", "env");
        let handle = manager
            .ensure(&path, VenvKind::Python, &CancelToken::never())
            .await
            .unwrap();
        assert!(handle.path.join("bin").is_dir());
    }
}
