//! Local process sandbox implementation.
//!
//! Runs submission commands as child processes in a scratch directory on
//! the host. There is no isolation: this backend exists for development
//! and for exercising sandbox-dependent templates without a Docker
//! daemon. Production deployments use [`super::docker`].
//!
//! | Feature | Support |
//! |---------|---------|
//! | Isolation | None (shared filesystem and network) |
//! | Resource limits | Not supported |
//! | File transfer | Local copy into the scratch directory |
//! | Stdin | Supported |

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{ExecResult, Sandbox, SandboxError, SandboxProvisioner, SandboxResult};
use crate::config::Language;

/// Provisions sandboxes backed by scratch directories and child processes.
pub struct LocalProvisioner {
    root: PathBuf,
    shell: String,
}

impl LocalProvisioner {
    /// Creates a provisioner placing scratch directories under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            shell: "/bin/sh".to_string(),
        }
    }

    /// Uses the system temporary directory as the scratch root.
    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir().join("autograder-sandboxes"))
    }
}

#[async_trait]
impl SandboxProvisioner for LocalProvisioner {
    async fn provision(&self, language: Language) -> SandboxResult<Box<dyn Sandbox>> {
        let id = format!("local-{}-{}", language, uuid::Uuid::new_v4());
        let dir = self.root.join(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SandboxError::ProvisionFailed(e.to_string()))?;

        Ok(Box::new(LocalSandbox {
            id,
            dir,
            shell: self.shell.clone(),
        }))
    }
}

/// A sandbox that runs commands as local child processes.
///
/// Commands execute via `{shell} -c "{command}"` with the scratch
/// directory as the working directory. `terminate` removes the scratch
/// directory and is idempotent.
pub struct LocalSandbox {
    id: String,
    dir: PathBuf,
    shell: String,
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn copy_files(&self, files: &BTreeMap<String, Vec<u8>>) -> SandboxResult<()> {
        for (name, content) in files {
            let dest = self.dir.join(name);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SandboxError::CopyFailed(e.to_string()))?;
            }
            tokio::fs::write(&dest, content)
                .await
                .map_err(|e| SandboxError::CopyFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn run_command(&self, command: &str, stdin: Option<&str>) -> SandboxResult<ExecResult> {
        if !self.dir.exists() {
            return Err(SandboxError::Destroyed(self.id.clone()));
        }

        let start = Instant::now();

        let mut process = tokio::process::Command::new(&self.shell);
        process
            .arg("-c")
            .arg(command)
            .current_dir(&self.dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = process
            .spawn()
            .map_err(|e| SandboxError::ExecFailed(e.to_string()))?;

        if let Some(input) = stdin {
            let mut handle = child
                .stdin
                .take()
                .ok_or_else(|| SandboxError::ExecFailed("stdin not captured".to_string()))?;
            handle
                .write_all(input.as_bytes())
                .await
                .map_err(|e| SandboxError::ExecFailed(e.to_string()))?;
            // Dropping closes the pipe so the child sees EOF.
        } else {
            drop(child.stdin.take());
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SandboxError::ExecFailed(e.to_string()))?;

        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        })
    }

    async fn read_file(&self, path: &str) -> SandboxResult<Vec<u8>> {
        let full = self.dir.join(path);
        tokio::fs::read(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SandboxError::FileNotFound(path.to_string())
            } else {
                SandboxError::Io(e)
            }
        })
    }

    async fn cleanup(&self) -> SandboxResult<()> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    async fn terminate(&self) -> SandboxResult<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::Io(e)),
        }
    }
}
