//! Sandbox abstractions for executing untrusted student code.
//!
//! This module defines the seam between the grading core and the execution
//! backends. Two traits make it pluggable:
//!
//! - [`Sandbox`] - an isolated execution environment (copy files in, run
//!   commands, read artifacts back)
//! - [`SandboxProvisioner`] - factory creating sandboxes for a language
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SandboxProvisioner                        │
//! │  provision(language) ──────────► Box<dyn Sandbox>           │
//! │  cleanup_orphans()                    │                     │
//! └───────────────────────────────────────┼─────────────────────┘
//!                                         ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Sandbox                               │
//! │  copy_files(mapping)                                         │
//! │  run_command(cmd, stdin) ──► ExecResult                     │
//! │  read_file(path) ──────────► bytes                          │
//! │  cleanup()        - reset working area (pool, on release)   │
//! │  terminate()      - destroy the environment                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Pipelines never hold a `Box<dyn Sandbox>` directly; they hold a
//! [`SandboxHandle`], a cloneable wrapper that tracks lifecycle state and
//! last activity. The pool keeps a clone of every active handle so the
//! background sweeper can forcibly destroy an environment whose running
//! TTL expired while a pipeline still owns it - the owner then observes
//! the broken handle on its next command.

pub mod docker;
pub mod local;
pub mod pool;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::Language;

/// Result type for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors that can occur while provisioning or driving a sandbox.
///
/// A command that runs but exits non-zero is NOT an error; it is a normal
/// [`ExecResult`]. Errors mean the operation itself could not be carried
/// out (daemon unreachable, container gone, timeout).
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Failed to create a new sandbox environment.
    #[error("Failed to provision sandbox: {0}")]
    ProvisionFailed(String),

    /// Failed to start or communicate with a command.
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    /// Failed to write submission files into the sandbox.
    #[error("Failed to copy files into sandbox: {0}")]
    CopyFailed(String),

    /// A requested artifact does not exist in the sandbox.
    #[error("File not found in sandbox: {0}")]
    FileNotFound(String),

    /// The sandbox environment no longer exists.
    ///
    /// Typically observed after the sweeper destroyed an over-TTL
    /// container out from under its owner.
    #[error("Sandbox destroyed: {0}")]
    Destroyed(String),

    /// The operation exceeded its time bound.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result of running a command inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code; 0 is success by convention.
    pub exit_code: i32,

    pub stdout: String,
    pub stderr: String,

    /// Wall-clock execution time.
    pub duration: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Lifecycle state of a pooled sandbox.
///
/// ```text
///   idle ──acquire──► active ──release──► idle
///     │                  │
///     └──── destroy ─────┴──► destroyed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Owned by the pool, ready for acquisition.
    Idle,
    /// Exclusively owned by one pipeline execution.
    Active,
    /// Underlying environment removed; the handle is dead.
    Destroyed,
}

/// An isolated execution environment.
///
/// Implementations must be safe to share behind an `Arc`: the owning
/// pipeline drives commands while the pool sweeper may concurrently
/// terminate the environment.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Unique identifier, assigned at provisioning.
    fn id(&self) -> &str;

    /// Writes the given files into the sandbox working area.
    async fn copy_files(&self, files: &BTreeMap<String, Vec<u8>>) -> SandboxResult<()>;

    /// Runs a shell command to completion, optionally feeding `stdin`.
    async fn run_command(&self, command: &str, stdin: Option<&str>) -> SandboxResult<ExecResult>;

    /// Reads an artifact back from the sandbox working area.
    async fn read_file(&self, path: &str) -> SandboxResult<Vec<u8>>;

    /// Resets the working area (removes submission files and scratch).
    ///
    /// Called by the pool on release, never by test functions.
    async fn cleanup(&self) -> SandboxResult<()>;

    /// Destroys the environment and releases its resources. Idempotent.
    async fn terminate(&self) -> SandboxResult<()>;
}

/// Factory for per-language sandboxes.
#[async_trait]
pub trait SandboxProvisioner: Send + Sync {
    /// Provisions a fresh sandbox for the given language.
    async fn provision(&self, language: Language) -> SandboxResult<Box<dyn Sandbox>>;

    /// Destroys environments left behind by an ungraceful prior shutdown.
    ///
    /// Called once by the pool manager during initialization. Returns the
    /// number of environments removed.
    async fn cleanup_orphans(&self) -> SandboxResult<usize> {
        Ok(0)
    }
}

struct HandleShared {
    state: SandboxState,
    last_activity: Instant,
}

/// A cloneable, lifecycle-tracked reference to a pooled sandbox.
///
/// The pool owns idle handles and keeps a clone of active ones; a pipeline
/// execution exclusively owns the acquired clone between `acquire` and
/// `release`. Every command refreshes the last-activity timestamp the
/// sweeper uses for running-TTL enforcement, and is additionally bounded
/// by the pool's running TTL directly.
#[derive(Clone)]
pub struct SandboxHandle {
    inner: Arc<dyn Sandbox>,
    language: Language,
    created_at: Instant,
    running_ttl: Duration,
    shared: Arc<Mutex<HandleShared>>,
}

impl SandboxHandle {
    pub fn new(sandbox: Box<dyn Sandbox>, language: Language, running_ttl: Duration) -> Self {
        Self {
            inner: Arc::from(sandbox),
            language,
            created_at: Instant::now(),
            running_ttl,
            shared: Arc::new(Mutex::new(HandleShared {
                state: SandboxState::Idle,
                last_activity: Instant::now(),
            })),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn state(&self) -> SandboxState {
        self.shared.lock().expect("handle state poisoned").state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.shared
            .lock()
            .expect("handle state poisoned")
            .last_activity
    }

    /// Refreshes the last-activity timestamp.
    pub fn touch(&self) {
        self.shared.lock().expect("handle state poisoned").last_activity = Instant::now();
    }

    pub(crate) fn set_state(&self, state: SandboxState) {
        let mut shared = self.shared.lock().expect("handle state poisoned");
        shared.state = state;
        shared.last_activity = Instant::now();
    }

    /// Writes submission files into the sandbox working area.
    pub async fn copy_files(&self, files: &BTreeMap<String, Vec<u8>>) -> SandboxResult<()> {
        self.touch();
        let result = self.inner.copy_files(files).await;
        self.touch();
        result
    }

    /// Runs a shell command, bounded by the pool's running TTL.
    pub async fn run_command(
        &self,
        command: &str,
        stdin: Option<&str>,
    ) -> SandboxResult<ExecResult> {
        self.touch();
        let result = tokio::time::timeout(self.running_ttl, self.inner.run_command(command, stdin))
            .await
            .map_err(|_| {
                SandboxError::Timeout(format!(
                    "command exceeded running TTL ({}s): {command}",
                    self.running_ttl.as_secs()
                ))
            })?;
        self.touch();
        result
    }

    /// Reads an artifact back from the sandbox working area.
    pub async fn read_file(&self, path: &str) -> SandboxResult<Vec<u8>> {
        self.touch();
        self.inner.read_file(path).await
    }

    /// Resets the working area. Pool-internal; called on release.
    pub(crate) async fn cleanup(&self) -> SandboxResult<()> {
        self.inner.cleanup().await
    }

    /// Destroys the underlying environment and marks the handle dead.
    pub(crate) async fn destroy(&self) -> SandboxResult<()> {
        self.set_state(SandboxState::Destroyed);
        self.inner.terminate().await
    }
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.id())
            .field("language", &self.language)
            .field("state", &self.state())
            .finish()
    }
}
