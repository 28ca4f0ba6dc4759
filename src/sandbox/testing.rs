//! In-memory sandbox doubles shared by unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Language;
use crate::sandbox::{ExecResult, Sandbox, SandboxError, SandboxProvisioner, SandboxResult};

/// A scriptable in-memory sandbox.
///
/// Commands succeed with empty output unless a response was registered
/// via [`FakeSandbox::respond`]. Copied files land in `files` and can be
/// read back through `read_file`.
pub(crate) struct FakeSandbox {
    id: String,
    pub files: Mutex<BTreeMap<String, Vec<u8>>>,
    pub commands: Mutex<Vec<String>>,
    responses: Mutex<HashMap<String, ExecResult>>,
    pub cleanup_calls: AtomicUsize,
    pub fail_cleanup: AtomicBool,
    pub terminated: AtomicBool,
    /// Simulated execution time per command, driven by the tokio clock.
    pub command_delay: Mutex<Option<Duration>>,
}

impl FakeSandbox {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            files: Mutex::new(BTreeMap::new()),
            commands: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            cleanup_calls: AtomicUsize::new(0),
            fail_cleanup: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            command_delay: Mutex::new(None),
        })
    }

    pub fn respond(&self, command: &str, exit_code: i32, stdout: &str, stderr: &str) {
        self.responses.lock().unwrap().insert(
            command.to_string(),
            ExecResult {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                duration: Duration::ZERO,
            },
        );
    }

    pub fn command_log(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// Newtype so tests can keep an `Arc<FakeSandbox>` for assertions while
/// the pool owns the boxed trait object.
pub(crate) struct SharedFake(pub Arc<FakeSandbox>);

#[async_trait]
impl Sandbox for SharedFake {
    fn id(&self) -> &str {
        &self.0.id
    }

    async fn copy_files(&self, files: &BTreeMap<String, Vec<u8>>) -> SandboxResult<()> {
        if self.0.is_terminated() {
            return Err(SandboxError::Destroyed(self.0.id.clone()));
        }
        self.0.files.lock().unwrap().extend(files.clone());
        Ok(())
    }

    async fn run_command(&self, command: &str, _stdin: Option<&str>) -> SandboxResult<ExecResult> {
        if self.0.is_terminated() {
            return Err(SandboxError::Destroyed(self.0.id.clone()));
        }
        let delay = *self.0.command_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.0.is_terminated() {
            return Err(SandboxError::Destroyed(self.0.id.clone()));
        }
        self.0.commands.lock().unwrap().push(command.to_string());
        Ok(self
            .0
            .responses
            .lock()
            .unwrap()
            .get(command)
            .cloned()
            .unwrap_or(ExecResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration: Duration::ZERO,
            }))
    }

    async fn read_file(&self, path: &str) -> SandboxResult<Vec<u8>> {
        self.0
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::FileNotFound(path.to_string()))
    }

    async fn cleanup(&self) -> SandboxResult<()> {
        self.0.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_cleanup.load(Ordering::SeqCst) {
            return Err(SandboxError::ExecFailed("scripted cleanup failure".into()));
        }
        self.0.files.lock().unwrap().clear();
        Ok(())
    }

    async fn terminate(&self) -> SandboxResult<()> {
        self.0.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Provisioner handing out [`FakeSandbox`] instances.
#[derive(Default)]
pub(crate) struct FakeProvisioner {
    counter: AtomicUsize,
    pub provisioned: Mutex<Vec<Arc<FakeSandbox>>>,
    pub fail: AtomicBool,
}

impl FakeProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn provisioned_count(&self) -> usize {
        self.provisioned.lock().unwrap().len()
    }

    pub fn nth(&self, index: usize) -> Arc<FakeSandbox> {
        self.provisioned.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl SandboxProvisioner for FakeProvisioner {
    async fn provision(&self, language: Language) -> SandboxResult<Box<dyn Sandbox>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SandboxError::ProvisionFailed("scripted failure".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let sandbox = FakeSandbox::new(format!("fake-{language}-{n}"));
        self.provisioned.lock().unwrap().push(sandbox.clone());
        Ok(Box::new(SharedFake(sandbox)))
    }
}
