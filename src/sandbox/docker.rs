//! Docker container sandbox implementation.
//!
//! Provisions one hardened container per sandbox. Every container runs
//! with:
//!
//! - no network access (`network_mode = "none"`),
//! - all capabilities dropped and `no-new-privileges`,
//! - capped memory, CPU, and process count,
//! - a read-only root filesystem with tmpfs working and scratch areas,
//! - an optional alternative runtime (e.g. gVisor's `runsc`) for enhanced
//!   kernel isolation, falling back to the daemon default when the
//!   runtime is unavailable.
//!
//! Containers carry a fleet label so orphans from an ungraceful shutdown
//! can be enumerated and removed on the next initialization.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions, ListContainersOptions,
    LogOutput, RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{ExecResult, Sandbox, SandboxError, SandboxProvisioner, SandboxResult};
use crate::config::{DockerSettings, Language};

/// Label identifying containers owned by this service's fleet.
const FLEET_LABEL: &str = "autograder.fleet";

/// Container working directory; tmpfs-backed and writable.
const WORKDIR: &str = "/workspace";

/// Provisions hardened Docker containers, one per sandbox.
pub struct DockerProvisioner {
    docker: Docker,
    settings: DockerSettings,
    /// Image reference per language, from the pool configuration.
    images: BTreeMap<Language, String>,
}

impl DockerProvisioner {
    /// Connects to the Docker daemon and validates it is reachable.
    ///
    /// # Errors
    ///
    /// Fails when the daemon is missing or unreachable; the service
    /// cannot run sandboxed grading without it.
    pub async fn new(
        settings: DockerSettings,
        images: BTreeMap<Language, String>,
    ) -> SandboxResult<Self> {
        let docker = match &settings.docker_host {
            Some(host) => Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| SandboxError::ProvisionFailed(e.to_string()))?,
            None => Docker::connect_with_local_defaults()
                .map_err(|e| SandboxError::ProvisionFailed(e.to_string()))?,
        };

        docker
            .ping()
            .await
            .map_err(|e| SandboxError::ProvisionFailed(format!("Docker daemon unreachable: {e}")))?;

        Ok(Self {
            docker,
            settings,
            images,
        })
    }

    fn host_config(&self, runtime: Option<String>) -> bollard::models::HostConfig {
        let mut tmpfs = HashMap::new();
        tmpfs.insert(WORKDIR.to_string(), "rw,noexec,nosuid,size=64m".to_string());
        tmpfs.insert("/tmp".to_string(), "rw,noexec,nosuid,size=16m".to_string());

        bollard::models::HostConfig {
            network_mode: Some("none".to_string()),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            memory: Some(self.settings.memory_limit),
            memory_swap: Some(self.settings.memory_limit),
            // CPU period in microseconds; quota = cpu_limit * period.
            cpu_period: Some(100_000),
            cpu_quota: Some((self.settings.cpu_limit * 100_000.0) as i64),
            pids_limit: Some(self.settings.pids_limit),
            readonly_rootfs: Some(true),
            tmpfs: Some(tmpfs),
            runtime,
            ..Default::default()
        }
    }

    async fn create_container(
        &self,
        name: &str,
        image: &str,
        runtime: Option<String>,
    ) -> Result<String, bollard::errors::Error> {
        let mut labels = HashMap::new();
        labels.insert(FLEET_LABEL.to_string(), "1".to_string());

        let config = ContainerConfig {
            image: Some(image.to_string()),
            labels: Some(labels),
            working_dir: Some(WORKDIR.to_string()),
            host_config: Some(self.host_config(runtime)),
            // Keep the container alive between exec sessions.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name,
            platform: None,
        };

        let response = self.docker.create_container(Some(options), config).await?;
        Ok(response.id)
    }
}

#[async_trait]
impl SandboxProvisioner for DockerProvisioner {
    async fn provision(&self, language: Language) -> SandboxResult<Box<dyn Sandbox>> {
        let image = self.images.get(&language).ok_or_else(|| {
            SandboxError::ProvisionFailed(format!("no image configured for {language}"))
        })?;

        let name = format!("autograder-{}-{}", language, uuid::Uuid::new_v4());

        // Prefer the isolation runtime; fall back to the daemon default
        // when it is not installed.
        let container_id = match self
            .create_container(&name, image, self.settings.runtime.clone())
            .await
        {
            Ok(id) => id,
            Err(e) if self.settings.runtime.is_some() => {
                warn!(
                    runtime = self.settings.runtime.as_deref(),
                    "isolation runtime unavailable, falling back to default: {e}"
                );
                self.create_container(&name, image, None)
                    .await
                    .map_err(|e| SandboxError::ProvisionFailed(e.to_string()))?
            }
            Err(e) => return Err(SandboxError::ProvisionFailed(e.to_string())),
        };

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::ProvisionFailed(e.to_string()))?;

        debug!(container = %name, language = %language, "container provisioned");

        Ok(Box::new(DockerSandbox {
            id: name,
            container_id,
            docker: self.docker.clone(),
        }))
    }

    async fn cleanup_orphans(&self) -> SandboxResult<usize> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![FLEET_LABEL.to_string()]);

        let orphans = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| SandboxError::ProvisionFailed(e.to_string()))?;

        let mut removed = 0;
        for container in orphans {
            let Some(id) = container.id else { continue };
            match self
                .docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                Ok(()) => removed += 1,
                Err(e) => warn!(container = %id, "failed to remove orphaned container: {e}"),
            }
        }
        Ok(removed)
    }
}

/// A sandbox backed by a running Docker container.
pub struct DockerSandbox {
    id: String,
    container_id: String,
    docker: Docker,
}

impl DockerSandbox {
    async fn exec(
        &self,
        cmd: Vec<String>,
        stdin: Option<&str>,
    ) -> SandboxResult<ExecResult> {
        let start = Instant::now();

        let exec_options = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdin: Some(stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(WORKDIR.to_string()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&self.container_id, exec_options)
            .await
            .map_err(|e| exec_error(e))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| exec_error(e))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, mut input } = started {
            if let Some(data) = stdin {
                if let Err(e) = input.write_all(data.as_bytes()).await {
                    return Err(SandboxError::ExecFailed(format!("failed to write stdin: {e}")));
                }
                let _ = input.shutdown().await;
            }
            drop(input);

            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(exec_error(e)),
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| exec_error(e))?;

        Ok(ExecResult {
            exit_code: inspect.exit_code.unwrap_or(-1) as i32,
            stdout,
            stderr,
            duration: start.elapsed(),
        })
    }
}

/// Maps a bollard error, detecting the container-gone case so callers can
/// tell a sweeper kill apart from transport failures.
fn exec_error(e: bollard::errors::Error) -> SandboxError {
    match &e {
        bollard::errors::Error::DockerResponseServerError { status_code: 404, message } => {
            SandboxError::Destroyed(message.clone())
        }
        bollard::errors::Error::DockerResponseServerError { status_code: 409, message } => {
            SandboxError::Destroyed(message.clone())
        }
        _ => SandboxError::ExecFailed(e.to_string()),
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn copy_files(&self, files: &BTreeMap<String, Vec<u8>>) -> SandboxResult<()> {
        let tar_data =
            build_tar(files).map_err(|e| SandboxError::CopyFailed(e.to_string()))?;

        self.docker
            .upload_to_container(
                &self.container_id,
                Some(UploadToContainerOptions {
                    path: WORKDIR.to_string(),
                    ..Default::default()
                }),
                tar_data.into(),
            )
            .await
            .map_err(|e| SandboxError::CopyFailed(e.to_string()))?;

        Ok(())
    }

    async fn run_command(&self, command: &str, stdin: Option<&str>) -> SandboxResult<ExecResult> {
        let cmd = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ];
        self.exec(cmd, stdin).await
    }

    async fn read_file(&self, path: &str) -> SandboxResult<Vec<u8>> {
        let full = format!("{WORKDIR}/{path}");
        let mut stream = self.docker.download_from_container(
            &self.container_id,
            Some(DownloadFromContainerOptions { path: full }),
        );

        let mut tar_data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                    SandboxError::FileNotFound(path.to_string())
                }
                other => SandboxError::ExecFailed(other.to_string()),
            })?;
            tar_data.extend_from_slice(&chunk);
        }

        extract_single_file(&tar_data)
            .ok_or_else(|| SandboxError::FileNotFound(path.to_string()))
    }

    async fn cleanup(&self) -> SandboxResult<()> {
        let result = self
            .run_command("find /workspace -mindepth 1 -delete", None)
            .await?;
        if !result.success() {
            return Err(SandboxError::ExecFailed(format!(
                "workspace reset exited with {}: {}",
                result.exit_code, result.stderr
            )));
        }
        Ok(())
    }

    async fn terminate(&self) -> SandboxResult<()> {
        match self
            .docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already gone; terminate is idempotent.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(SandboxError::ExecFailed(e.to_string())),
        }
    }
}

/// Builds an in-memory tar archive from a filename -> bytes mapping.
fn build_tar(files: &BTreeMap<String, Vec<u8>>) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());

    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        archive.append_data(&mut header, name, content.as_slice())?;
    }

    archive.into_inner()
}

/// Extracts the first regular file from a tar archive.
fn extract_single_file(data: &[u8]) -> Option<Vec<u8>> {
    use std::io::Read;

    let mut archive = tar::Archive::new(data);
    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        if entry.header().entry_type().is_file() {
            let mut content = Vec::new();
            entry.read_to_end(&mut content).ok()?;
            return Some(content);
        }
    }
    None
}
