//! The PREFLIGHT stage: input validation and sandbox preparation.
//!
//! Runs only when the pipeline carries a setup configuration. In order:
//!
//! 1. resolve the setup block for the submission's language (a
//!    per-language configuration with no matching entry contributes no
//!    required files or commands),
//! 2. verify every required file exists in the submission,
//! 3. when the template requires a sandbox: acquire one from the pool,
//!    copy the submission files in, and run the setup commands
//!    sequentially, failing on the first non-zero exit.
//!
//! The acquired handle is stored on the execution's sandbox slot
//! *before* any command runs, so the orchestrator's finalization path
//! releases it no matter how the stage ends.

use tracing::debug;

use super::{ErrorDetails, Pipeline, StageData, StageFailure};
use crate::config::SetupConfig;
use crate::sandbox::SandboxHandle;
use crate::submission::Submission;

impl Pipeline {
    pub(crate) async fn run_preflight(
        &self,
        submission: &Submission,
        setup: &SetupConfig,
        sandbox_slot: &mut Option<SandboxHandle>,
    ) -> Result<(Option<String>, StageData), StageFailure> {
        let block = setup.resolve(submission.language);

        if let Some(block) = block {
            for file in &block.required_files {
                if !submission.contains(file) {
                    return Err(StageFailure {
                        message: format!("required file '{file}' is missing from the submission"),
                        details: ErrorDetails::RequiredFileMissing {
                            missing_file: file.clone(),
                        },
                    });
                }
            }
        }

        let mut commands_run = 0;

        if self.template.requires_sandbox() {
            let pool = self.pool.as_ref().ok_or_else(|| {
                sandbox_unavailable("template requires a sandbox but no pool is configured")
            })?;
            let language = submission.language.ok_or_else(|| {
                sandbox_unavailable("template requires a sandbox but the submission has no language tag")
            })?;

            let handle = pool
                .acquire(language)
                .await
                .map_err(|e| sandbox_unavailable(&e.to_string()))?;
            debug!(sandbox = handle.id(), "sandbox acquired for preflight");

            // From here on the orchestrator owns release, whatever happens.
            *sandbox_slot = Some(handle.clone());

            handle.copy_files(submission.files()).await.map_err(|e| {
                sandbox_unavailable(&format!("failed to copy submission files: {e}"))
            })?;

            if let Some(block) = block {
                for command in &block.setup_commands {
                    let result = handle.run_command(command.command(), None).await.map_err(
                        |e| StageFailure {
                            message: format!("setup command '{}' could not be run", command.name()),
                            details: ErrorDetails::SetupCommandFailed {
                                command_name: command.name().to_string(),
                                command: command.command().to_string(),
                                exit_code: -1,
                                stdout: String::new(),
                                stderr: e.to_string(),
                            },
                        },
                    )?;

                    if !result.success() {
                        return Err(StageFailure {
                            message: format!(
                                "setup command '{}' exited with {}",
                                command.name(),
                                result.exit_code
                            ),
                            details: ErrorDetails::SetupCommandFailed {
                                command_name: command.name().to_string(),
                                command: command.command().to_string(),
                                exit_code: result.exit_code,
                                stdout: result.stdout,
                                stderr: result.stderr,
                            },
                        });
                    }
                    commands_run += 1;
                }
            }
        }

        let required = block.map(|b| b.required_files.len()).unwrap_or(0);
        Ok((
            Some(format!(
                "{required} required file(s) present, {commands_run} setup command(s) run"
            )),
            StageData::PreflightPassed {
                sandbox: sandbox_slot.as_ref().map(|h| h.id().to_string()),
                setup_commands: commands_run,
            },
        ))
    }
}

fn sandbox_unavailable(message: &str) -> StageFailure {
    StageFailure {
        message: message.to_string(),
        details: ErrorDetails::SandboxUnavailable {
            message: message.to_string(),
        },
    }
}
