//! Built-in `io` template: program execution checks.
//!
//! These test functions run the submitted program inside the sandbox the
//! preflight stage prepared (files copied, setup commands run). The
//! template declares `requires_sandbox`, so the core guarantees a handle
//! is present whenever preflight succeeded; a missing handle or an empty
//! resolved command is reported as a normal test failure, never as a
//! pipeline error.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ParamValue, Params};
use crate::sandbox::SandboxHandle;
use crate::submission::SubmissionFile;
use crate::template::{ParameterDescriptor, Template, TestFunction, TestOutcome};

/// The built-in `io` template with every check registered.
pub fn template() -> Template {
    Template::new("io", true)
        .register(Arc::new(ExpectOutput))
        .register(Arc::new(ArtifactExists))
}

/// Runs the program and compares its stdout against an expectation.
///
/// `program_command` is typically the `"CMD"` placeholder or a
/// per-language command map; by execution time it has been resolved to a
/// concrete string. `inputs` are fed line-by-line on stdin.
pub struct ExpectOutput;

#[async_trait]
impl TestFunction for ExpectOutput {
    fn name(&self) -> &'static str {
        "expect_output"
    }

    fn parameters(&self) -> Vec<ParameterDescriptor> {
        vec![
            ParameterDescriptor {
                name: "program_command",
                description: "Command that runs the program (string, per-language map, or CMD)",
                param_type: "string",
            },
            ParameterDescriptor {
                name: "inputs",
                description: "Lines fed to the program on stdin",
                param_type: "list",
            },
            ParameterDescriptor {
                name: "expected_output",
                description: "Expected stdout",
                param_type: "string",
            },
            ParameterDescriptor {
                name: "match",
                description: "Comparison mode: \"exact\" (default, trimmed) or \"contains\"",
                param_type: "string",
            },
        ]
    }

    async fn execute(
        &self,
        _files: &[SubmissionFile<'_>],
        sandbox: Option<&SandboxHandle>,
        params: &Params,
    ) -> anyhow::Result<TestOutcome> {
        let Some(sandbox) = sandbox else {
            return Ok(TestOutcome::failed("no sandbox available to run the program"));
        };

        let command = params
            .get("program_command")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if command.is_empty() {
            return Ok(TestOutcome::failed(
                "no execution command available for the submission language",
            ));
        }

        let expected = params
            .get("expected_output")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter 'expected_output'"))?;

        let stdin = params
            .get("inputs")
            .and_then(|v| v.as_list())
            .map(|lines| {
                let mut joined = lines
                    .iter()
                    .filter_map(|line| line.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                joined.push('\n');
                joined
            });

        let result = match sandbox.run_command(command, stdin.as_deref()).await {
            Ok(result) => result,
            Err(e) => {
                return Ok(TestOutcome::failed(format!(
                    "program could not be run: {e}"
                )));
            }
        };

        if !result.success() {
            return Ok(TestOutcome::failed(format!(
                "program exited with {}: {}",
                result.exit_code,
                result.stderr.trim()
            ))
            .with_metadata("exit_code", ParamValue::Number(result.exit_code as f64)));
        }

        let actual = result.stdout.trim();
        let matched = match params.get("match").and_then(|v| v.as_str()) {
            Some("contains") => actual.contains(expected.trim()),
            _ => actual == expected.trim(),
        };

        let outcome = if matched {
            TestOutcome::passed(format!("program printed the expected output '{expected}'"))
        } else {
            TestOutcome::failed(format!(
                "expected '{}', got '{actual}'",
                expected.trim()
            ))
        };
        Ok(outcome.with_metadata("stdout", ParamValue::String(result.stdout.clone())))
    }
}

/// Checks that the program produced an artifact in the sandbox.
pub struct ArtifactExists;

#[async_trait]
impl TestFunction for ArtifactExists {
    fn name(&self) -> &'static str {
        "artifact_exists"
    }

    fn parameters(&self) -> Vec<ParameterDescriptor> {
        vec![ParameterDescriptor {
            name: "path",
            description: "Path of the artifact inside the sandbox working area",
            param_type: "string",
        }]
    }

    async fn execute(
        &self,
        _files: &[SubmissionFile<'_>],
        sandbox: Option<&SandboxHandle>,
        params: &Params,
    ) -> anyhow::Result<TestOutcome> {
        let Some(sandbox) = sandbox else {
            return Ok(TestOutcome::failed("no sandbox available to inspect"));
        };

        let path = params
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter 'path'"))?;

        match sandbox.read_file(path).await {
            Ok(content) => Ok(TestOutcome::passed(format!(
                "artifact '{path}' exists ({} bytes)",
                content.len()
            ))
            .with_metadata("size", ParamValue::Number(content.len() as f64))),
            Err(e) => Ok(TestOutcome::failed(format!(
                "artifact '{path}' not found: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::Language;
    use crate::sandbox::testing::{FakeSandbox, SharedFake};

    fn params(json: &str) -> Params {
        serde_json::from_str(json).unwrap()
    }

    fn handle(sandbox: std::sync::Arc<FakeSandbox>) -> SandboxHandle {
        SandboxHandle::new(
            Box::new(SharedFake(sandbox)),
            Language::Java,
            Duration::from_secs(120),
        )
    }

    #[tokio::test]
    async fn test_expect_output_matches_trimmed_stdout() {
        let fake = FakeSandbox::new("sbx-1");
        fake.respond("java Calc", 0, "8\n", "");
        let handle = handle(fake.clone());

        let outcome = ExpectOutput
            .execute(
                &[],
                Some(&handle),
                &params(
                    r#"{"program_command": "java Calc", "inputs": ["5", "3"], "expected_output": "8"}"#,
                ),
            )
            .await
            .unwrap();

        assert!(outcome.is_passing());
        assert_eq!(fake.command_log(), vec!["java Calc"]);
    }

    #[tokio::test]
    async fn test_expect_output_wrong_answer() {
        let fake = FakeSandbox::new("sbx-1");
        fake.respond("java Calc", 0, "9\n", "");
        let handle = handle(fake);

        let outcome = ExpectOutput
            .execute(
                &[],
                Some(&handle),
                &params(r#"{"program_command": "java Calc", "expected_output": "8"}"#),
            )
            .await
            .unwrap();

        assert_eq!(outcome.score, 0.0);
        assert!(outcome.report.contains("expected '8', got '9'"));
    }

    #[tokio::test]
    async fn test_expect_output_contains_mode() {
        let fake = FakeSandbox::new("sbx-1");
        fake.respond("python3 main.py", 0, "the answer is 42, obviously\n", "");
        let handle = handle(fake);

        let outcome = ExpectOutput
            .execute(
                &[],
                Some(&handle),
                &params(
                    r#"{"program_command": "python3 main.py", "expected_output": "42", "match": "contains"}"#,
                ),
            )
            .await
            .unwrap();

        assert!(outcome.is_passing());
    }

    #[tokio::test]
    async fn test_expect_output_nonzero_exit_fails() {
        let fake = FakeSandbox::new("sbx-1");
        fake.respond("java Calc", 1, "", "Exception in thread \"main\"");
        let handle = handle(fake);

        let outcome = ExpectOutput
            .execute(
                &[],
                Some(&handle),
                &params(r#"{"program_command": "java Calc", "expected_output": "8"}"#),
            )
            .await
            .unwrap();

        assert_eq!(outcome.score, 0.0);
        assert!(outcome.report.contains("exited with 1"));
        assert_eq!(
            outcome.metadata.get("exit_code").unwrap().as_f64(),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_expect_output_empty_command_fails_naturally() {
        // A per-language map without the submission's language resolves
        // to "" before the test runs.
        let fake = FakeSandbox::new("sbx-1");
        let handle = handle(fake.clone());

        let outcome = ExpectOutput
            .execute(
                &[],
                Some(&handle),
                &params(r#"{"program_command": "", "expected_output": "8"}"#),
            )
            .await
            .unwrap();

        assert_eq!(outcome.score, 0.0);
        assert!(outcome.report.contains("no execution command"));
        assert!(fake.command_log().is_empty());
    }

    #[tokio::test]
    async fn test_expect_output_without_sandbox_fails() {
        let outcome = ExpectOutput
            .execute(
                &[],
                None,
                &params(r#"{"program_command": "java Calc", "expected_output": "8"}"#),
            )
            .await
            .unwrap();

        assert_eq!(outcome.score, 0.0);
        assert!(outcome.report.contains("no sandbox"));
    }

    #[tokio::test]
    async fn test_artifact_exists() {
        let fake = FakeSandbox::new("sbx-1");
        fake.files
            .lock()
            .unwrap()
            .insert("out.txt".to_string(), b"data".to_vec());
        let handle = handle(fake);

        let outcome = ArtifactExists
            .execute(&[], Some(&handle), &params(r#"{"path": "out.txt"}"#))
            .await
            .unwrap();
        assert!(outcome.is_passing());
        assert_eq!(outcome.metadata.get("size").unwrap().as_f64(), Some(4.0));

        let outcome = ArtifactExists
            .execute(&[], Some(&handle), &params(r#"{"path": "missing.txt"}"#))
            .await
            .unwrap();
        assert_eq!(outcome.score, 0.0);
    }
}
