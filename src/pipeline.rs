//! The grading pipeline orchestrator.
//!
//! A [`Pipeline`] is built once per grading configuration and runs any
//! number of submissions concurrently; per-run state lives in the
//! [`PipelineExecution`] it returns.
//!
//! # Stages
//!
//! ```text
//! LOAD_TEMPLATE ─► BUILD_TREE ─► [PREFLIGHT] ─► GRADE ─► [FOCUS] ─► [FEEDBACK] ─► [EXPORT]
//! ```
//!
//! Bracketed stages are conditional: PREFLIGHT runs when a setup
//! configuration is supplied, FOCUS and FEEDBACK when feedback is
//! enabled, EXPORT when a sink is attached. Stages execute strictly
//! sequentially; the first failure stops the run.
//!
//! # Failure semantics
//!
//! A graceful stage failure appends a fail record (with structured
//! `error_details`) and moves the execution to `failed`; a panic inside
//! a stage moves it to `interrupted`. Neither propagates as `Err` past
//! the orchestrator - the trace is the user-visible explanation. Only
//! configuration errors at [`PipelineBuilder::build`] time surface
//! synchronously.
//!
//! Every exit path releases an acquired sandbox: back to the pool after
//! success or graceful failure, destroyed after an interruption (the
//! container state is suspect).

pub mod preflight;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{FeedbackConfig, RubricConfig, SetupConfig};
use crate::feedback::{FeedbackInput, FeedbackReporter, Focus, StructuredRenderer};
use crate::grader::{Grader, ResultTree};
use crate::rubric::builder::{self, RubricError};
use crate::rubric::RubricTree;
use crate::sandbox::pool::PoolManager;
use crate::sandbox::SandboxHandle;
use crate::submission::Submission;
use crate::template::{Template, TemplateRegistry};

/// Identifies a pipeline stage in traces and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageTag {
    LoadTemplate,
    BuildTree,
    Preflight,
    Grade,
    Focus,
    Feedback,
    Export,
}

impl std::fmt::Display for StageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageTag::LoadTemplate => "LOAD_TEMPLATE",
            StageTag::BuildTree => "BUILD_TREE",
            StageTag::Preflight => "PREFLIGHT",
            StageTag::Grade => "GRADE",
            StageTag::Focus => "FOCUS",
            StageTag::Feedback => "FEEDBACK",
            StageTag::Export => "EXPORT",
        };
        f.write_str(name)
    }
}

/// Outcome of one attempted stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Success,
    Fail,
}

/// Lifecycle of a pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Created, not yet started.
    Empty,
    Running,
    Success,
    /// A stage failed gracefully; see the trace.
    Failed,
    /// A stage panicked; the run was aborted.
    Interrupted,
}

/// Structured failure payload attached to a failed stage record.
///
/// The `error_type` tag lets the API layer differentiate configuration,
/// preflight, and infrastructure failures without string matching.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum ErrorDetails {
    RequiredFileMissing {
        missing_file: String,
    },
    SetupCommandFailed {
        command_name: String,
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    SandboxUnavailable {
        message: String,
    },
    ExportFailed {
        message: String,
    },
    Internal {
        message: String,
    },
}

/// Per-stage data payload retained in the trace.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageData {
    TemplateLoaded {
        template: String,
        requires_sandbox: bool,
    },
    TreeBuilt {
        tests: usize,
    },
    PreflightPassed {
        sandbox: Option<String>,
        setup_commands: usize,
    },
    Graded {
        final_score: f64,
    },
    FocusComputed {
        failing_tests: usize,
    },
    FeedbackRendered {
        length: usize,
    },
    Exported,
}

/// One attempted stage: tag, outcome, duration, and optional payloads.
#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub name: StageTag,
    pub status: StageStatus,
    pub duration_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<StageData>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
}

/// The materialized outcome of a finished execution.
///
/// Present on every terminal execution; `result_tree` is `None` (and the
/// score zero) when grading did not complete.
#[derive(Debug, Clone, Serialize)]
pub struct GradingResult {
    pub final_score: f64,
    pub feedback: Option<String>,
    pub result_tree: Option<ResultTree>,
}

/// One run of a pipeline over one submission.
///
/// Records every attempted stage; terminal after the run returns.
#[derive(Debug)]
pub struct PipelineExecution {
    pub status: ExecutionStatus,
    pub steps: Vec<StageRecord>,
    pub total_steps_planned: usize,
    pub execution_time: Duration,
    pub result: Option<GradingResult>,
}

impl PipelineExecution {
    fn new(total_steps_planned: usize) -> Self {
        Self {
            status: ExecutionStatus::Empty,
            steps: Vec::new(),
            total_steps_planned,
            execution_time: Duration::ZERO,
            result: None,
        }
    }

    /// The stage that stopped the run, if any.
    pub fn failed_at_step(&self) -> Option<StageTag> {
        self.steps
            .iter()
            .find(|s| s.status == StageStatus::Fail)
            .map(|s| s.name)
    }

    pub fn steps_completed(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StageStatus::Success)
            .count()
    }

    fn grade_succeeded(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.name == StageTag::Grade && s.status == StageStatus::Success)
    }

    fn record_success(
        &mut self,
        name: StageTag,
        duration: Duration,
        message: Option<String>,
        data: Option<StageData>,
    ) {
        self.steps.push(StageRecord {
            name,
            status: StageStatus::Success,
            duration_ms: duration.as_millis() as u64,
            message,
            data,
            error_details: None,
        });
    }

    fn record_error(&mut self, name: StageTag, duration: Duration, error: StageError) {
        match error {
            StageError::Fail(failure) => {
                warn!(stage = %name, "stage failed: {}", failure.message);
                self.steps.push(StageRecord {
                    name,
                    status: StageStatus::Fail,
                    duration_ms: duration.as_millis() as u64,
                    message: Some(failure.message),
                    data: None,
                    error_details: Some(failure.details),
                });
                self.status = ExecutionStatus::Failed;
            }
            StageError::Panic(message) => {
                warn!(stage = %name, "stage panicked: {message}");
                self.steps.push(StageRecord {
                    name,
                    status: StageStatus::Fail,
                    duration_ms: duration.as_millis() as u64,
                    message: Some(format!("stage panicked: {message}")),
                    data: None,
                    error_details: Some(ErrorDetails::Internal { message }),
                });
                self.status = ExecutionStatus::Interrupted;
            }
        }
    }

    /// The response shape handed to the API layer.
    pub fn to_response(&self) -> ExecutionResponse {
        let graded = self.grade_succeeded();
        let result = self.result.as_ref();

        ExecutionResponse {
            status: self.status,
            final_score: if graded {
                result.map(|r| r.final_score)
            } else {
                None
            },
            feedback: result.and_then(|r| r.feedback.clone()),
            result_tree: if graded {
                result.and_then(|r| r.result_tree.clone())
            } else {
                None
            },
            pipeline_execution: ExecutionTrace {
                failed_at_step: self.failed_at_step(),
                total_steps_planned: self.total_steps_planned,
                steps_completed: self.steps_completed(),
                execution_time_ms: self.execution_time.as_millis() as u64,
                steps: self.steps.clone(),
            },
        }
    }
}

/// Serializable execution trace, part of [`ExecutionResponse`].
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionTrace {
    pub failed_at_step: Option<StageTag>,
    pub total_steps_planned: usize,
    pub steps_completed: usize,
    pub execution_time_ms: u64,
    pub steps: Vec<StageRecord>,
}

/// The outbound response shape for one execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResponse {
    pub status: ExecutionStatus,
    pub final_score: Option<f64>,
    pub feedback: Option<String>,
    pub result_tree: Option<ResultTree>,
    pub pipeline_execution: ExecutionTrace,
}

/// External sink receiving finished grading results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn export(&self, submission: &Submission, result: &GradingResult) -> anyhow::Result<()>;
}

/// How the FEEDBACK stage renders its report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedbackMode {
    /// The built-in [`StructuredRenderer`].
    #[default]
    Structured,
    /// A caller-supplied reporter (e.g. an AI-backed collaborator).
    External,
}

/// Errors from [`PipelineBuilder::build`].
///
/// These are the only errors that surface synchronously; everything at
/// run time lands in the execution trace instead.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error(transparent)]
    Rubric(#[from] RubricError),

    #[error("external feedback mode requires a reporter")]
    MissingReporter,
}

pub(crate) struct StageFailure {
    pub message: String,
    pub details: ErrorDetails,
}

enum StageError {
    Fail(StageFailure),
    Panic(String),
}

/// Configures and validates a [`Pipeline`].
///
/// # Example
///
/// ```no_run
/// use autograder::config::parse_rubric_config;
/// use autograder::pipeline::PipelineBuilder;
/// use autograder::template::TemplateRegistry;
///
/// # fn main() -> anyhow::Result<()> {
/// let registry = TemplateRegistry::with_builtins();
/// let criteria = parse_rubric_config(
///     r#"{"base": {"weight": 100, "tests": [{"name": "has_tag", "params": {"tag": "nav"}}]}}"#,
/// )?;
///
/// let pipeline = PipelineBuilder::new("web", criteria)
///     .feedback_enabled(true)
///     .build(&registry)?;
/// # Ok(())
/// # }
/// ```
pub struct PipelineBuilder {
    template_name: String,
    criteria: RubricConfig,
    setup: Option<SetupConfig>,
    feedback_config: FeedbackConfig,
    feedback_enabled: bool,
    feedback_mode: FeedbackMode,
    reporter: Option<Arc<dyn FeedbackReporter>>,
    sink: Option<Arc<dyn ResultSink>>,
    custom_template: Option<Template>,
    pool: Option<Arc<PoolManager>>,
}

impl PipelineBuilder {
    pub fn new(template_name: impl Into<String>, criteria: RubricConfig) -> Self {
        Self {
            template_name: template_name.into(),
            criteria,
            setup: None,
            feedback_config: FeedbackConfig::default(),
            feedback_enabled: false,
            feedback_mode: FeedbackMode::Structured,
            reporter: None,
            sink: None,
            custom_template: None,
            pool: None,
        }
    }

    /// Attaches a preflight setup configuration.
    pub fn setup(mut self, setup: SetupConfig) -> Self {
        self.setup = Some(setup);
        self
    }

    pub fn feedback_config(mut self, config: FeedbackConfig) -> Self {
        self.feedback_config = config;
        self
    }

    /// Enables the FOCUS and FEEDBACK stages.
    pub fn feedback_enabled(mut self, enabled: bool) -> Self {
        self.feedback_enabled = enabled;
        self
    }

    pub fn feedback_mode(mut self, mode: FeedbackMode) -> Self {
        self.feedback_mode = mode;
        self
    }

    /// Supplies the reporter used in [`FeedbackMode::External`].
    pub fn reporter(mut self, reporter: Arc<dyn FeedbackReporter>) -> Self {
        self.reporter = Some(reporter);
        self.feedback_mode = FeedbackMode::External;
        self
    }

    /// Attaches an export sink and enables the EXPORT stage.
    pub fn export(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Grades against an ad-hoc template instead of a registry entry.
    pub fn custom_template(mut self, template: Template) -> Self {
        self.custom_template = Some(template);
        self
    }

    /// Connects the sandbox fleet; required for sandbox-backed templates.
    pub fn pool(mut self, pool: Arc<PoolManager>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Resolves the template, builds the rubric tree, and produces the
    /// reusable pipeline.
    ///
    /// # Errors
    ///
    /// All configuration errors surface here, before any submission is
    /// graded: unknown template, malformed rubric, unknown test names,
    /// missing `subjects_weight`.
    pub fn build(self, registry: &TemplateRegistry) -> Result<Pipeline, BuildError> {
        let template = match self.custom_template {
            Some(template) => Arc::new(template),
            None => registry
                .get(&self.template_name)
                .ok_or_else(|| BuildError::TemplateNotFound(self.template_name.clone()))?,
        };

        let tree = builder::build(&self.criteria, &template)?;

        let reporter: Arc<dyn FeedbackReporter> = match (self.feedback_mode, self.reporter) {
            (_, Some(reporter)) => reporter,
            (FeedbackMode::Structured, None) => Arc::new(StructuredRenderer),
            (FeedbackMode::External, None) => return Err(BuildError::MissingReporter),
        };

        info!(
            template = template.name(),
            tests = tree.test_count(),
            "pipeline built"
        );

        Ok(Pipeline {
            template,
            tree: Arc::new(tree),
            setup: self.setup,
            feedback_config: self.feedback_config,
            feedback_enabled: self.feedback_enabled,
            reporter,
            sink: self.sink,
            pool: self.pool,
        })
    }
}

/// A stateless, reusable grading pipeline.
///
/// Safe for concurrent [`run`](Self::run) calls: the rubric tree and
/// template are read-only, and all per-run state lives in the returned
/// execution.
pub struct Pipeline {
    template: Arc<Template>,
    tree: Arc<RubricTree>,
    setup: Option<SetupConfig>,
    feedback_config: FeedbackConfig,
    feedback_enabled: bool,
    reporter: Arc<dyn FeedbackReporter>,
    sink: Option<Arc<dyn ResultSink>>,
    pool: Option<Arc<PoolManager>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("template", &self.template)
            .field("tree", &self.tree)
            .field("setup", &self.setup)
            .field("feedback_config", &self.feedback_config)
            .field("feedback_enabled", &self.feedback_enabled)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn rubric_tree(&self) -> &RubricTree {
        &self.tree
    }

    fn planned_steps(&self) -> usize {
        let mut steps = 3; // LOAD_TEMPLATE, BUILD_TREE, GRADE
        if self.setup.is_some() {
            steps += 1;
        }
        if self.feedback_enabled {
            steps += 2;
        }
        if self.sink.is_some() {
            steps += 1;
        }
        steps
    }

    /// Runs the pipeline over one submission.
    ///
    /// Never returns `Err`: every failure mode is captured in the
    /// returned execution's trace and status.
    pub async fn run(&self, submission: &Submission) -> PipelineExecution {
        let started = Instant::now();
        let mut execution = PipelineExecution::new(self.planned_steps());
        execution.status = ExecutionStatus::Running;

        info!(
            assignment = %submission.assignment_id,
            user = %submission.user_id,
            "grading started"
        );

        let mut sandbox: Option<SandboxHandle> = None;
        let mut graded: Option<(f64, ResultTree)> = None;
        let mut feedback: Option<String> = None;

        self.run_stages(submission, &mut execution, &mut sandbox, &mut graded, &mut feedback)
            .await;

        // Finalization: the sandbox is released on every exit path. An
        // interrupted run destroys it instead - its state is suspect.
        if let Some(handle) = sandbox.take() {
            if let Some(pool) = &self.pool {
                if execution.status == ExecutionStatus::Interrupted {
                    pool.discard(handle).await;
                } else {
                    pool.release(handle).await;
                }
            }
        }

        let (final_score, result_tree) = match graded {
            Some((score, tree)) => (score, Some(tree)),
            None => (0.0, None),
        };
        execution.result = Some(GradingResult {
            final_score,
            feedback,
            result_tree,
        });

        if execution.status == ExecutionStatus::Running {
            execution.status = ExecutionStatus::Success;
        }
        execution.execution_time = started.elapsed();

        info!(
            assignment = %submission.assignment_id,
            user = %submission.user_id,
            status = ?execution.status,
            elapsed_ms = execution.execution_time.as_millis() as u64,
            "grading finished"
        );
        execution
    }

    async fn run_stages(
        &self,
        submission: &Submission,
        execution: &mut PipelineExecution,
        sandbox: &mut Option<SandboxHandle>,
        graded: &mut Option<(f64, ResultTree)>,
        feedback: &mut Option<String>,
    ) {
        // LOAD_TEMPLATE and BUILD_TREE were resolved eagerly when the
        // pipeline was built; the trace still records them so every run
        // lists the full pipeline shape.
        execution.record_success(
            StageTag::LoadTemplate,
            Duration::ZERO,
            Some(format!("template '{}'", self.template.name())),
            Some(StageData::TemplateLoaded {
                template: self.template.name().to_string(),
                requires_sandbox: self.template.requires_sandbox(),
            }),
        );
        execution.record_success(
            StageTag::BuildTree,
            Duration::ZERO,
            Some(format!("{} tests resolved", self.tree.test_count())),
            Some(StageData::TreeBuilt {
                tests: self.tree.test_count(),
            }),
        );

        if let Some(setup) = &self.setup {
            let start = Instant::now();
            match guarded(self.run_preflight(submission, setup, sandbox)).await {
                Ok((message, data)) => {
                    execution.record_success(StageTag::Preflight, start.elapsed(), message, Some(data));
                }
                Err(error) => {
                    execution.record_error(StageTag::Preflight, start.elapsed(), error);
                    return;
                }
            }
        }

        let start = Instant::now();
        let grade_outcome = guarded(async {
            let grader = Grader::new(submission, sandbox.as_ref());
            Ok(grader.grade(&self.tree).await)
        })
        .await;
        match grade_outcome {
            Ok((score, tree)) => {
                execution.record_success(
                    StageTag::Grade,
                    start.elapsed(),
                    Some(format!("final score {score:.1}/100")),
                    Some(StageData::Graded { final_score: score }),
                );
                *graded = Some((score, tree));
            }
            Err(error) => {
                execution.record_error(StageTag::Grade, start.elapsed(), error);
                return;
            }
        }

        if self.feedback_enabled {
            let Some((score, tree)) = graded.as_ref() else {
                return;
            };

            let start = Instant::now();
            let focus = Focus::compute(tree);
            execution.record_success(
                StageTag::Focus,
                start.elapsed(),
                Some(format!("{} failing test(s)", focus.failing_count())),
                Some(StageData::FocusComputed {
                    failing_tests: focus.failing_count(),
                }),
            );

            let start = Instant::now();
            let input = FeedbackInput {
                submission,
                final_score: *score,
                result: tree,
                focus: &focus,
                config: &self.feedback_config,
            };
            let rendered = guarded(async {
                self.reporter.render(&input).await.map_err(|e| StageFailure {
                    message: format!("feedback rendering failed: {e}"),
                    details: ErrorDetails::Internal {
                        message: e.to_string(),
                    },
                })
            })
            .await;
            match rendered {
                Ok(text) => {
                    execution.record_success(
                        StageTag::Feedback,
                        start.elapsed(),
                        None,
                        Some(StageData::FeedbackRendered { length: text.len() }),
                    );
                    *feedback = Some(text);
                }
                Err(error) => {
                    execution.record_error(StageTag::Feedback, start.elapsed(), error);
                    return;
                }
            }
        }

        if let Some(sink) = &self.sink {
            let Some((score, tree)) = graded.as_ref() else {
                return;
            };

            let start = Instant::now();
            let snapshot = GradingResult {
                final_score: *score,
                feedback: feedback.clone(),
                result_tree: Some(tree.clone()),
            };
            let exported = guarded(async {
                sink.export(submission, &snapshot).await.map_err(|e| StageFailure {
                    message: format!("export failed: {e}"),
                    details: ErrorDetails::ExportFailed {
                        message: e.to_string(),
                    },
                })
            })
            .await;
            match exported {
                Ok(()) => {
                    execution.record_success(
                        StageTag::Export,
                        start.elapsed(),
                        None,
                        Some(StageData::Exported),
                    );
                }
                Err(error) => {
                    execution.record_error(StageTag::Export, start.elapsed(), error);
                }
            }
        }
    }
}

/// Runs a stage body behind a panic boundary.
async fn guarded<T>(
    stage: impl std::future::Future<Output = Result<T, StageFailure>>,
) -> Result<T, StageError> {
    match AssertUnwindSafe(stage).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(failure)) => Err(StageError::Fail(failure)),
        Err(payload) => Err(StageError::Panic(panic_message(payload))),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use crate::config::{parse_rubric_config, parse_setup_config, Language, Params, PoolSettings};
    use crate::sandbox::testing::FakeProvisioner;
    use crate::submission::SubmissionFile;
    use crate::template::{TestFunction, TestOutcome};

    fn registry() -> TemplateRegistry {
        TemplateRegistry::with_builtins()
    }

    fn web_submission() -> Submission {
        Submission::new("hw1", "u42", "Ada")
            .with_file(
                "index.html",
                "<html><body><nav>menu</nav></body></html>",
            )
            .with_file(
                "style.css",
                "nav { display: flex; }\n@media (max-width: 600px) {}\n@media print {}",
            )
    }

    fn scenario_rubric() -> RubricConfig {
        parse_rubric_config(
            r#"{
                "base": {
                    "weight": 100,
                    "subjects": [
                        {"name": "HTML", "weight": 50, "tests": [
                            {"name": "has_tag", "file": "index.html",
                             "params": {"tag": "nav", "required_count": 1}}
                        ]},
                        {"name": "CSS", "weight": 50, "tests": [
                            {"name": "has_style", "file": "style.css",
                             "params": {"prop": "display", "value": "flex"}}
                        ]}
                    ]
                }
            }"#,
        )
        .unwrap()
    }

    async fn pool_with(provisioner: Arc<FakeProvisioner>) -> Arc<PoolManager> {
        let mut pools = BTreeMap::new();
        pools.insert(
            Language::Java,
            PoolSettings {
                image: "autograder/java:21".to_string(),
                min_idle: 0,
                max_total: 2,
                idle_ttl_secs: 600,
                running_ttl_secs: 120,
                acquire_wait_secs: 5,
            },
        );
        PoolManager::initialize(provisioner, pools).await.unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_static_web_rubric() {
        let pipeline = PipelineBuilder::new("web", scenario_rubric())
            .build(&registry())
            .unwrap();

        let execution = pipeline.run(&web_submission()).await;

        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.total_steps_planned, 3);
        assert_eq!(execution.steps_completed(), 3);
        assert_eq!(execution.failed_at_step(), None);

        let result = execution.result.as_ref().unwrap();
        assert_eq!(result.final_score, 100.0);
        let tree = result.result_tree.as_ref().unwrap();
        assert_eq!(tree.base.subjects.len(), 2);
        assert_eq!(tree.base.subjects[0].name, "HTML");
    }

    #[tokio::test]
    async fn test_bonus_contribution_clamps_at_100() {
        let rubric = parse_rubric_config(
            r#"{
                "base": {"weight": 100, "tests": [
                    {"name": "has_tag", "file": "index.html", "params": {"tag": "nav"}}
                ]},
                "bonus": {"weight": 20, "tests": [
                    {"name": "check_media_queries", "file": "style.css",
                     "params": {"required_count": 2}}
                ]}
            }"#,
        )
        .unwrap();
        let pipeline = PipelineBuilder::new("web", rubric).build(&registry()).unwrap();

        let execution = pipeline.run(&web_submission()).await;
        let result = execution.result.as_ref().unwrap();
        let tree = result.result_tree.as_ref().unwrap();

        assert_eq!(tree.base.score, 100.0);
        assert_eq!(tree.bonus_points(), 20.0);
        assert_eq!(result.final_score, 100.0);
    }

    #[tokio::test]
    async fn test_penalty_deduction() {
        let rubric = parse_rubric_config(
            r#"{
                "base": {"weight": 100, "tests": [
                    {"name": "has_tag", "file": "index.html", "params": {"tag": "nav"}}
                ]},
                "penalty": {"weight": 10, "tests": [
                    {"name": "has_forbidden_tag", "file": "index.html",
                     "params": {"tag": "script"}}
                ]}
            }"#,
        )
        .unwrap();
        let pipeline = PipelineBuilder::new("web", rubric).build(&registry()).unwrap();

        let submission = Submission::new("hw1", "u42", "Ada")
            .with_file("index.html", "<nav>x</nav><script>alert(1)</script>")
            .with_file("style.css", "");

        let execution = pipeline.run(&submission).await;
        let result = execution.result.as_ref().unwrap();
        assert_eq!(result.final_score, 90.0);
    }

    #[tokio::test]
    async fn test_feedback_stages_render_report() {
        let pipeline = PipelineBuilder::new("web", scenario_rubric())
            .feedback_enabled(true)
            .build(&registry())
            .unwrap();

        // Missing flex style: CSS test fails.
        let submission = Submission::new("hw1", "u42", "Ada")
            .with_file("index.html", "<nav>menu</nav>")
            .with_file("style.css", "nav { display: block; }");

        let execution = pipeline.run(&submission).await;

        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.total_steps_planned, 5);

        let result = execution.result.as_ref().unwrap();
        assert_eq!(result.final_score, 50.0);
        let feedback = result.feedback.as_ref().unwrap();
        assert!(feedback.contains("has_style"));

        let tags: Vec<StageTag> = execution.steps.iter().map(|s| s.name).collect();
        assert_eq!(
            tags,
            vec![
                StageTag::LoadTemplate,
                StageTag::BuildTree,
                StageTag::Grade,
                StageTag::Focus,
                StageTag::Feedback
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_template_fails_at_build() {
        let err = PipelineBuilder::new("no_such_template", scenario_rubric())
            .build(&registry())
            .unwrap_err();
        assert!(matches!(err, BuildError::TemplateNotFound(name) if name == "no_such_template"));
    }

    #[tokio::test]
    async fn test_rubric_errors_fail_at_build() {
        let rubric = parse_rubric_config(
            r#"{"base": {"weight": 100, "tests": [{"name": "not_a_real_test"}]}}"#,
        )
        .unwrap();
        let err = PipelineBuilder::new("web", rubric)
            .build(&registry())
            .unwrap_err();
        assert!(matches!(err, BuildError::Rubric(_)));
    }

    #[tokio::test]
    async fn test_preflight_missing_required_file() {
        let setup = parse_setup_config(
            r#"{"required_files": ["index.html", "style.css"], "setup_commands": []}"#,
        )
        .unwrap();
        let pipeline = PipelineBuilder::new("web", scenario_rubric())
            .setup(setup)
            .build(&registry())
            .unwrap();

        let submission = Submission::new("hw1", "u42", "Ada").with_file("index.html", "<nav/>");
        let execution = pipeline.run(&submission).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.failed_at_step(), Some(StageTag::Preflight));

        let record = execution.steps.last().unwrap();
        assert!(matches!(
            record.error_details,
            Some(ErrorDetails::RequiredFileMissing { ref missing_file }) if missing_file == "style.css"
        ));

        // No grading happened.
        let response = execution.to_response();
        assert_eq!(response.final_score, None);
        assert!(response.result_tree.is_none());
    }

    /// Sandbox-backed template whose single test always passes.
    struct SandboxProbe;

    #[async_trait]
    impl TestFunction for SandboxProbe {
        fn name(&self) -> &'static str {
            "sandbox_probe"
        }

        async fn execute(
            &self,
            _files: &[SubmissionFile<'_>],
            sandbox: Option<&SandboxHandle>,
            _params: &Params,
        ) -> anyhow::Result<TestOutcome> {
            match sandbox {
                Some(_) => Ok(TestOutcome::passed("sandbox present")),
                None => Ok(TestOutcome::failed("sandbox missing")),
            }
        }
    }

    fn sandbox_template() -> Template {
        Template::new("probe", true).register(Arc::new(SandboxProbe))
    }

    fn probe_rubric() -> RubricConfig {
        parse_rubric_config(r#"{"base": {"weight": 100, "tests": [{"name": "sandbox_probe"}]}}"#)
            .unwrap()
    }

    fn java_setup() -> SetupConfig {
        parse_setup_config(
            r#"{"java": {
                "required_files": ["Calc.java"],
                "setup_commands": [{"name": "compile", "command": "javac Calc.java"}]
            }}"#,
        )
        .unwrap()
    }

    fn java_submission() -> Submission {
        Submission::new("hw2", "u7", "Grace")
            .with_language(Language::Java)
            .with_file("Calc.java", "class Calc {}")
    }

    #[tokio::test]
    async fn test_preflight_acquires_copies_and_runs_setup() {
        let provisioner = FakeProvisioner::new();
        let pool = pool_with(provisioner.clone()).await;

        let pipeline = PipelineBuilder::new("probe", probe_rubric())
            .custom_template(sandbox_template())
            .setup(java_setup())
            .pool(pool.clone())
            .build(&registry())
            .unwrap();

        let execution = pipeline.run(&java_submission()).await;
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.result.as_ref().unwrap().final_score, 100.0);

        let sandbox = provisioner.nth(0);
        assert_eq!(sandbox.command_log(), vec!["javac Calc.java"]);
        assert!(sandbox.files.lock().unwrap().is_empty()); // cleaned on release

        // Round-trip: the sandbox went back to the idle set.
        let counts = pool.counts(Language::Java).await.unwrap();
        assert_eq!(counts.active, 0);
        assert_eq!(counts.idle, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_io_grading_with_multi_language_command() {
        let provisioner = FakeProvisioner::new();
        let pool = pool_with(provisioner.clone()).await;

        let rubric = parse_rubric_config(
            r#"{"base": {"weight": 100, "tests": [
                {"name": "expect_output", "params": {
                    "program_command": {"python": "python3 calc.py", "java": "java Calc", "node": "node calc.js"},
                    "inputs": ["5", "3"],
                    "expected_output": "8"
                }}
            ]}}"#,
        )
        .unwrap();

        let pipeline = PipelineBuilder::new("io", rubric)
            .setup(java_setup())
            .pool(pool.clone())
            .build(&registry())
            .unwrap();

        // Script the program's answer on the sandbox the run will reuse.
        {
            let handle = pool.acquire(Language::Java).await.unwrap();
            provisioner.nth(0).respond("java Calc", 0, "8\n", "");
            pool.release(handle).await;
        }

        let execution = pipeline.run(&java_submission()).await;

        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.result.as_ref().unwrap().final_score, 100.0);
        // Compile ran in preflight, then the resolved java command.
        assert_eq!(
            provisioner.nth(0).command_log(),
            vec!["javac Calc.java", "java Calc"]
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_preflight_setup_command_failure() {
        let provisioner = FakeProvisioner::new();
        let pool = pool_with(provisioner.clone()).await;

        let pipeline = PipelineBuilder::new("probe", probe_rubric())
            .custom_template(sandbox_template())
            .setup(java_setup())
            .pool(pool.clone())
            .build(&registry())
            .unwrap();

        // Script the compile step to fail before the run needs it. The
        // pool is empty, so the first provisioned sandbox serves the run.
        let probe_sandbox = {
            let handle = pool.acquire(Language::Java).await.unwrap();
            let sandbox = provisioner.nth(0);
            sandbox.respond(
                "javac Calc.java",
                1,
                "",
                "Calc.java:1: error: ';' expected",
            );
            pool.release(handle).await;
            sandbox
        };

        let execution = pipeline.run(&java_submission()).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.failed_at_step(), Some(StageTag::Preflight));
        let record = execution.steps.last().unwrap();
        match record.error_details.as_ref().unwrap() {
            ErrorDetails::SetupCommandFailed {
                command_name,
                command,
                exit_code,
                stderr,
                ..
            } => {
                assert_eq!(command_name, "compile");
                assert_eq!(command, "javac Calc.java");
                assert_eq!(*exit_code, 1);
                assert!(stderr.contains("';' expected"));
            }
            other => panic!("unexpected error details: {other:?}"),
        }

        // The sandbox was still released.
        assert_eq!(probe_sandbox.cleanup_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        let counts = pool.counts(Language::Java).await.unwrap();
        assert_eq!(counts.active, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_preflight_without_language_when_sandbox_required() {
        let provisioner = FakeProvisioner::new();
        let pool = pool_with(provisioner.clone()).await;

        let pipeline = PipelineBuilder::new("probe", probe_rubric())
            .custom_template(sandbox_template())
            .setup(java_setup())
            .pool(pool.clone())
            .build(&registry())
            .unwrap();

        let submission = Submission::new("hw2", "u7", "Grace").with_file("Calc.java", "class Calc {}");
        let execution = pipeline.run(&submission).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        let record = execution.steps.last().unwrap();
        assert!(matches!(
            record.error_details,
            Some(ErrorDetails::SandboxUnavailable { .. })
        ));
        pool.shutdown().await;
    }

    /// Reporter that panics, simulating a crashing external collaborator.
    struct PanickyReporter;

    #[async_trait]
    impl FeedbackReporter for PanickyReporter {
        async fn render(&self, _input: &FeedbackInput<'_>) -> anyhow::Result<String> {
            panic!("reporter crashed");
        }
    }

    #[tokio::test]
    async fn test_stage_panic_interrupts_and_discards_sandbox() {
        let provisioner = FakeProvisioner::new();
        let pool = pool_with(provisioner.clone()).await;

        let pipeline = PipelineBuilder::new("probe", probe_rubric())
            .custom_template(sandbox_template())
            .setup(java_setup())
            .pool(pool.clone())
            .feedback_enabled(true)
            .reporter(Arc::new(PanickyReporter))
            .build(&registry())
            .unwrap();

        let execution = pipeline.run(&java_submission()).await;

        assert_eq!(execution.status, ExecutionStatus::Interrupted);
        assert_eq!(execution.failed_at_step(), Some(StageTag::Feedback));
        let record = execution.steps.last().unwrap();
        assert!(matches!(
            record.error_details,
            Some(ErrorDetails::Internal { ref message }) if message.contains("reporter crashed")
        ));

        // Interrupted runs destroy the sandbox instead of reusing it.
        assert!(provisioner.nth(0).is_terminated());
        let counts = pool.counts(Language::Java).await.unwrap();
        assert_eq!(counts.total, 0);
        pool.shutdown().await;
    }

    #[derive(Default)]
    struct RecordingSink {
        exports: Mutex<Vec<(String, f64)>>,
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        async fn export(
            &self,
            submission: &Submission,
            result: &GradingResult,
        ) -> anyhow::Result<()> {
            self.exports
                .lock()
                .unwrap()
                .push((submission.user_id.clone(), result.final_score));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_export_stage_hands_results_to_sink() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = PipelineBuilder::new("web", scenario_rubric())
            .export(sink.clone())
            .build(&registry())
            .unwrap();

        let execution = pipeline.run(&web_submission()).await;
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.total_steps_planned, 4);

        let exports = sink.exports.lock().unwrap();
        assert_eq!(exports.as_slice(), &[("u42".to_string(), 100.0)]);
    }

    #[tokio::test]
    async fn test_response_shape_field_names() {
        let pipeline = PipelineBuilder::new("web", scenario_rubric())
            .feedback_enabled(true)
            .build(&registry())
            .unwrap();

        let execution = pipeline.run(&web_submission()).await;
        let value = serde_json::to_value(execution.to_response()).unwrap();

        assert_eq!(value["status"], "success");
        assert_eq!(value["final_score"], 100.0);
        assert!(value["feedback"].is_string());
        assert!(value["result_tree"].is_object());

        let trace = &value["pipeline_execution"];
        assert!(trace["failed_at_step"].is_null());
        assert_eq!(trace["total_steps_planned"], 5);
        assert_eq!(trace["steps_completed"], 5);
        assert!(trace["execution_time_ms"].is_number());
        assert_eq!(trace["steps"][0]["name"], "LOAD_TEMPLATE");
        assert_eq!(trace["steps"][0]["status"], "success");
        assert_eq!(trace["steps"][2]["name"], "GRADE");
    }

    #[tokio::test]
    async fn test_failed_response_shape() {
        let setup = parse_setup_config(r#"{"required_files": ["missing.txt"]}"#).unwrap();
        let pipeline = PipelineBuilder::new("web", scenario_rubric())
            .setup(setup)
            .build(&registry())
            .unwrap();

        let execution = pipeline.run(&web_submission()).await;
        let value = serde_json::to_value(execution.to_response()).unwrap();

        assert_eq!(value["status"], "failed");
        assert!(value["final_score"].is_null());
        assert!(value["result_tree"].is_null());
        assert_eq!(value["pipeline_execution"]["failed_at_step"], "PREFLIGHT");
        let step = value["pipeline_execution"]["steps"]
            .as_array()
            .unwrap()
            .last()
            .cloned()
            .unwrap();
        assert_eq!(step["error_details"]["error_type"], "required_file_missing");
        assert_eq!(step["error_details"]["missing_file"], "missing.txt");
    }

    #[tokio::test]
    async fn test_concurrent_runs_share_one_pipeline() {
        let pipeline = Arc::new(
            PipelineBuilder::new("web", scenario_rubric())
                .build(&registry())
                .unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..8 {
            let pipeline = pipeline.clone();
            handles.push(tokio::spawn(async move {
                let submission = Submission::new("hw1", format!("u{i}"), format!("user-{i}"))
                    .with_file("index.html", "<nav>menu</nav>")
                    .with_file("style.css", "nav { display: flex; }");
                pipeline.run(&submission).await
            }));
        }

        for handle in handles {
            let execution = handle.await.unwrap();
            assert_eq!(execution.status, ExecutionStatus::Success);
            assert_eq!(execution.result.as_ref().unwrap().final_score, 100.0);
        }
    }
}
