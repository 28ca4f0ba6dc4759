//! Grading templates and the test-function contract.
//!
//! A template is a read-only registry of named test functions plus a flag
//! stating whether grading needs a sandbox. Rubrics reference tests by
//! name; resolution happens once, when the rubric tree is built.
//!
//! # The test-function contract
//!
//! Every test function advertises its name, its configurable parameters,
//! and an optional required file kind, and implements one operation:
//!
//! ```text
//! execute(files, sandbox, params) -> TestOutcome { score in [0,100], report, metadata }
//! ```
//!
//! The core guarantees `sandbox` is `Some` iff the template declared
//! [`Template::requires_sandbox`] and the preflight stage acquired one.
//! Test functions must tolerate an empty file selection (a missing
//! submission file is their failure to report, not the pipeline's).
//!
//! Built-in templates live in [`web`] and [`io`]; external test libraries
//! plug in through the same [`TestFunction`] trait.

pub mod io;
pub mod web;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::Params;
use crate::sandbox::SandboxHandle;
use crate::submission::SubmissionFile;

/// The kind of submission file a test function operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileKind {
    #[serde(rename = "HTML")]
    Html,
    #[serde(rename = "CSS")]
    Css,
    #[serde(rename = "JavaScript")]
    JavaScript,
    #[serde(rename = "Essay")]
    Essay,
}

/// Describes one configurable parameter of a test function.
///
/// Advertised so configuration tooling can document available tests;
/// file content is passed separately and is never listed here.
#[derive(Debug, Clone, Serialize)]
pub struct ParameterDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "type")]
    pub param_type: &'static str,
}

/// The result of one test invocation.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    /// Score in `[0, 100]`. Values outside the range are clamped by the
    /// grader.
    pub score: f64,

    /// Human-readable explanation, surfaced in feedback.
    pub report: String,

    /// Free-form data emitted by the test (counts, matched selectors, ...).
    pub metadata: Params,
}

impl TestOutcome {
    pub fn passed(report: impl Into<String>) -> Self {
        Self::scored(100.0, report)
    }

    pub fn failed(report: impl Into<String>) -> Self {
        Self::scored(0.0, report)
    }

    pub fn scored(score: f64, report: impl Into<String>) -> Self {
        Self {
            score,
            report: report.into(),
            metadata: Params::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: crate::config::ParamValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_passing(&self) -> bool {
        self.score >= 100.0
    }
}

/// A named, parameterized check against a submission.
///
/// Implementations come from built-in templates or external test
/// libraries. Failures should be reported through the returned
/// [`TestOutcome`]; an `Err` (or a panic) is contained by the grader and
/// converted into a zero-score outcome, so a misbehaving test can never
/// abort a grading run.
#[async_trait]
pub trait TestFunction: Send + Sync {
    /// Unique name within a template.
    fn name(&self) -> &'static str;

    /// Configurable parameters, for documentation and tooling.
    fn parameters(&self) -> Vec<ParameterDescriptor> {
        Vec::new()
    }

    /// The file kind this test expects, if any.
    fn required_file_kind(&self) -> Option<FileKind> {
        None
    }

    /// Runs the check against the selected files.
    async fn execute(
        &self,
        files: &[SubmissionFile<'_>],
        sandbox: Option<&SandboxHandle>,
        params: &Params,
    ) -> anyhow::Result<TestOutcome>;
}

/// A read-only registry of test functions.
#[derive(Clone)]
pub struct Template {
    name: String,
    requires_sandbox: bool,
    tests: BTreeMap<&'static str, Arc<dyn TestFunction>>,
}

impl Template {
    pub fn new(name: impl Into<String>, requires_sandbox: bool) -> Self {
        Self {
            name: name.into(),
            requires_sandbox,
            tests: BTreeMap::new(),
        }
    }

    /// Registers a test function under its own name.
    pub fn register(mut self, test: Arc<dyn TestFunction>) -> Self {
        self.tests.insert(test.name(), test);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether grading against this template needs a sandbox.
    pub fn requires_sandbox(&self) -> bool {
        self.requires_sandbox
    }

    pub fn get(&self, test_name: &str) -> Option<Arc<dyn TestFunction>> {
        self.tests.get(test_name).cloned()
    }

    pub fn test_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tests.keys().copied()
    }

    pub fn tests(&self) -> impl Iterator<Item = &Arc<dyn TestFunction>> {
        self.tests.values()
    }
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.name)
            .field("requires_sandbox", &self.requires_sandbox)
            .field("tests", &self.tests.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Registry of available templates, keyed by name.
///
/// The service builds one at startup with the built-in templates; custom
/// template descriptors supplied per pipeline are inserted alongside.
#[derive(Clone, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Arc<Template>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in `web` and `io` templates.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.insert(web::template());
        registry.insert(io::template());
        registry
    }

    pub fn insert(&mut self, template: Template) {
        self.templates
            .insert(template.name().to_string(), Arc::new(template));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Template>> {
        self.templates.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }
}
