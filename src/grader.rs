//! Test execution and scoring.
//!
//! The [`Grader`] traverses a rubric tree depth-first, invokes every test
//! function against the submission, and materializes a mirror
//! [`ResultTree`]. Traversal order is contractual (tests before nested
//! subjects, children in declared order) because sandbox-backed tests may
//! share container state.
//!
//! Every invocation is wrapped in a recovery boundary: a test function
//! that returns an error or panics is converted into a zero-score result
//! and grading continues. A misbehaving external test library can never
//! abort a grading run.
//!
//! Scores aggregate bottom-up: a homogeneous level is the weighted mean
//! of its children (weights sum to 100 per group); a heterogeneous level
//! combines its subjects-group and tests-group scores using the
//! configured `subjects_weight` split. At the root, bonus and penalty
//! scores convert to point offsets capped by their category weights:
//!
//! ```text
//! final = clamp(base + bonus.score * bonus.weight / 100
//!                    - penalty.score * penalty.weight / 100, 0, 100)
//! ```

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, warn};

use crate::command::resolve_params;
use crate::config::Params;
use crate::rubric::{CategoryKind, CategoryNode, RubricTree, SubjectNode, TestNode};
use crate::sandbox::SandboxHandle;
use crate::submission::Submission;

/// Result of one executed test, mirrored from its [`TestNode`].
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub weight: f64,

    /// Clamped to `[0, 100]`.
    pub score: f64,

    /// Human-readable explanation from the test function.
    pub report: String,

    /// The materialized parameter snapshot the test actually received.
    pub params: Params,

    /// Free-form data emitted by the test.
    pub metadata: Params,
}

impl TestResult {
    pub fn passed(&self) -> bool {
        self.score >= 100.0
    }
}

/// Result of one subject, mirrored from its [`SubjectNode`].
#[derive(Debug, Clone, Serialize)]
pub struct SubjectResult {
    pub name: String,
    pub weight: f64,
    pub score: f64,

    pub tests: Vec<TestResult>,
    pub subjects: Vec<SubjectResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subjects_weight: Option<f64>,
}

/// Result of one category, mirrored from its [`CategoryNode`].
#[derive(Debug, Clone, Serialize)]
pub struct CategoryResult {
    pub kind: CategoryKind,
    pub weight: f64,
    pub score: f64,

    pub tests: Vec<TestResult>,
    pub subjects: Vec<SubjectResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subjects_weight: Option<f64>,
}

impl CategoryResult {
    /// All test results in this category, in execution order.
    pub fn tests_in_order(&self) -> Vec<&TestResult> {
        fn walk<'a>(
            tests: &'a [TestResult],
            subjects: &'a [SubjectResult],
            out: &mut Vec<&'a TestResult>,
        ) {
            out.extend(tests.iter());
            for subject in subjects {
                walk(&subject.tests, &subject.subjects, out);
            }
        }

        let mut out = Vec::new();
        walk(&self.tests, &self.subjects, &mut out);
        out
    }
}

/// The per-submission mirror of a rubric tree.
#[derive(Debug, Clone, Serialize)]
pub struct ResultTree {
    pub base: CategoryResult,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bonus: Option<CategoryResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty: Option<CategoryResult>,
}

impl ResultTree {
    /// Additive points contributed by the bonus category.
    pub fn bonus_points(&self) -> f64 {
        self.bonus
            .as_ref()
            .map(|c| c.score * c.weight / 100.0)
            .unwrap_or(0.0)
    }

    /// Subtractive points contributed by the penalty category.
    pub fn penalty_points(&self) -> f64 {
        self.penalty
            .as_ref()
            .map(|c| c.score * c.weight / 100.0)
            .unwrap_or(0.0)
    }

    /// The final score: base plus bonus offset minus penalty offset,
    /// clamped to `[0, 100]`.
    pub fn final_score(&self) -> f64 {
        (self.base.score + self.bonus_points() - self.penalty_points()).clamp(0.0, 100.0)
    }
}

/// Executes a rubric tree against one submission.
pub struct Grader<'a> {
    submission: &'a Submission,
    sandbox: Option<&'a SandboxHandle>,
}

impl<'a> Grader<'a> {
    /// `sandbox` must be `Some` iff the template requires one and the
    /// preflight stage acquired it.
    pub fn new(submission: &'a Submission, sandbox: Option<&'a SandboxHandle>) -> Self {
        Self {
            submission,
            sandbox,
        }
    }

    /// Grades the full tree, returning the final score and the mirror
    /// result tree.
    pub async fn grade(&self, tree: &RubricTree) -> (f64, ResultTree) {
        let base = self.grade_category(&tree.base).await;
        let bonus = match &tree.bonus {
            Some(node) => Some(self.grade_category(node).await),
            None => None,
        };
        let penalty = match &tree.penalty {
            Some(node) => Some(self.grade_category(node).await),
            None => None,
        };

        let result = ResultTree {
            base,
            bonus,
            penalty,
        };
        (result.final_score(), result)
    }

    async fn grade_category(&self, node: &CategoryNode) -> CategoryResult {
        let mut tests = Vec::with_capacity(node.tests.len());
        for test in &node.tests {
            tests.push(self.run_test(test).await);
        }

        let mut subjects = Vec::with_capacity(node.subjects.len());
        for subject in &node.subjects {
            subjects.push(self.grade_subject(subject).await);
        }

        let score = aggregate(&tests, &subjects, node.subjects_weight);
        CategoryResult {
            kind: node.kind,
            weight: node.weight,
            score,
            tests,
            subjects,
            subjects_weight: node.subjects_weight,
        }
    }

    fn grade_subject<'s>(
        &'s self,
        node: &'s SubjectNode,
    ) -> futures::future::BoxFuture<'s, SubjectResult> {
        Box::pin(async move {
            let mut tests = Vec::with_capacity(node.tests.len());
            for test in &node.tests {
                tests.push(self.run_test(test).await);
            }

            let mut subjects = Vec::with_capacity(node.subjects.len());
            for subject in &node.subjects {
                subjects.push(self.grade_subject(subject).await);
            }

            let score = aggregate(&tests, &subjects, node.subjects_weight);
            SubjectResult {
                name: node.name.clone(),
                weight: node.weight,
                score,
                tests,
                subjects,
                subjects_weight: node.subjects_weight,
            }
        })
    }

    /// Runs one test inside the recovery boundary.
    async fn run_test(&self, node: &TestNode) -> TestResult {
        let files = self.submission.select(node.file.as_ref());
        let params = resolve_params(&node.params, self.submission.language);

        debug!(test = %node.name, files = files.len(), "running test");

        let execution =
            AssertUnwindSafe(node.func.execute(&files, self.sandbox, &params)).catch_unwind();

        let (score, report, metadata) = match execution.await {
            Ok(Ok(outcome)) => (
                outcome.score.clamp(0.0, 100.0),
                outcome.report,
                outcome.metadata,
            ),
            Ok(Err(e)) => {
                warn!(test = %node.name, "test function failed: {e}");
                (0.0, format!("internal test error: {e}"), Params::new())
            }
            Err(_) => {
                warn!(test = %node.name, "test function panicked");
                (
                    0.0,
                    "internal test error: test function panicked".to_string(),
                    Params::new(),
                )
            }
        };

        TestResult {
            name: node.name.clone(),
            weight: node.weight,
            score,
            report,
            params,
            metadata,
        }
    }
}

/// Bottom-up score for one level.
///
/// Weights inside each group sum to 100 (or are all zero), so the
/// weighted mean is a plain `sum(score * weight) / 100`. A heterogeneous
/// level combines the two group scores with the `subjects_weight` split.
fn aggregate(tests: &[TestResult], subjects: &[SubjectResult], subjects_weight: Option<f64>) -> f64 {
    let tests_score: f64 = tests.iter().map(|t| t.score * t.weight / 100.0).sum();
    let subjects_score: f64 = subjects.iter().map(|s| s.score * s.weight / 100.0).sum();

    match (tests.is_empty(), subjects.is_empty()) {
        (false, true) => tests_score,
        (true, false) => subjects_score,
        (false, false) => {
            let split = subjects_weight.unwrap_or(0.0) / 100.0;
            subjects_score * split + tests_score * (1.0 - split)
        }
        (true, true) => 0.0,
    }
}
