//! Feedback generation: focus ranking and report rendering.
//!
//! After grading, the pipeline computes a [`Focus`](focus::Focus) - the
//! failed tests of each category ranked by how many final-score points
//! their failure cost - and renders a report through a
//! [`FeedbackReporter`]. The [`render::StructuredRenderer`] is the
//! built-in implementation; AI-backed reporters are external
//! collaborators plugging into the same trait.

pub mod focus;
pub mod render;

pub use focus::{Focus, FocusEntry};
pub use render::StructuredRenderer;

use async_trait::async_trait;

use crate::config::FeedbackConfig;
use crate::grader::ResultTree;
use crate::submission::Submission;

/// Everything a reporter needs to produce a report.
pub struct FeedbackInput<'a> {
    pub submission: &'a Submission,
    pub final_score: f64,
    pub result: &'a ResultTree,
    pub focus: &'a Focus,
    pub config: &'a FeedbackConfig,
}

/// Renders a human-readable report for a graded submission.
///
/// Implementations must not assume anything beyond the input: the same
/// reporter instance serves concurrent pipeline executions.
#[async_trait]
pub trait FeedbackReporter: Send + Sync {
    async fn render(&self, input: &FeedbackInput<'_>) -> anyhow::Result<String>;
}
