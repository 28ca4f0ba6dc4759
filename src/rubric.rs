//! The rubric tree: immutable, weight-normalized grading criteria.
//!
//! A [`RubricTree`] is built once per grading configuration from a
//! [`RubricConfig`](crate::config::RubricConfig) and a
//! [`Template`](crate::template::Template) (see [`builder`]), then shared
//! read-only across every execution that grades against it.
//!
//! Test functions are resolved during the build and embedded in leaf
//! nodes, so grading never consults the template registry. Sibling
//! weights are normalized so each group sums to 100 (or stays all-zero);
//! a level holding both subjects and direct tests records the configured
//! `subjects_weight` split between the two groups.

pub mod builder;

use std::sync::Arc;

use serde::Serialize;

use crate::config::{FileSelector, Params};
use crate::template::TestFunction;

/// Which top-level category a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryKind {
    /// The graded score itself, in `[0, 100]`.
    Base,
    /// Additive points, capped by the category weight.
    Bonus,
    /// Subtractive points, capped by the category weight.
    Penalty,
}

/// A resolved test leaf.
///
/// Carries the test function reference resolved at build time; the
/// grader never performs name lookups.
#[derive(Clone, Serialize)]
pub struct TestNode {
    pub name: String,

    /// Normalized weight among sibling tests (sums to 100 per group).
    pub weight: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileSelector>,

    pub params: Params,

    #[serde(skip)]
    pub func: Arc<dyn TestFunction>,
}

impl std::fmt::Debug for TestNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestNode")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("file", &self.file)
            .finish()
    }
}

/// A named subject holding tests and/or nested subjects.
#[derive(Debug, Clone, Serialize)]
pub struct SubjectNode {
    pub name: String,

    /// Normalized weight among sibling subjects.
    pub weight: f64,

    pub tests: Vec<TestNode>,
    pub subjects: Vec<SubjectNode>,

    /// Percentage (0-100) allocated to the subjects group; present iff
    /// this level holds both tests and subjects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subjects_weight: Option<f64>,
}

/// A top-level rubric category.
///
/// `weight` keeps its configured (unnormalized) value: for bonus and
/// penalty it is the point budget applied at root aggregation.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryNode {
    pub kind: CategoryKind,
    pub weight: f64,

    pub tests: Vec<TestNode>,
    pub subjects: Vec<SubjectNode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subjects_weight: Option<f64>,
}

/// The immutable rubric tree shared by all executions of a pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct RubricTree {
    pub base: CategoryNode,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bonus: Option<CategoryNode>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty: Option<CategoryNode>,
}

impl RubricTree {
    /// Total number of test leaves across all categories.
    pub fn test_count(&self) -> usize {
        fn count_subject(subject: &SubjectNode) -> usize {
            subject.tests.len() + subject.subjects.iter().map(count_subject).sum::<usize>()
        }
        fn count_category(category: &CategoryNode) -> usize {
            category.tests.len() + category.subjects.iter().map(count_subject).sum::<usize>()
        }

        count_category(&self.base)
            + self.bonus.as_ref().map(count_category).unwrap_or(0)
            + self.penalty.as_ref().map(count_category).unwrap_or(0)
    }

    /// Canonical JSON serialization (test functions elided, map keys
    /// ordered). Two trees built from the same config serialize
    /// identically.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("rubric tree serialization cannot fail")
    }
}
