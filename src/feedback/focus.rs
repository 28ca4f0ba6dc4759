//! Impact ranking of failed tests.
//!
//! The impact of a failed test is the absolute number of final-score
//! points lost to its failure:
//!
//! ```text
//! impact = (100 - score)
//!          * product of ancestor weight fractions (including group splits)
//!          * test weight fraction
//!          * category budget multiplier
//! ```
//!
//! where the budget multiplier is 1 for the base category and
//! `weight / 100` for bonus and penalty. Within a category, entries sort
//! by impact descending; ties keep execution order.

use serde::Serialize;

use crate::grader::{CategoryResult, ResultTree, SubjectResult, TestResult};
use crate::rubric::CategoryKind;

/// One failed test and its cost in final-score points.
#[derive(Debug, Clone, Serialize)]
pub struct FocusEntry {
    pub test: TestResult,
    pub impact: f64,
}

/// Per-category focus rankings for one graded submission.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Focus {
    pub base: Vec<FocusEntry>,
    pub bonus: Vec<FocusEntry>,
    pub penalty: Vec<FocusEntry>,
}

impl Focus {
    /// Computes the focus ranking from a result tree.
    pub fn compute(result: &ResultTree) -> Self {
        Self {
            base: category_focus(&result.base),
            bonus: result.bonus.as_ref().map(category_focus).unwrap_or_default(),
            penalty: result
                .penalty
                .as_ref()
                .map(category_focus)
                .unwrap_or_default(),
        }
    }

    /// Total failed tests across all categories.
    pub fn failing_count(&self) -> usize {
        self.base.len() + self.bonus.len() + self.penalty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failing_count() == 0
    }
}

fn category_focus(category: &CategoryResult) -> Vec<FocusEntry> {
    let multiplier = match category.kind {
        CategoryKind::Base => 1.0,
        CategoryKind::Bonus | CategoryKind::Penalty => category.weight / 100.0,
    };

    let mut entries = Vec::new();
    walk(
        &category.tests,
        &category.subjects,
        category.subjects_weight,
        multiplier,
        &mut entries,
    );

    // Stable sort keeps in-order position for equal impacts.
    entries.sort_by(|a, b| {
        b.impact
            .partial_cmp(&a.impact)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    entries
}

fn walk(
    tests: &[TestResult],
    subjects: &[SubjectResult],
    subjects_weight: Option<f64>,
    fraction: f64,
    out: &mut Vec<FocusEntry>,
) {
    let (tests_split, subjects_split) = match (tests.is_empty(), subjects.is_empty()) {
        (false, false) => {
            let split = subjects_weight.unwrap_or(0.0) / 100.0;
            (1.0 - split, split)
        }
        _ => (1.0, 1.0),
    };

    for test in tests {
        if test.score < 100.0 {
            let impact = (100.0 - test.score) * fraction * tests_split * test.weight / 100.0;
            out.push(FocusEntry {
                test: test.clone(),
                impact,
            });
        }
    }

    for subject in subjects {
        walk(
            &subject.tests,
            &subject.subjects,
            subject.subjects_weight,
            fraction * subjects_split * subject.weight / 100.0,
            out,
        );
    }
}
