//! The built-in structured feedback renderer.
//!
//! Produces a plain-text report: optional title, optional score line,
//! one block per category with its configured header, and one bullet per
//! failed test in impact order. Passing tests and parameter snapshots
//! are included when the rendering configuration asks for them.

use std::fmt::Write;

use async_trait::async_trait;

use super::{FeedbackInput, FeedbackReporter, FocusEntry};
use crate::grader::CategoryResult;

/// Deterministic text renderer; the default reporter for every pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredRenderer;

#[async_trait]
impl FeedbackReporter for StructuredRenderer {
    async fn render(&self, input: &FeedbackInput<'_>) -> anyhow::Result<String> {
        Ok(render_report(input))
    }
}

fn render_report(input: &FeedbackInput<'_>) -> String {
    let config = input.config;
    let mut out = String::new();

    if let Some(title) = &config.report_title {
        let _ = writeln!(out, "# {title}");
        out.push('\n');
    }

    let _ = writeln!(out, "Feedback for {}", input.submission.username);
    if config.show_score {
        let _ = writeln!(out, "Final score: {:.1}/100", input.final_score);
    }

    render_category(
        &mut out,
        &config.category_headers.base,
        &input.result.base,
        &input.focus.base,
        config,
    );
    if let Some(bonus) = &input.result.bonus {
        render_category(
            &mut out,
            &config.category_headers.bonus,
            bonus,
            &input.focus.bonus,
            config,
        );
    }
    if let Some(penalty) = &input.result.penalty {
        render_category(
            &mut out,
            &config.category_headers.penalty,
            penalty,
            &input.focus.penalty,
            config,
        );
    }

    if config.add_report_summary {
        render_summary(&mut out, input);
    }

    out
}

fn render_category(
    out: &mut String,
    header: &str,
    category: &CategoryResult,
    focus: &[FocusEntry],
    config: &crate::config::FeedbackConfig,
) {
    let _ = writeln!(out, "\n## {header}");

    if focus.is_empty() {
        let _ = writeln!(out, "All checks passed.");
    }

    for entry in focus {
        let _ = writeln!(
            out,
            "- {} ({:.1} points lost): {}",
            entry.test.name, entry.impact, entry.test.report
        );
        if config.show_test_parameters && !entry.test.params.is_empty() {
            let params =
                serde_json::to_string(&entry.test.params).unwrap_or_else(|_| "{}".to_string());
            let _ = writeln!(out, "    parameters: {params}");
        }
    }

    if config.show_passed_tests {
        for test in category.tests_in_order() {
            if test.passed() {
                let _ = writeln!(out, "- [passed] {}: {}", test.name, test.report);
            }
        }
    }
}

fn render_summary(out: &mut String, input: &FeedbackInput<'_>) {
    let all: Vec<_> = [Some(&input.result.base)]
        .into_iter()
        .chain([input.result.bonus.as_ref(), input.result.penalty.as_ref()])
        .flatten()
        .flat_map(|c| c.tests_in_order())
        .collect();
    let passed = all.iter().filter(|t| t.passed()).count();

    let _ = writeln!(out, "\n## Summary");
    let _ = writeln!(out, "{passed} of {} checks passed.", all.len());

    let bonus = input.result.bonus_points();
    if bonus > 0.0 {
        let _ = writeln!(out, "Bonus points earned: {bonus:.1}");
    }
    let penalty = input.result.penalty_points();
    if penalty > 0.0 {
        let _ = writeln!(out, "Points deducted: {penalty:.1}");
    }
}
