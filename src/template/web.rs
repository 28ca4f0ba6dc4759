//! Built-in `web` template: static HTML/CSS/essay checks.
//!
//! These test functions operate purely on submitted file content and
//! never need a sandbox. The checks are regex-level by design - the
//! template exists to grade structure ("has a `<nav>`", "uses
//! `display: flex`"), not to validate documents.

use std::sync::Arc;

use async_trait::async_trait;
use regex::RegexBuilder;

use crate::config::{ParamValue, Params};
use crate::sandbox::SandboxHandle;
use crate::submission::SubmissionFile;
use crate::template::{FileKind, ParameterDescriptor, Template, TestFunction, TestOutcome};

/// The built-in `web` template with every check registered.
pub fn template() -> Template {
    Template::new("web", false)
        .register(Arc::new(HasTag))
        .register(Arc::new(HasForbiddenTag))
        .register(Arc::new(HasAttribute))
        .register(Arc::new(HasStyle))
        .register(Arc::new(CheckMediaQueries))
        .register(Arc::new(MinWordCount))
}

fn combined_text(files: &[SubmissionFile<'_>]) -> String {
    files.iter().map(|f| f.text().into_owned()).collect::<Vec<_>>().join("\n")
}

fn count_matches(pattern: &str, files: &[SubmissionFile<'_>]) -> anyhow::Result<usize> {
    let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
    Ok(regex.find_iter(&combined_text(files)).count())
}

fn str_param<'a>(params: &'a Params, name: &str) -> anyhow::Result<&'a str> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing required parameter '{name}'"))
}

fn count_param(params: &Params, name: &str, default: u64) -> u64 {
    params.get(name).and_then(|v| v.as_u64()).unwrap_or(default)
}

/// Proportional score for "found `count` of `required`" checks.
fn ratio_score(count: usize, required: u64) -> f64 {
    if required == 0 {
        return 100.0;
    }
    (count as f64 / required as f64 * 100.0).min(100.0)
}

/// Checks that an HTML tag appears at least `required_count` times.
pub struct HasTag;

#[async_trait]
impl TestFunction for HasTag {
    fn name(&self) -> &'static str {
        "has_tag"
    }

    fn parameters(&self) -> Vec<ParameterDescriptor> {
        vec![
            ParameterDescriptor {
                name: "tag",
                description: "HTML tag name to look for",
                param_type: "string",
            },
            ParameterDescriptor {
                name: "required_count",
                description: "Minimum number of occurrences (default 1)",
                param_type: "integer",
            },
        ]
    }

    fn required_file_kind(&self) -> Option<FileKind> {
        Some(FileKind::Html)
    }

    async fn execute(
        &self,
        files: &[SubmissionFile<'_>],
        _sandbox: Option<&SandboxHandle>,
        params: &Params,
    ) -> anyhow::Result<TestOutcome> {
        let tag = str_param(params, "tag")?;
        let required = count_param(params, "required_count", 1);

        if files.is_empty() {
            return Ok(TestOutcome::failed(format!(
                "no HTML files provided to look for <{tag}>"
            )));
        }

        let count = count_matches(&format!(r"<\s*{}[\s>/]", regex::escape(tag)), files)?;
        let outcome = if count as u64 >= required {
            TestOutcome::passed(format!("found {count} <{tag}> element(s)"))
        } else {
            TestOutcome::scored(
                ratio_score(count, required),
                format!("expected at least {required} <{tag}> element(s), found {count}"),
            )
        };
        Ok(outcome.with_metadata("count", ParamValue::Number(count as f64)))
    }
}

/// Scores 100 when a forbidden tag IS present. Meant for penalty
/// categories: finding the tag triggers the deduction.
pub struct HasForbiddenTag;

#[async_trait]
impl TestFunction for HasForbiddenTag {
    fn name(&self) -> &'static str {
        "has_forbidden_tag"
    }

    fn parameters(&self) -> Vec<ParameterDescriptor> {
        vec![ParameterDescriptor {
            name: "tag",
            description: "HTML tag that must not appear",
            param_type: "string",
        }]
    }

    fn required_file_kind(&self) -> Option<FileKind> {
        Some(FileKind::Html)
    }

    async fn execute(
        &self,
        files: &[SubmissionFile<'_>],
        _sandbox: Option<&SandboxHandle>,
        params: &Params,
    ) -> anyhow::Result<TestOutcome> {
        let tag = str_param(params, "tag")?;
        let count = count_matches(&format!(r"<\s*{}[\s>/]", regex::escape(tag)), files)?;

        let outcome = if count > 0 {
            TestOutcome::passed(format!("forbidden <{tag}> element found {count} time(s)"))
        } else {
            TestOutcome::failed(format!("no forbidden <{tag}> element found"))
        };
        Ok(outcome.with_metadata("count", ParamValue::Number(count as f64)))
    }
}

/// Checks for an HTML attribute, optionally with a specific value.
pub struct HasAttribute;

#[async_trait]
impl TestFunction for HasAttribute {
    fn name(&self) -> &'static str {
        "has_attribute"
    }

    fn parameters(&self) -> Vec<ParameterDescriptor> {
        vec![
            ParameterDescriptor {
                name: "attribute",
                description: "Attribute name to look for",
                param_type: "string",
            },
            ParameterDescriptor {
                name: "value",
                description: "Required attribute value (optional)",
                param_type: "string",
            },
            ParameterDescriptor {
                name: "required_count",
                description: "Minimum number of occurrences (default 1)",
                param_type: "integer",
            },
        ]
    }

    fn required_file_kind(&self) -> Option<FileKind> {
        Some(FileKind::Html)
    }

    async fn execute(
        &self,
        files: &[SubmissionFile<'_>],
        _sandbox: Option<&SandboxHandle>,
        params: &Params,
    ) -> anyhow::Result<TestOutcome> {
        let attribute = str_param(params, "attribute")?;
        let required = count_param(params, "required_count", 1);

        let pattern = match params.get("value").and_then(|v| v.as_str()) {
            Some(value) => format!(
                r#"{}\s*=\s*["']{}["']"#,
                regex::escape(attribute),
                regex::escape(value)
            ),
            None => format!(r#"\s{}\s*="#, regex::escape(attribute)),
        };
        let count = count_matches(&pattern, files)?;

        let outcome = if count as u64 >= required {
            TestOutcome::passed(format!("found '{attribute}' {count} time(s)"))
        } else {
            TestOutcome::scored(
                ratio_score(count, required),
                format!("expected '{attribute}' at least {required} time(s), found {count}"),
            )
        };
        Ok(outcome.with_metadata("count", ParamValue::Number(count as f64)))
    }
}

/// Checks that a CSS declaration `prop: value` appears.
pub struct HasStyle;

#[async_trait]
impl TestFunction for HasStyle {
    fn name(&self) -> &'static str {
        "has_style"
    }

    fn parameters(&self) -> Vec<ParameterDescriptor> {
        vec![
            ParameterDescriptor {
                name: "prop",
                description: "CSS property name",
                param_type: "string",
            },
            ParameterDescriptor {
                name: "value",
                description: "Required property value",
                param_type: "string",
            },
        ]
    }

    fn required_file_kind(&self) -> Option<FileKind> {
        Some(FileKind::Css)
    }

    async fn execute(
        &self,
        files: &[SubmissionFile<'_>],
        _sandbox: Option<&SandboxHandle>,
        params: &Params,
    ) -> anyhow::Result<TestOutcome> {
        let prop = str_param(params, "prop")?;
        let value = str_param(params, "value")?;

        if files.is_empty() {
            return Ok(TestOutcome::failed(format!(
                "no CSS files provided to look for '{prop}: {value}'"
            )));
        }

        let pattern = format!(
            r"{}\s*:\s*{}\s*[;}}\n]",
            regex::escape(prop),
            regex::escape(value)
        );
        let count = count_matches(&pattern, files)?;

        if count > 0 {
            Ok(TestOutcome::passed(format!("'{prop}: {value}' is used")))
        } else {
            Ok(TestOutcome::failed(format!("'{prop}: {value}' not found")))
        }
    }
}

/// Counts `@media` rules.
pub struct CheckMediaQueries;

#[async_trait]
impl TestFunction for CheckMediaQueries {
    fn name(&self) -> &'static str {
        "check_media_queries"
    }

    fn parameters(&self) -> Vec<ParameterDescriptor> {
        vec![ParameterDescriptor {
            name: "required_count",
            description: "Minimum number of @media rules (default 1)",
            param_type: "integer",
        }]
    }

    fn required_file_kind(&self) -> Option<FileKind> {
        Some(FileKind::Css)
    }

    async fn execute(
        &self,
        files: &[SubmissionFile<'_>],
        _sandbox: Option<&SandboxHandle>,
        params: &Params,
    ) -> anyhow::Result<TestOutcome> {
        let required = count_param(params, "required_count", 1);
        let count = count_matches(r"@media[\s(]", files)?;

        let outcome = if count as u64 >= required {
            TestOutcome::passed(format!("found {count} media quer(ies)"))
        } else {
            TestOutcome::scored(
                ratio_score(count, required),
                format!("expected at least {required} media quer(ies), found {count}"),
            )
        };
        Ok(outcome.with_metadata("count", ParamValue::Number(count as f64)))
    }
}

/// Essay check: total word count across the selected files.
pub struct MinWordCount;

#[async_trait]
impl TestFunction for MinWordCount {
    fn name(&self) -> &'static str {
        "min_word_count"
    }

    fn parameters(&self) -> Vec<ParameterDescriptor> {
        vec![ParameterDescriptor {
            name: "min_words",
            description: "Minimum number of words (default 100)",
            param_type: "integer",
        }]
    }

    fn required_file_kind(&self) -> Option<FileKind> {
        Some(FileKind::Essay)
    }

    async fn execute(
        &self,
        files: &[SubmissionFile<'_>],
        _sandbox: Option<&SandboxHandle>,
        params: &Params,
    ) -> anyhow::Result<TestOutcome> {
        let min_words = count_param(params, "min_words", 100);
        let words = combined_text(files).split_whitespace().count();

        let outcome = if words as u64 >= min_words {
            TestOutcome::passed(format!("{words} words (minimum {min_words})"))
        } else {
            TestOutcome::scored(
                ratio_score(words, min_words),
                format!("{words} words, expected at least {min_words}"),
            )
        };
        Ok(outcome.with_metadata("words", ParamValue::Number(words as f64)))
    }
}
