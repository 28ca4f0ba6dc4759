//! Rubric tree construction and validation.
//!
//! [`build`] validates a rubric configuration against a template and
//! produces the immutable [`RubricTree`]. All configuration errors are
//! caught here, before any submission is graded:
//!
//! 1. shape validation (every level holds tests, subjects, or both; a
//!    heterogeneous level carries a `subjects_weight` in `[0, 100]`),
//! 2. test-name resolution against the template registry,
//! 3. sibling weight normalization (`w_i <- w_i * 100 / sum`, all-zero
//!    groups stay zero).

use crate::config::{CategoryConfig, RubricConfig, SubjectConfig, TestSpec};
use crate::rubric::{CategoryKind, CategoryNode, RubricTree, SubjectNode, TestNode};
use crate::template::Template;

/// Errors detected while building a rubric tree.
#[derive(Debug, thiserror::Error)]
pub enum RubricError {
    /// A category or subject violates the structural rules. The path
    /// locates the offending node, e.g. `base/CSS/layout`.
    #[error("invalid rubric shape at {path}: {reason}")]
    InvalidShape { path: String, reason: String },

    /// A rubric test name has no entry in the template registry.
    #[error("test not in template: {0}")]
    TestNotInTemplate(String),

    /// A level holds both tests and subjects without a split.
    #[error("missing subjects_weight at {path}: level has both tests and subjects")]
    MissingSubjectsWeight { path: String },
}

/// Builds the immutable rubric tree for `config` against `template`.
pub fn build(config: &RubricConfig, template: &Template) -> Result<RubricTree, RubricError> {
    let base = build_category(CategoryKind::Base, &config.base, template, "base")?;
    let bonus = config
        .bonus
        .as_ref()
        .map(|c| build_category(CategoryKind::Bonus, c, template, "bonus"))
        .transpose()?;
    let penalty = config
        .penalty
        .as_ref()
        .map(|c| build_category(CategoryKind::Penalty, c, template, "penalty"))
        .transpose()?;

    Ok(RubricTree {
        base,
        bonus,
        penalty,
    })
}

fn build_category(
    kind: CategoryKind,
    config: &CategoryConfig,
    template: &Template,
    path: &str,
) -> Result<CategoryNode, RubricError> {
    check_weight(config.weight, path)?;
    let subjects_weight = check_level(
        &config.tests,
        &config.subjects,
        config.subjects_weight,
        path,
    )?;

    Ok(CategoryNode {
        kind,
        weight: config.weight,
        tests: build_tests(&config.tests, template, path)?,
        subjects: build_subjects(&config.subjects, template, path)?,
        subjects_weight,
    })
}

fn build_subject(
    config: &SubjectConfig,
    template: &Template,
    path: &str,
) -> Result<SubjectNode, RubricError> {
    check_weight(config.weight, path)?;
    let subjects_weight = check_level(
        &config.tests,
        &config.subjects,
        config.subjects_weight,
        path,
    )?;

    Ok(SubjectNode {
        name: config.name.clone(),
        weight: config.weight,
        tests: build_tests(&config.tests, template, path)?,
        subjects: build_subjects(&config.subjects, template, path)?,
        subjects_weight,
    })
}

fn build_subjects(
    configs: &[SubjectConfig],
    template: &Template,
    parent: &str,
) -> Result<Vec<SubjectNode>, RubricError> {
    let mut subjects = Vec::with_capacity(configs.len());
    for config in configs {
        let path = format!("{parent}/{}", config.name);
        subjects.push(build_subject(config, template, &path)?);
    }
    normalize(subjects.iter_mut().map(|s| &mut s.weight));
    Ok(subjects)
}

fn build_tests(
    specs: &[TestSpec],
    template: &Template,
    parent: &str,
) -> Result<Vec<TestNode>, RubricError> {
    let mut tests = Vec::with_capacity(specs.len());
    for spec in specs {
        check_weight(spec.weight, &format!("{parent}/{}", spec.name))?;
        let func = template
            .get(&spec.name)
            .ok_or_else(|| RubricError::TestNotInTemplate(spec.name.clone()))?;
        tests.push(TestNode {
            name: spec.name.clone(),
            weight: spec.weight,
            file: spec.file.clone(),
            params: spec.params.clone(),
            func,
        });
    }
    normalize(tests.iter_mut().map(|t| &mut t.weight));
    Ok(tests)
}

/// Validates one level's structure and returns the effective
/// `subjects_weight` (only kept when the level is heterogeneous).
fn check_level(
    tests: &[TestSpec],
    subjects: &[SubjectConfig],
    subjects_weight: Option<f64>,
    path: &str,
) -> Result<Option<f64>, RubricError> {
    match (tests.is_empty(), subjects.is_empty()) {
        (true, true) => Err(RubricError::InvalidShape {
            path: path.to_string(),
            reason: "level has neither tests nor subjects".to_string(),
        }),
        (false, false) => {
            let weight = subjects_weight
                .ok_or_else(|| RubricError::MissingSubjectsWeight {
                    path: path.to_string(),
                })?;
            if !(0.0..=100.0).contains(&weight) {
                return Err(RubricError::InvalidShape {
                    path: path.to_string(),
                    reason: format!("subjects_weight {weight} outside [0, 100]"),
                });
            }
            Ok(Some(weight))
        }
        // Homogeneous levels drop a stray subjects_weight.
        _ => Ok(None),
    }
}

fn check_weight(weight: f64, path: &str) -> Result<(), RubricError> {
    if weight < 0.0 || !weight.is_finite() {
        return Err(RubricError::InvalidShape {
            path: path.to_string(),
            reason: format!("weight {weight} must be a non-negative number"),
        });
    }
    Ok(())
}

/// Scales sibling weights so they sum to 100. A zero-sum group is left
/// all-zero.
fn normalize<'a>(weights: impl Iterator<Item = &'a mut f64>) {
    let weights: Vec<&mut f64> = weights.collect();
    let sum: f64 = weights.iter().map(|w| **w).sum();
    if sum == 0.0 {
        return;
    }
    for weight in weights {
        *weight = *weight * 100.0 / sum;
    }
}
