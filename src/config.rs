//! Configuration loading for the grading service.
//!
//! Rubric and setup documents are JSON (the shape teachers submit through
//! the API layer); the service-level file is TOML. See [`schema`] for the
//! full type definitions.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads the service configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, contains invalid TOML, or
/// doesn't match the [`ServiceConfig`] schema.
pub fn load_service_config(path: &Path) -> Result<ServiceConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read service config: {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse service config: {}", path.display()))
}

/// Loads a rubric configuration from a JSON file.
pub fn load_rubric_config(path: &Path) -> Result<RubricConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rubric: {}", path.display()))?;

    parse_rubric_config(&content)
}

/// Parses a rubric configuration from a JSON string.
///
/// Useful for testing and for callers that already hold the document
/// (e.g. an API layer reading it from a database row).
pub fn parse_rubric_config(content: &str) -> Result<RubricConfig> {
    serde_json::from_str(content).context("Failed to parse rubric config")
}

/// Loads a setup configuration from a JSON file.
pub fn load_setup_config(path: &Path) -> Result<SetupConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read setup config: {}", path.display()))?;

    parse_setup_config(&content)
}

/// Parses a setup configuration from a JSON string.
pub fn parse_setup_config(content: &str) -> Result<SetupConfig> {
    serde_json::from_str(content).context("Failed to parse setup config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rubric_rejects_missing_base() {
        let result = parse_rubric_config(r#"{"bonus": {"weight": 20}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_rubric_full_document() {
        let rubric = parse_rubric_config(
            r#"{
                "base": {
                    "weight": 100,
                    "subjects": [
                        {"name": "HTML", "weight": 50, "tests": [
                            {"name": "has_tag", "params": {"tag": "nav", "required_count": 1}}
                        ]},
                        {"name": "CSS", "weight": 50, "tests": [
                            {"name": "has_style", "file": "style.css",
                             "params": {"prop": "display", "value": "flex"}}
                        ]}
                    ]
                },
                "bonus": {"weight": 20, "tests": [
                    {"name": "check_media_queries", "file": "all", "params": {"required_count": 2}}
                ]},
                "penalty": {"weight": 10, "tests": [
                    {"name": "has_forbidden_tag", "params": {"tag": "script"}}
                ]}
            }"#,
        )
        .unwrap();

        assert_eq!(rubric.base.subjects.len(), 2);
        assert_eq!(rubric.bonus.as_ref().unwrap().weight, 20.0);
        assert_eq!(
            rubric.bonus.unwrap().tests[0].file,
            Some(FileSelector::All)
        );
        assert_eq!(rubric.penalty.unwrap().weight, 10.0);
    }

    #[test]
    fn test_parse_setup_multi_language() {
        let setup = parse_setup_config(
            r#"{
                "java": {"required_files": ["Calc.java"],
                         "setup_commands": [{"name": "compile", "command": "javac Calc.java"}]},
                "python": {"required_files": ["calc.py"]}
            }"#,
        )
        .unwrap();

        assert!(setup.resolve(Some(Language::Java)).is_some());
        assert!(setup.resolve(Some(Language::Python)).is_some());
        assert!(setup.resolve(Some(Language::C)).is_none());
    }
}
