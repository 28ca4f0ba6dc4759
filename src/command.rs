//! Execution-command resolution for test parameters.
//!
//! Rubric test parameters may specify the program command three ways:
//!
//! - a plain string, used as-is,
//! - a mapping from language tag to command, resolved against the
//!   submission's language (a miss yields the empty string, which makes
//!   the test fail at runtime instead of aborting the grade),
//! - the sentinel `"CMD"`, replaced with the canonical default command
//!   for the submission's language.
//!
//! Canonical defaults are a fixed table; there is no dynamic discovery.

use crate::config::{Language, ParamValue, Params};

/// Placeholder token meaning "auto-resolve the default command".
pub const COMMAND_PLACEHOLDER: &str = "CMD";

/// The canonical execution command for each language.
pub fn default_command(language: Language) -> &'static str {
    match language {
        Language::Python => "python3 main.py",
        Language::Java => "java Main",
        Language::Node => "node index.js",
        Language::C | Language::Cpp => "./a.out",
    }
}

/// Materializes a test's parameter map for one submission.
///
/// Command placeholders and per-language command maps are replaced with
/// concrete strings; everything else is carried over untouched. The
/// returned map is the parameter snapshot stored in the result tree.
pub fn resolve_params(params: &Params, language: Option<Language>) -> Params {
    params
        .iter()
        .map(|(key, value)| (key.clone(), resolve_value(value, language)))
        .collect()
}

fn resolve_value(value: &ParamValue, language: Option<Language>) -> ParamValue {
    match value {
        ParamValue::String(s) if s == COMMAND_PLACEHOLDER => {
            ParamValue::String(language.map(default_command).unwrap_or("").to_string())
        }
        ParamValue::Map(map) if is_command_map(map) => {
            let command = language
                .and_then(|lang| map.get(lang.tag()))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            ParamValue::String(command.to_string())
        }
        other => other.clone(),
    }
}

/// A map is a per-language command dictionary when every key is a known
/// language tag and every value is a string.
fn is_command_map(map: &std::collections::BTreeMap<String, ParamValue>) -> bool {
    !map.is_empty()
        && map.iter().all(|(key, value)| {
            key.parse::<Language>().is_ok() && matches!(value, ParamValue::String(_))
        })
}
