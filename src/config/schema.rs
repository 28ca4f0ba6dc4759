//! Configuration schema definitions for the grading service.
//!
//! This module defines all configuration types that can be deserialized from
//! JSON (rubric and setup documents submitted by teachers) or TOML (the
//! service-level file read at startup). The schema uses serde throughout,
//! with untagged enums where the wire format accepts several shapes.
//!
//! # Schema Overview
//!
//! ```text
//! ServiceConfig (TOML, process-wide)
//! ├── pools            - per-language sandbox pool settings
//! ├── docker           - daemon address and runtime selection
//! └── feedback         - default rendering options
//!
//! RubricConfig (JSON, one per grading configuration)
//! ├── base             - required category
//! ├── bonus            - optional additive category
//! └── penalty          - optional subtractive category
//!     └── subjects / tests, recursively
//!
//! SetupConfig (JSON, optional per grading configuration)
//! └── per-language { required_files, setup_commands }, or a flat block
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};

/// A supported submission runtime.
///
/// The language tag selects the sandbox pool, the canonical execution
/// command, and the per-language branch of setup configurations and
/// multi-language command parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Java,
    Node,
    C,
    Cpp,
}

impl Language {
    /// All supported languages, in a fixed order.
    pub const ALL: [Language; 5] = [
        Language::Python,
        Language::Java,
        Language::Node,
        Language::C,
        Language::Cpp,
    ];

    /// The lowercase tag used in configuration documents.
    pub fn tag(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Java => "java",
            Language::Node => "node",
            Language::C => "c",
            Language::Cpp => "cpp",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "node" | "javascript" | "js" => Ok(Language::Node),
            "c" => Ok(Language::C),
            "cpp" | "c++" => Ok(Language::Cpp),
            other => Err(format!("unknown language tag: {other}")),
        }
    }
}

/// A configurable test parameter value.
///
/// Parameter maps are free-form JSON objects. Two shapes carry special
/// meaning during command resolution (see [`crate::command`]):
///
/// - the string `"CMD"` is replaced with the canonical default command for
///   the submission language;
/// - a map whose keys are all language tags is replaced with the entry for
///   the submission language (or the empty string when absent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

/// A test's parameter map, ordered for canonical serialization.
pub type Params = BTreeMap<String, ParamValue>;

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_f64().filter(|n| *n >= 0.0).map(|n| n as u64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ParamValue]> {
        match self {
            ParamValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ParamValue>> {
        match self {
            ParamValue::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::String(s.to_string())
    }
}

impl From<f64> for ParamValue {
    fn from(n: f64) -> Self {
        ParamValue::Number(n)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

/// Selects which submission files are passed to a test function.
///
/// Accepted wire shapes: the sentinel string `"all"`, a single filename,
/// or a list of filenames.
#[derive(Debug, Clone, PartialEq)]
pub enum FileSelector {
    /// Pass the entire submission file mapping.
    All,
    /// Pass the single matching file, if present.
    One(String),
    /// Pass each matching file.
    Many(Vec<String>),
}

impl Serialize for FileSelector {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FileSelector::All => serializer.serialize_str("all"),
            FileSelector::One(name) => serializer.serialize_str(name),
            FileSelector::Many(names) => names.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for FileSelector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SelectorVisitor;

        impl<'de> Visitor<'de> for SelectorVisitor {
            type Value = FileSelector;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("\"all\", a filename, or a list of filenames")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<FileSelector, E> {
                if value.eq_ignore_ascii_case("all") {
                    Ok(FileSelector::All)
                } else {
                    Ok(FileSelector::One(value.to_string()))
                }
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<FileSelector, A::Error> {
                let mut names = Vec::new();
                while let Some(name) = seq.next_element::<String>()? {
                    names.push(name);
                }
                Ok(FileSelector::Many(names))
            }
        }

        deserializer.deserialize_any(SelectorVisitor)
    }
}

/// A single test entry in a rubric category or subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    /// Test name; must resolve in the template's function registry.
    pub name: String,

    /// Relative weight among sibling tests. Unnormalized.
    #[serde(default = "default_sibling_weight")]
    pub weight: f64,

    /// Which submission files the test receives. Absent means none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileSelector>,

    /// Free-form parameters forwarded to the test function.
    #[serde(default)]
    pub params: Params,
}

/// A named, recursively nested subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectConfig {
    pub name: String,

    /// Relative weight among sibling subjects. Unnormalized.
    #[serde(default = "default_sibling_weight")]
    pub weight: f64,

    #[serde(default)]
    pub tests: Vec<TestSpec>,

    #[serde(default)]
    pub subjects: Vec<SubjectConfig>,

    /// Percentage (0-100) of this subject allocated to the nested subjects
    /// group. Required when both `tests` and `subjects` are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subjects_weight: Option<f64>,
}

/// A top-level rubric category (`base`, `bonus`, or `penalty`).
///
/// For `bonus` and `penalty` the weight is a point budget: `weight = 20`
/// on a bonus category means "up to 20 additive points".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub weight: f64,

    #[serde(default)]
    pub tests: Vec<TestSpec>,

    #[serde(default)]
    pub subjects: Vec<SubjectConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subjects_weight: Option<f64>,
}

/// A complete rubric document, as configured by the teacher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubricConfig {
    pub base: CategoryConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bonus: Option<CategoryConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalty: Option<CategoryConfig>,
}

fn default_sibling_weight() -> f64 {
    1.0
}

/// One entry in a setup block's command list.
///
/// The wire format accepts either `{"name": ..., "command": ...}` or a bare
/// command string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SetupCommand {
    Named { name: String, command: String },
    Plain(String),
}

impl SetupCommand {
    /// Display name for trace and error payloads.
    pub fn name(&self) -> &str {
        match self {
            SetupCommand::Named { name, .. } => name,
            SetupCommand::Plain(command) => command,
        }
    }

    pub fn command(&self) -> &str {
        match self {
            SetupCommand::Named { command, .. } => command,
            SetupCommand::Plain(command) => command,
        }
    }
}

/// Required files and setup commands for one language.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupBlock {
    #[serde(default)]
    pub required_files: Vec<String>,

    #[serde(default)]
    pub setup_commands: Vec<SetupCommand>,
}

/// Preflight setup configuration.
///
/// The preferred shape maps language tags to setup blocks. A flat block
/// without language keys is also accepted and applies to all languages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SetupConfig {
    PerLanguage(BTreeMap<Language, SetupBlock>),
    Flat(SetupBlock),
}

impl SetupConfig {
    /// Resolves the setup block that applies to a submission.
    ///
    /// Returns `None` when a per-language configuration has no entry for
    /// the submission's language (or the submission carries no tag).
    pub fn resolve(&self, language: Option<Language>) -> Option<&SetupBlock> {
        match self {
            SetupConfig::Flat(block) => Some(block),
            SetupConfig::PerLanguage(map) => language.and_then(|lang| map.get(&lang)),
        }
    }
}

/// Per-language sandbox pool settings.
///
/// # Example
///
/// ```toml
/// [pools.python]
/// image = "autograder/python:3.12"
/// min_idle = 2
/// max_total = 8
/// idle_ttl_secs = 600
/// running_ttl_secs = 120
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Container image reference for this language's sandboxes.
    pub image: String,

    /// Idle sandboxes kept warm by the sweeper.
    #[serde(default = "default_min_idle")]
    pub min_idle: usize,

    /// Hard cap on idle + active sandboxes.
    #[serde(default = "default_max_total")]
    pub max_total: usize,

    /// Idle sandboxes beyond `min_idle` are destroyed after this long.
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    /// Active sandboxes are forcibly destroyed after this long without
    /// activity. Bounds every sandbox command.
    #[serde(default = "default_running_ttl")]
    pub running_ttl_secs: u64,

    /// How long `acquire` blocks on a saturated pool before failing.
    #[serde(default = "default_acquire_wait")]
    pub acquire_wait_secs: u64,
}

impl PoolSettings {
    /// Settings for the given image with every knob at its default.
    pub fn with_image(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            min_idle: default_min_idle(),
            max_total: default_max_total(),
            idle_ttl_secs: default_idle_ttl(),
            running_ttl_secs: default_running_ttl(),
            acquire_wait_secs: default_acquire_wait(),
        }
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn running_ttl(&self) -> Duration {
        Duration::from_secs(self.running_ttl_secs)
    }

    pub fn acquire_wait(&self) -> Duration {
        Duration::from_secs(self.acquire_wait_secs)
    }
}

fn default_min_idle() -> usize {
    2
}

fn default_max_total() -> usize {
    8
}

fn default_idle_ttl() -> u64 {
    600 // 10 minutes
}

fn default_running_ttl() -> u64 {
    120 // 2 minutes
}

fn default_acquire_wait() -> u64 {
    30
}

/// Docker daemon settings shared by all pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSettings {
    /// Daemon address. Defaults to the local socket.
    pub docker_host: Option<String>,

    /// Container runtime for enhanced kernel isolation (e.g. `runsc`).
    /// Falls back to the daemon default when the runtime is unavailable.
    pub runtime: Option<String>,

    /// Memory cap per sandbox, in bytes.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: i64,

    /// CPU cap per sandbox, in whole-CPU fractions.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f64,

    /// Process count cap per sandbox.
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
}

fn default_memory_limit() -> i64 {
    256 * 1024 * 1024
}

fn default_cpu_limit() -> f64 {
    1.0
}

fn default_pids_limit() -> i64 {
    128
}

impl Default for DockerSettings {
    fn default() -> Self {
        DockerSettings {
            docker_host: None,
            runtime: None,
            memory_limit: default_memory_limit(),
            cpu_limit: default_cpu_limit(),
            pids_limit: default_pids_limit(),
        }
    }
}

/// Per-category heading strings for the rendered report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryHeaders {
    #[serde(default = "default_base_header")]
    pub base: String,

    #[serde(default = "default_bonus_header")]
    pub bonus: String,

    #[serde(default = "default_penalty_header")]
    pub penalty: String,
}

impl Default for CategoryHeaders {
    fn default() -> Self {
        Self {
            base: default_base_header(),
            bonus: default_bonus_header(),
            penalty: default_penalty_header(),
        }
    }
}

fn default_base_header() -> String {
    "Requirements".to_string()
}

fn default_bonus_header() -> String {
    "Bonus".to_string()
}

fn default_penalty_header() -> String {
    "Penalties".to_string()
}

/// Rendering options for the structured feedback report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Document title, rendered first when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_title: Option<String>,

    /// Include the final numeric score line.
    #[serde(default = "default_true")]
    pub show_score: bool,

    /// Include passing tests in addition to failing ones.
    #[serde(default)]
    pub show_passed_tests: bool,

    /// Show each test's parameter snapshot under its bullet.
    #[serde(default)]
    pub show_test_parameters: bool,

    /// Append an overall summary block.
    #[serde(default)]
    pub add_report_summary: bool,

    #[serde(default)]
    pub category_headers: CategoryHeaders,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            report_title: None,
            show_score: true,
            show_passed_tests: false,
            show_test_parameters: false,
            add_report_summary: false,
            category_headers: CategoryHeaders::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Root service configuration, loaded from TOML at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Sandbox pools, keyed by language tag.
    #[serde(default)]
    pub pools: BTreeMap<Language, PoolSettings>,

    #[serde(default)]
    pub docker: DockerSettings,

    /// Default feedback rendering options.
    #[serde(default)]
    pub feedback: FeedbackConfig,
}
