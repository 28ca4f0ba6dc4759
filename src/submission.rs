//! Student submission model.
//!
//! A submission is created by the API layer and is immutable through
//! pipeline execution. Test functions receive borrowed views of its files.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::{FileSelector, Language};

/// A student's submitted files for one assignment.
///
/// Identity is `(assignment_id, user_id)`. The file mapping is keyed by
/// filename; insertion order is immaterial.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub assignment_id: String,
    pub user_id: String,

    /// Display name, used in rendered feedback.
    pub username: String,

    /// Runtime tag, when the assignment involves program execution.
    pub language: Option<Language>,

    /// When the submission entered the service.
    pub created_at: chrono::DateTime<chrono::Utc>,

    #[serde(skip)]
    files: BTreeMap<String, Vec<u8>>,
}

impl Submission {
    pub fn new(
        assignment_id: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            assignment_id: assignment_id.into(),
            user_id: user_id.into(),
            username: username.into(),
            language: None,
            created_at: chrono::Utc::now(),
            files: BTreeMap::new(),
        }
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.language = Some(language);
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(name.into(), content.into());
        self
    }

    /// Reads every regular file in `dir` (non-recursive) into a submission.
    ///
    /// Used by the CLI; the API layer constructs submissions directly.
    pub async fn from_dir(
        assignment_id: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
        dir: &Path,
    ) -> Result<Self> {
        let mut submission = Self::new(assignment_id, user_id, username);

        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to read submission dir: {}", dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let content = tokio::fs::read(entry.path())
                .await
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            submission.files.insert(name, content);
        }

        Ok(submission)
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<SubmissionFile<'_>> {
        self.files
            .get_key_value(name)
            .map(|(name, content)| SubmissionFile { name, content })
    }

    /// The full file mapping, for sandbox upload.
    pub fn files(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.files
    }

    /// Materializes the files a test receives for the given selector.
    ///
    /// `None` selects nothing. Missing filenames are silently skipped; the
    /// test function decides whether an empty selection is a failure.
    pub fn select(&self, selector: Option<&FileSelector>) -> Vec<SubmissionFile<'_>> {
        match selector {
            None => Vec::new(),
            Some(FileSelector::All) => self
                .files
                .iter()
                .map(|(name, content)| SubmissionFile { name, content })
                .collect(),
            Some(FileSelector::One(name)) => self.get(name).into_iter().collect(),
            Some(FileSelector::Many(names)) => {
                names.iter().filter_map(|name| self.get(name)).collect()
            }
        }
    }
}

/// A read-only borrow of one submission file.
#[derive(Debug, Clone, Copy)]
pub struct SubmissionFile<'a> {
    pub name: &'a str,
    pub content: &'a [u8],
}

impl SubmissionFile<'_> {
    /// The file content as UTF-8 text, lossily converted.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.content)
    }
}
