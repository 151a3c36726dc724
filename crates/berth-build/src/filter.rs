//! Build-context filtering through `.berthignore`.
//!
//! Patterns use gitignore semantics and are matched against paths relative
//! to the build context root.

use std::path::{Path, PathBuf};

use berth_common::constants::IGNORE_FILE;
use berth_common::error::{BerthError, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Ignore rules of one build context.
#[derive(Debug)]
pub struct ContextFilter {
    matcher: Gitignore,
    pattern_count: usize,
}

impl ContextFilter {
    /// Loads `.berthignore` from `context_dir`. A missing file matches nothing.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::Recipe` citing the line of an invalid pattern.
    pub fn load(context_dir: &Path) -> Result<Self> {
        let path = context_dir.join(IGNORE_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(BerthError::io(&path, e)),
        };
        Self::from_content(context_dir, &path, &content)
    }

    /// Builds the rules from pattern text.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::Recipe` citing the line of an invalid pattern.
    pub fn from_content(root: &Path, source: &Path, content: &str) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);
        let mut pattern_count = 0;
        for (index, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let _ = builder
                .add_line(Some(PathBuf::from(source)), trimmed)
                .map_err(|e| BerthError::Recipe {
                    file: source.display().to_string(),
                    line: index + 1,
                    message: e.to_string(),
                })?;
            pattern_count += 1;
        }
        let matcher = builder.build().map_err(|e| BerthError::Config {
            message: format!("invalid {IGNORE_FILE}: {e}"),
        })?;
        tracing::debug!(patterns = pattern_count, "context filter loaded");
        Ok(Self {
            matcher,
            pattern_count,
        })
    }

    /// Returns whether a context-relative path is excluded.
    #[must_use]
    pub fn is_ignored(&self, rel_path: &Path, is_dir: bool) -> bool {
        if rel_path.as_os_str().is_empty() {
            return false;
        }
        self.matcher
            .matched_path_or_any_parents(rel_path, is_dir)
            .is_ignore()
    }

    /// Returns the number of active patterns.
    #[must_use]
    pub const fn pattern_count(&self) -> usize {
        self.pattern_count
    }
}
