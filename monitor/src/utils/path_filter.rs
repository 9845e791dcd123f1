//! Exclusion patterns for watched paths.
//!
//! Patterns are globs in [`globset`] syntax. A bare name without glob
//! metacharacters or separators (`target`, `.git`) excludes any directory or
//! file of that name anywhere in the tree. Patterns are matched against the
//! absolute path and against the path relative to each watched root, so
//! `src/generated/**` works without spelling out the project prefix.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::config::ConfigError;

/// A compiled set of exclusion patterns.
#[derive(Debug, Clone)]
pub struct PathFilter {
    set: GlobSet,
    roots: Vec<PathBuf>,
}

impl PathFilter {
    /// Compiles `patterns`, resolving relative matches against `roots`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for a pattern that is not a valid glob.
    pub fn new(patterns: &[String], roots: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            for expanded in expand_pattern(pattern) {
                let glob = Glob::new(&expanded).map_err(|e| ConfigError::InvalidValue {
                    key: "TESTWATCH_EXCLUDE_PATHS".to_string(),
                    message: format!("invalid pattern '{pattern}': {e}"),
                })?;
                builder.add(glob);
            }
        }
        let set = builder.build().map_err(|e| ConfigError::InvalidValue {
            key: "TESTWATCH_EXCLUDE_PATHS".to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            set,
            roots: roots.to_vec(),
        })
    }

    /// A filter that excludes nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            set: GlobSet::empty(),
            roots: Vec::new(),
        }
    }

    /// Returns true if changes to `path` should be ignored.
    #[must_use]
    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.set.is_empty() {
            return false;
        }
        if self.set.is_match(path) {
            return true;
        }
        self.roots
            .iter()
            .filter_map(|root| path.strip_prefix(root).ok())
            .any(|relative| self.set.is_match(relative))
    }
}

fn expand_pattern(pattern: &str) -> Vec<String> {
    let trimmed = pattern.trim().trim_end_matches('/');
    let is_bare_name = !trimmed.is_empty()
        && !trimmed.contains(['*', '?', '[', '{', '/', '\\']);
    if is_bare_name {
        vec![format!("**/{trimmed}"), format!("**/{trimmed}/**")]
    } else {
        vec![trimmed.to_string()]
    }
}
