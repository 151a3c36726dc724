//! Unified error types for the berth workspace.
//!
//! Build-time variants abort the pipeline at the step that raised them;
//! runtime variants surface as the container's terminal status.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BerthError {
    /// A build-context or image path does not exist, is not accessible,
    /// or escapes its root.
    #[error("invalid path {path}: {reason}")]
    InvalidPath {
        /// Offending path.
        path: PathBuf,
        /// Why the path was rejected.
        reason: String,
    },

    /// The dependency installer could not satisfy one or more manifest entries.
    #[error("dependency resolution failed: {}", unsatisfied.join(", "))]
    DependencyResolution {
        /// Requirements that could not be satisfied, as written in the manifest.
        unsatisfied: Vec<String>,
    },

    /// Account creation collided with an existing account name.
    #[error("account already exists: {name}")]
    AccountExists {
        /// Colliding login name.
        name: String,
    },

    /// The entry process exited with a non-zero status.
    #[error("entry process exited with status {code}")]
    EntryProcessFailure {
        /// Exit code, or `128 + signal` when terminated by a signal.
        code: i32,
    },

    /// A build step was invoked out of its mandatory order.
    #[error("step `{step}` cannot run {reason}")]
    StepOrder {
        /// Step that was rejected.
        step: &'static str,
        /// Ordering constraint that was violated.
        reason: String,
    },

    /// The build identity was already switched to an unprivileged account.
    #[error("identity is locked to `{current}`; cannot switch to `{requested}`")]
    IdentityLocked {
        /// Identity currently active.
        current: String,
        /// Identity that was requested.
        requested: String,
    },

    /// The unprivileged account cannot read or execute image content.
    #[error("account `{account}` cannot access {} path(s): {}", paths.len(), paths.join(", "))]
    AccessDenied {
        /// Account that was audited.
        account: String,
        /// Image paths the account cannot access.
        paths: Vec<String>,
    },

    /// The entry command is empty or otherwise unusable.
    #[error("invalid entry command: {message}")]
    InvalidEntryCommand {
        /// Description of the problem.
        message: String,
    },

    /// A recipe, manifest, or environment file could not be parsed.
    #[error("{file}:{line}: {message}")]
    Recipe {
        /// File being parsed.
        file: String,
        /// One-based line number.
        line: usize,
        /// Description of the parse failure.
        message: String,
    },

    /// An external collaborator failed; its message is surfaced verbatim.
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        /// Name of the failing collaborator.
        collaborator: &'static str,
        /// Verbatim failure text.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A hash validation failed.
    #[error("hash mismatch for {resource}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Resource that failed validation.
        resource: String,
        /// Expected hash value.
        expected: String,
        /// Actual computed hash value.
        actual: String,
    },

    /// A permission or privilege error.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl BerthError {
    /// Wraps an I/O error with the path it occurred at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns the process exit code the CLI should report for this error.
    ///
    /// Entry-process failures propagate the container's own status; every
    /// other error maps to `1`.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::EntryProcessFailure { code } => *code,
            _ => 1,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BerthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_resolution_lists_unsatisfied_entries() {
        let err = BerthError::DependencyResolution {
            unsatisfied: vec!["libfoo==999.0".into(), "libbar".into()],
        };
        assert_eq!(
            err.to_string(),
            "dependency resolution failed: libfoo==999.0, libbar"
        );
    }

    #[test]
    fn exit_code_propagates_entry_status() {
        assert_eq!(BerthError::EntryProcessFailure { code: 3 }.exit_code(), 3);
        let err = BerthError::AccountExists {
            name: "bot".into(),
        };
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn recipe_error_cites_file_and_line() {
        let err = BerthError::Recipe {
            file: "requirements.txt".into(),
            line: 4,
            message: "expected version".into(),
        };
        assert_eq!(err.to_string(), "requirements.txt:4: expected version");
    }
}
