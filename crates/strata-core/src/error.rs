//! Error types for the configuration store.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::scope::Scope;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the store, its backing files and the project context.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A project-scoped path was requested while no project is active.
    #[error("Scope '{scope}' requires an active project")]
    ScopeRequiresProject { scope: Scope },

    /// The requested project root is missing or not a directory.
    #[error("Invalid project root {}: {reason}", path.display())]
    InvalidProjectRoot { path: PathBuf, reason: String },

    /// The backing file moved past the version the writer last saw.
    ///
    /// Handled by the store's retry loop; callers of `ConfigStore` never see it.
    #[error("Version conflict on {}: expected {expected}, found {actual}", path.display())]
    VersionConflict {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// Compare-and-swap kept conflicting until the retry budget ran out.
    #[error("Could not save {} after {attempts} attempts; the file keeps changing, retry the save", path.display())]
    WriteContention { path: PathBuf, attempts: u32 },

    /// The backing file is not a valid JSON object. It is left untouched on disk.
    #[error("Corrupt settings file {}{}: {message}", path.display(), scope_suffix(*scope))]
    CorruptStore {
        scope: Option<Scope>,
        path: PathBuf,
        message: String,
    },

    /// Writes into enterprise-managed or command-line values are refused.
    #[error("Scope '{scope}' is read-only")]
    UnwritableScope { scope: Scope },

    /// The ephemeral scope has no backing file.
    #[error("Scope '{scope}' is not persisted to disk")]
    NotPersisted { scope: Scope },

    #[error("Invalid config key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// A key path walks through a value that is not a JSON object.
    #[error("Cannot edit '{key}' in {}: '{segment}' is not a JSON object", path.display())]
    NotAContainer {
        key: String,
        segment: String,
        path: PathBuf,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Invalid store options: {0}")]
    Options(String),
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// True when the user can simply retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::WriteContention { .. })
    }

    /// True for problems that degrade a scope instead of failing the caller.
    pub fn is_warning(&self) -> bool {
        matches!(self, StoreError::CorruptStore { .. })
    }

    /// Attach the scope a file-level error was raised for.
    pub fn with_scope(self, scope: Scope) -> Self {
        match self {
            StoreError::CorruptStore { path, message, .. } => StoreError::CorruptStore {
                scope: Some(scope),
                path,
                message,
            },
            other => other,
        }
    }
}

fn scope_suffix(scope: Option<Scope>) -> String {
    scope.map(|s| format!(" ({s} scope)")).unwrap_or_default()
}
