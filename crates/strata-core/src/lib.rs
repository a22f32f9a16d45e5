//! Strata Core Library
//!
//! Layered settings store: per-scope JSON files (user, project-shared,
//! project-local, enterprise) plus an ephemeral command-line layer, merged
//! into effective values by a fixed precedence order and a per-key merge
//! policy. Writes are compare-and-swap per file; external edits are picked
//! up by a file watcher and pushed to subscribers.

pub mod document;
pub mod error;
pub mod file_store;
pub mod key;
pub mod options;
pub mod project;
pub mod resolver;
pub mod scope;
pub mod store;
pub mod watcher;

pub use error::{StoreError, StoreResult};

/// Re-exports of commonly used types
pub mod prelude {
    // Scopes
    pub use crate::scope::{CommandLineLayer, ProjectPaths, Scope, ScopeLocator};

    // Keys and resolution
    pub use crate::key::{ConfigKey, KeyDefault, ListMerge, MergePolicy};
    pub use crate::resolver::{EffectiveValue, ScopeWarning, resolve, split_by_provenance};

    // Storage
    pub use crate::document::BackingDocument;
    pub use crate::file_store::FileStore;
    pub use crate::store::{ConfigStore, Snapshot, Subscription};
    pub use crate::watcher::ChangeWatcher;

    // Project
    pub use crate::project::{ProjectContext, ProjectSubscription};

    // Options and errors
    pub use crate::error::{StoreError, StoreResult};
    pub use crate::options::StoreOptions;
}
