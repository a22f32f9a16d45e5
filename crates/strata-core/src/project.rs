//! Current project selection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::scope::{ProjectPaths, Scope};
use crate::store::ConfigStore;

type ProjectCallback = Arc<dyn Fn(Option<&Path>) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    callbacks: BTreeMap<u64, ProjectCallback>,
}

/// Holds the active project and switches the store along with it.
pub struct ProjectContext {
    store: Arc<ConfigStore>,
    listeners: Arc<Mutex<Listeners>>,
}

impl ProjectContext {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            listeners: Arc::new(Mutex::new(Listeners::default())),
        }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Make `path` the current project.
    ///
    /// The directory must exist; it is canonicalized before use. Returns the
    /// canonical root. Selecting the current project again is a no-op.
    pub fn switch_project(&self, path: &Path) -> StoreResult<PathBuf> {
        let invalid = |reason: String| StoreError::InvalidProjectRoot {
            path: path.to_path_buf(),
            reason,
        };
        if !path.exists() {
            return Err(invalid("directory does not exist".to_string()));
        }
        if !path.is_dir() {
            return Err(invalid("not a directory".to_string()));
        }
        let root = path.canonicalize().map_err(|e| invalid(e.to_string()))?;

        if self.current().as_deref() == Some(root.as_path()) {
            return Ok(root);
        }
        self.store.switch_project(Some(root.clone()))?;
        self.notify(Some(&root));
        Ok(root)
    }

    pub fn clear_project(&self) -> StoreResult<()> {
        if self.current().is_none() {
            return Ok(());
        }
        self.store.switch_project(None)?;
        self.notify(None);
        Ok(())
    }

    pub fn current(&self) -> Option<PathBuf> {
        self.store.project_root()
    }

    pub fn has_project(&self) -> bool {
        self.current().is_some()
    }

    /// Call `callback` after every project change, with the new root.
    pub fn subscribe<F>(&self, callback: F) -> ProjectSubscription
    where
        F: Fn(Option<&Path>) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners.callbacks.insert(id, Arc::new(callback));
        ProjectSubscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    fn notify(&self, root: Option<&Path>) {
        let callbacks: Vec<ProjectCallback> =
            self.listeners.lock().callbacks.values().cloned().collect();
        for callback in callbacks {
            callback(root);
        }
    }

    pub fn paths(&self) -> Option<ProjectPaths> {
        self.current().map(|root| ProjectPaths::new(&root))
    }

    pub fn claude_folder(&self) -> Option<PathBuf> {
        self.paths().map(|p| p.claude_folder())
    }

    pub fn settings_file(&self) -> Option<PathBuf> {
        self.paths().map(|p| p.settings_file())
    }

    pub fn local_settings_file(&self) -> Option<PathBuf> {
        self.paths().map(|p| p.local_settings_file())
    }

    pub fn mcp_file(&self) -> Option<PathBuf> {
        self.paths().map(|p| p.mcp_file())
    }

    pub fn agents_folder(&self) -> Option<PathBuf> {
        self.paths().map(|p| p.agents_folder())
    }

    pub fn commands_folder(&self) -> Option<PathBuf> {
        self.paths().map(|p| p.commands_folder())
    }

    pub fn skills_folder(&self) -> Option<PathBuf> {
        self.paths().map(|p| p.skills_folder())
    }

    pub fn plugins_folder(&self) -> Option<PathBuf> {
        self.paths().map(|p| p.plugins_folder())
    }

    pub fn hooks_folder(&self) -> Option<PathBuf> {
        self.paths().map(|p| p.hooks_folder())
    }

    pub fn has_claude_folder(&self) -> bool {
        self.claude_folder().is_some_and(|dir| dir.is_dir())
    }

    /// Create `<project>/.claude` if missing and return it.
    pub fn ensure_claude_folder(&self) -> StoreResult<PathBuf> {
        let dir = self
            .claude_folder()
            .ok_or(StoreError::ScopeRequiresProject {
                scope: Scope::ProjectShared,
            })?;
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        for (scope, file) in self.store.paths() {
            if scope.is_project_scoped() {
                self.store.reload_path(&file)?;
            }
        }
        Ok(dir)
    }
}

/// Handle returned by `ProjectContext::subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a ProjectSubscription unsubscribes immediately"]
pub struct ProjectSubscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Drop for ProjectSubscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().callbacks.remove(&self.id);
        }
    }
}
