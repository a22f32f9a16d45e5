//! Configuration store
//!
//! `ConfigStore` owns one `FileStore` per backing file relevant under the
//! active project, resolves effective values through the precedence rules,
//! serializes writes per file and fans out change notifications.

mod subscriptions;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::document::BackingDocument;
use crate::error::{StoreError, StoreResult};
use crate::file_store::{FileStore, Refresh};
use crate::key::ConfigKey;
use crate::options::StoreOptions;
use crate::resolver::{self, EffectiveValue, ScopeWarning};
use crate::scope::{CommandLineLayer, Scope, ScopeLocator};
use crate::watcher::ChangeWatcher;

pub use subscriptions::{SubscriberFn, Subscription};
use subscriptions::SubscriptionRegistry;

/// Read-only copy of every backing file relevant under the current project.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub project_root: Option<PathBuf>,
    pub documents: BTreeMap<PathBuf, BackingDocument>,
    pub warnings: Vec<ScopeWarning>,
}

struct StoreState {
    project_root: Option<PathBuf>,
    scope_paths: BTreeMap<Scope, PathBuf>,
    stores: HashMap<PathBuf, Arc<FileStore>>,
    generation: u64,
}

struct CachedValue {
    generation: u64,
    versions: Vec<(Scope, u64)>,
    value: EffectiveValue,
}

/// Fragments of one key gathered from every relevant scope.
struct Gathered {
    generation: u64,
    fragments: BTreeMap<Scope, Value>,
    versions: Vec<(Scope, u64)>,
    warnings: Vec<ScopeWarning>,
}

pub struct ConfigStore {
    locator: ScopeLocator,
    options: StoreOptions,
    command_line: CommandLineLayer,
    state: Mutex<StoreState>,
    cache: Mutex<HashMap<ConfigKey, CachedValue>>,
    subscriptions: Arc<SubscriptionRegistry>,
    publish_lock: Mutex<()>,
    watcher: Mutex<Option<ChangeWatcher>>,
    this: Weak<ConfigStore>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("locator", &self.locator)
            .field("project_root", &self.project_root())
            .finish_non_exhaustive()
    }
}

impl ConfigStore {
    /// Open a store with no active project.
    pub fn open(
        locator: ScopeLocator,
        options: StoreOptions,
        command_line: CommandLineLayer,
    ) -> StoreResult<Arc<Self>> {
        options.validate()?;
        let scope_paths = scope_paths(&locator, None);

        let store = Arc::new_cyclic(|this| Self {
            locator,
            options,
            command_line,
            state: Mutex::new(StoreState {
                project_root: None,
                scope_paths,
                stores: HashMap::new(),
                generation: 0,
            }),
            cache: Mutex::new(HashMap::new()),
            subscriptions: Arc::new(SubscriptionRegistry::default()),
            publish_lock: Mutex::new(()),
            watcher: Mutex::new(None),
            this: this.clone(),
        });

        store.restart_watcher()?;
        Ok(store)
    }

    pub fn locator(&self) -> &ScopeLocator {
        &self.locator
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn command_line(&self) -> &CommandLineLayer {
        &self.command_line
    }

    pub fn project_root(&self) -> Option<PathBuf> {
        self.state.lock().project_root.clone()
    }

    /// Backing file of every persisted scope relevant right now.
    pub fn paths(&self) -> BTreeMap<Scope, PathBuf> {
        self.state.lock().scope_paths.clone()
    }

    /// Effective value of `key` under the current project.
    ///
    /// Corrupt scopes are skipped and listed in `EffectiveValue::warnings`.
    pub fn get(&self, key: &ConfigKey) -> StoreResult<EffectiveValue> {
        let gathered = self.gather(key)?;

        if let Some(cached) = self.cache.lock().get(key)
            && cached.generation == gathered.generation
            && cached.versions == gathered.versions
        {
            return Ok(cached.value.clone());
        }

        let mut value = resolver::resolve(key, &gathered.fragments, &Scope::PRECEDENCE);
        value.warnings = gathered.warnings;

        self.cache.lock().insert(
            key.clone(),
            CachedValue {
                generation: gathered.generation,
                versions: gathered.versions,
                value: value.clone(),
            },
        );
        Ok(value)
    }

    /// Per-scope origin of each part of the effective value of `key`.
    pub fn provenance_split(&self, key: &ConfigKey) -> StoreResult<BTreeMap<Scope, Value>> {
        let gathered = self.gather(key)?;
        Ok(resolver::split_by_provenance(
            key,
            &gathered.fragments,
            &Scope::PRECEDENCE,
        ))
    }

    /// Raw fragment of `key` stored in a single scope.
    pub fn scope_value(&self, scope: Scope, key: &ConfigKey) -> StoreResult<Option<Value>> {
        if scope == Scope::CommandLine {
            return Ok(self.command_line.fragment(key).cloned());
        }
        let (_, store) = self.store_for(scope)?;
        let document = store.load().map_err(|e| e.with_scope(scope))?;
        Ok(document.get(key).cloned())
    }

    /// Replace the value at `key` in `scope`, leaving siblings untouched.
    pub fn set(&self, scope: Scope, key: &ConfigKey, value: Value) -> StoreResult<()> {
        self.update(scope, key, |_| Ok(Some(value.clone())))
    }

    /// Remove `key` from `scope`.
    pub fn unset(&self, scope: Scope, key: &ConfigKey) -> StoreResult<()> {
        self.update(scope, key, |_| Ok(None))
    }

    /// Append `item` to the array at `key` unless already present.
    pub fn add_to_list(&self, scope: Scope, key: &ConfigKey, item: Value) -> StoreResult<()> {
        self.update(scope, key, |current| match current {
            None => Ok(Some(Value::Array(vec![item.clone()]))),
            Some(Value::Array(items)) if items.contains(&item) => {
                Ok(Some(Value::Array(items.clone())))
            }
            Some(Value::Array(items)) => {
                let mut items = items.clone();
                items.push(item.clone());
                Ok(Some(Value::Array(items)))
            }
            Some(_) => Err(StoreError::NotAContainer {
                key: key.to_string(),
                segment: key.segments().last().unwrap_or_default().to_string(),
                path: PathBuf::new(),
            }),
        })
    }

    /// Read-modify-write of the fragment at `key` in `scope`.
    ///
    /// `edit` sees the fragment as currently on disk and returns its
    /// replacement (`None` removes the key). On a version conflict it runs
    /// again against the fresh document. Returning the current value skips
    /// the write.
    pub fn update<F>(&self, scope: Scope, key: &ConfigKey, mut edit: F) -> StoreResult<()>
    where
        F: FnMut(Option<&Value>) -> StoreResult<Option<Value>>,
    {
        if !scope.is_writable() {
            return Err(StoreError::UnwritableScope { scope });
        }
        let (path, store) = self.store_for(scope)?;

        let written = {
            let _writer = store.writer();
            self.write_with_retry(scope, key, &path, &store, &mut edit)?
        };

        if written {
            self.cache.lock().clear();
            self.rearm_if_unarmed(&path)?;
            self.publish(false);
        }
        Ok(())
    }

    fn write_with_retry<F>(
        &self,
        scope: Scope,
        key: &ConfigKey,
        path: &Path,
        store: &FileStore,
        edit: &mut F,
    ) -> StoreResult<bool>
    where
        F: FnMut(Option<&Value>) -> StoreResult<Option<Value>>,
    {
        let attempts = self.options.write_attempts;
        for attempt in 1..=attempts {
            let mut document = store.load().map_err(|e| e.with_scope(scope))?;
            let expected = document.version();
            let current = document.get(key).cloned();

            let next = edit(current.as_ref()).map_err(|e| with_path(e, path))?;
            if next == current {
                return Ok(false);
            }
            match next {
                Some(value) => document.set(key, value)?,
                None => {
                    document.remove(key);
                }
            }

            match store.compare_and_swap(expected, document.into_root()) {
                Ok(version) => {
                    debug!(%scope, %key, version, "Saved setting");
                    return Ok(true);
                }
                Err(StoreError::VersionConflict { actual, .. }) => {
                    debug!(%scope, %key, attempt, expected, actual, "Version conflict, retrying");
                    if attempt < attempts {
                        std::thread::sleep(self.options.retry_backoff() * attempt);
                    }
                }
                Err(e) => return Err(e.with_scope(scope)),
            }
        }

        warn!(%scope, %key, attempts, "Giving up on contended settings file");
        Err(StoreError::WriteContention {
            path: path.to_path_buf(),
            attempts,
        })
    }

    /// Register `callback` for changes to the effective value of `key`.
    ///
    /// Changes below `key` (e.g. `permissions.allow` for `permissions`)
    /// change its value and so notify it too.
    pub fn subscribe<F>(&self, key: &ConfigKey, callback: F) -> StoreResult<Subscription>
    where
        F: Fn(&EffectiveValue) + Send + Sync + 'static,
    {
        let current = self.get(key)?;
        let id = self
            .subscriptions
            .insert(key.clone(), Arc::new(callback), current.value);
        Ok(Subscription::new(id, key.clone(), &self.subscriptions))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Make `new_root` the active project, or close the project with `None`.
    ///
    /// Project-scoped stores are discarded and every subscription is
    /// republished exactly once against the new context.
    pub fn switch_project(&self, new_root: Option<PathBuf>) -> StoreResult<()> {
        // Stop outside every store lock; the callback thread may be waiting on one.
        let previous = self.watcher.lock().take();
        drop(previous);

        {
            let mut state = self.state.lock();
            let scope_paths = scope_paths(&self.locator, new_root.as_deref());
            state
                .stores
                .retain(|path, _| scope_paths.values().any(|p| p == path));
            state.scope_paths = scope_paths;
            state.project_root = new_root.clone();
            state.generation += 1;
        }
        self.cache.lock().clear();

        match &new_root {
            Some(root) => info!("Switched to project {}", root.display()),
            None => info!("Closed project"),
        }

        self.restart_watcher()?;
        self.publish(true);
        Ok(())
    }

    /// Pick up an external change to `path`.
    ///
    /// Called by the watcher; safe to call directly.
    pub fn reload_path(&self, path: &Path) -> StoreResult<()> {
        let store = self.state.lock().stores.get(path).cloned();
        if let Some(store) = store {
            match store.reload()? {
                Refresh::Changed { version } => {
                    debug!(path = %path.display(), version, "Reloaded settings file");
                    self.cache.lock().clear();
                    self.publish(false);
                }
                Refresh::Unchanged => {}
            }
        }
        self.rearm_if_unarmed(path)
    }

    /// Copy of every relevant backing file as currently on disk.
    ///
    /// Nothing is written. A version only moves when the file changed on
    /// disk since it was last observed.
    pub fn snapshot_all(&self) -> StoreResult<Snapshot> {
        let (project_root, scopes) = {
            let state = self.state.lock();
            (state.project_root.clone(), distinct_paths(&state.scope_paths))
        };

        let mut documents = BTreeMap::new();
        let mut warnings = Vec::new();
        let mut changed = false;
        for (scope, path) in scopes {
            let (store, created) = self.file_store(&path);
            let refresh = store.reload().map_err(|e| e.with_scope(scope))?;
            if let Refresh::Changed { version } = refresh
                && !created
            {
                debug!(path = %path.display(), version, "Settings file changed before snapshot");
                changed = true;
            }
            match store.corruption() {
                Some(e) => warnings.push(warning(scope, &path, &e)),
                None => {
                    documents.insert(path, store.snapshot());
                }
            }
        }

        if changed {
            self.cache.lock().clear();
            self.publish(false);
        }

        Ok(Snapshot {
            taken_at: Utc::now(),
            project_root,
            documents,
            warnings,
        })
    }

    /// Problems with any relevant backing file.
    pub fn warnings(&self) -> StoreResult<Vec<ScopeWarning>> {
        let scopes = distinct_paths(&self.state.lock().scope_paths);
        let mut warnings = Vec::new();
        for (scope, path) in scopes {
            let (store, _) = self.file_store(&path);
            match store.load() {
                Ok(_) => {}
                Err(e) if e.is_warning() => warnings.push(warning(scope, &path, &e)),
                Err(e) => return Err(e.with_scope(scope)),
            }
        }
        Ok(warnings)
    }

    fn gather(&self, key: &ConfigKey) -> StoreResult<Gathered> {
        let (generation, stores) = {
            let mut state = self.state.lock();
            let scopes = distinct_paths(&state.scope_paths);
            let stores: Vec<(Scope, PathBuf, Arc<FileStore>)> = scopes
                .into_iter()
                .map(|(scope, path)| {
                    let store = Arc::clone(
                        state
                            .stores
                            .entry(path.clone())
                            .or_insert_with(|| Arc::new(FileStore::new(path.clone()))),
                    );
                    (scope, path, store)
                })
                .collect();
            (state.generation, stores)
        };

        let mut gathered = Gathered {
            generation,
            fragments: BTreeMap::new(),
            versions: Vec::with_capacity(stores.len()),
            warnings: Vec::new(),
        };
        if let Some(fragment) = self.command_line.fragment(key) {
            gathered.fragments.insert(Scope::CommandLine, fragment.clone());
        }

        for (scope, path, store) in stores {
            match store.load() {
                Ok(document) => {
                    if let Some(fragment) = document.get(key) {
                        gathered.fragments.insert(scope, fragment.clone());
                    }
                }
                Err(e) if e.is_warning() => {
                    gathered.warnings.push(warning(scope, &path, &e));
                }
                Err(e) => return Err(e.with_scope(scope)),
            }
            gathered.versions.push((scope, store.version()));
        }
        Ok(gathered)
    }

    fn store_for(&self, scope: Scope) -> StoreResult<(PathBuf, Arc<FileStore>)> {
        let path = {
            let state = self.state.lock();
            match state.scope_paths.get(&scope) {
                Some(path) => path.clone(),
                None => {
                    return Err(self
                        .locator
                        .resolve(scope, state.project_root.as_deref())
                        .err()
                        .unwrap_or(StoreError::ScopeRequiresProject { scope }));
                }
            }
        };
        let (store, _) = self.file_store(&path);
        Ok((path, store))
    }

    /// Shared store for `path`, and whether it was just created.
    fn file_store(&self, path: &Path) -> (Arc<FileStore>, bool) {
        let mut state = self.state.lock();
        match state.stores.get(path) {
            Some(store) => (Arc::clone(store), false),
            None => {
                let store = Arc::new(FileStore::new(path.to_path_buf()));
                state.stores.insert(path.to_path_buf(), Arc::clone(&store));
                (store, true)
            }
        }
    }

    fn restart_watcher(&self) -> StoreResult<()> {
        if !self.options.watch {
            return Ok(());
        }
        let paths: Vec<PathBuf> = {
            let state = self.state.lock();
            let mut paths: Vec<PathBuf> = state.scope_paths.values().cloned().collect();
            paths.sort();
            paths.dedup();
            paths
        };

        let this = self.this.clone();
        let watcher = ChangeWatcher::watch(
            &paths,
            self.options.debounce(),
            Arc::new(move |path: &Path| {
                if let Some(store) = this.upgrade()
                    && let Err(e) = store.reload_path(path)
                {
                    warn!("Failed to reload {}: {}", path.display(), e);
                }
            }),
        )?;

        let previous = self.watcher.lock().replace(watcher);
        drop(previous);
        Ok(())
    }

    /// Rebuild the watcher once the directory of an unarmed file exists.
    fn rearm_if_unarmed(&self, path: &Path) -> StoreResult<()> {
        let unarmed = self
            .watcher
            .lock()
            .as_ref()
            .is_some_and(|watcher| watcher.unarmed().iter().any(|p| p == path));
        if unarmed && path.parent().is_some_and(Path::is_dir) {
            info!("Arming watcher for {}", path.display());
            self.restart_watcher()?;
        }
        Ok(())
    }

    /// Recompute every subscription and deliver the ones that changed.
    ///
    /// Callbacks run after every internal lock is released.
    fn publish(&self, force: bool) {
        let deliveries = {
            let _guard = self.publish_lock.lock();
            let mut deliveries = Vec::new();
            for (id, key) in self.subscriptions.keys() {
                match self.get(&key) {
                    Ok(value) => {
                        if let Some((callback, stamp)) =
                            self.subscriptions.record(id, &value, force)
                        {
                            deliveries.push((id, stamp, callback, value));
                        }
                    }
                    Err(e) => warn!(%key, "Failed to resolve subscribed key: {}", e),
                }
            }
            deliveries
        };

        for (id, stamp, callback, value) in deliveries {
            if self.subscriptions.is_current(id, stamp) {
                callback(&value);
            }
        }
    }
}

fn scope_paths(locator: &ScopeLocator, project_root: Option<&Path>) -> BTreeMap<Scope, PathBuf> {
    Scope::PERSISTED
        .into_iter()
        .filter_map(|scope| {
            locator
                .resolve(scope, project_root)
                .ok()
                .map(|path| (scope, path))
        })
        .collect()
}

/// One entry per backing file, credited to the highest scope using it.
fn distinct_paths(scope_paths: &BTreeMap<Scope, PathBuf>) -> Vec<(Scope, PathBuf)> {
    let mut distinct: Vec<(Scope, PathBuf)> = Vec::with_capacity(scope_paths.len());
    for scope in Scope::PRECEDENCE {
        if let Some(path) = scope_paths.get(&scope)
            && !distinct.iter().any(|(_, seen)| seen == path)
        {
            distinct.push((scope, path.clone()));
        }
    }
    distinct
}

fn warning(scope: Scope, path: &Path, error: &StoreError) -> ScopeWarning {
    let message = match error {
        StoreError::CorruptStore { message, .. } => message.clone(),
        other => other.to_string(),
    };
    ScopeWarning {
        scope,
        path: path.to_path_buf(),
        message,
    }
}

fn with_path(error: StoreError, path: &Path) -> StoreError {
    match error {
        StoreError::NotAContainer { key, segment, path: p } if p.as_os_str().is_empty() => {
            StoreError::NotAContainer {
                key,
                segment,
                path: path.to_path_buf(),
            }
        }
        other => other,
    }
}
