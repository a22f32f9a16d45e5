//! File watcher for backing settings files.
//!
//! Watches the parent directory of every backing file non-recursively, since
//! atomic saves replace the file's inode, and filters the debounced events
//! down to the watched paths. Callbacks run on a dedicated thread.
//!
//! A file whose directory does not exist yet (a project without `.claude/`)
//! is *unarmed*: its grandparent is watched instead, and creating the missing
//! directory is reported as a change to the file so the owner can rebuild the
//! watcher.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{DebounceEventResult, DebouncedEventKind, Debouncer, new_debouncer};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// Callback invoked with the backing file that changed.
pub type ChangeCallback = Arc<dyn Fn(&Path) + Send + Sync>;

#[derive(Debug, Clone)]
struct WatchTarget {
    path: PathBuf,
    /// Same file under its canonicalized directory, as some backends report it.
    canonical: Option<PathBuf>,
    /// Missing directory standing in for the file while unarmed.
    pending_dir: Option<PathBuf>,
}

impl WatchTarget {
    fn matches(&self, event_path: &Path) -> bool {
        event_path == self.path
            || self.canonical.as_deref() == Some(event_path)
            || self.pending_dir.as_deref() == Some(event_path)
    }
}

struct Running {
    debouncer: Debouncer<RecommendedWatcher>,
    thread: JoinHandle<()>,
}

/// Debounced change notifications for a fixed set of files.
pub struct ChangeWatcher {
    running: Mutex<Option<Running>>,
    stopped: Arc<AtomicBool>,
    callback_thread: ThreadId,
    watched: Vec<PathBuf>,
    unarmed: Vec<PathBuf>,
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("watched", &self.watched)
            .field("unarmed", &self.unarmed)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl ChangeWatcher {
    /// Start watching `paths`, calling `on_change` once per changed file per
    /// debounce window.
    pub fn watch(
        paths: &[PathBuf],
        debounce: Duration,
        on_change: ChangeCallback,
    ) -> StoreResult<Self> {
        let (notify_tx, notify_rx) = mpsc::channel::<DebounceEventResult>();
        let mut debouncer = new_debouncer(debounce, notify_tx)?;

        let mut targets = Vec::new();
        let mut directories = BTreeSet::new();
        let mut unarmed = Vec::new();

        for path in paths {
            let parent = parent_dir(path);
            if parent.is_dir() {
                let canonical = parent
                    .canonicalize()
                    .ok()
                    .zip(path.file_name())
                    .map(|(dir, name)| dir.join(name))
                    .filter(|canonical| canonical != path);
                directories.insert(parent.to_path_buf());
                targets.push(WatchTarget {
                    path: path.clone(),
                    canonical,
                    pending_dir: None,
                });
                continue;
            }

            warn!(
                "Settings directory does not exist yet, watch unarmed: {}",
                parent.display()
            );
            unarmed.push(path.clone());
            if let Some(grandparent) = parent.parent().filter(|dir| dir.is_dir()) {
                directories.insert(grandparent.to_path_buf());
            }
            targets.push(WatchTarget {
                path: path.clone(),
                canonical: None,
                pending_dir: Some(parent.to_path_buf()),
            });
        }

        let watcher = debouncer.watcher();
        for dir in &directories {
            debug!("Watching directory: {}", dir.display());
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }
        info!(
            files = targets.len(),
            directories = directories.len(),
            "Settings watcher armed"
        );

        let stopped = Arc::new(AtomicBool::new(false));
        let thread = {
            let stopped = Arc::clone(&stopped);
            thread::Builder::new()
                .name("strata-watcher".to_string())
                .spawn(move || process_events(notify_rx, &targets, &stopped, on_change))
                .map_err(|e| StoreError::io(Path::new("strata-watcher"), e))?
        };

        Ok(Self {
            callback_thread: thread.thread().id(),
            running: Mutex::new(Some(Running { debouncer, thread })),
            stopped,
            watched: paths.to_vec(),
            unarmed,
        })
    }

    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }

    /// Files whose directory was missing when the watcher started.
    pub fn unarmed(&self) -> &[PathBuf] {
        &self.unarmed
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop delivering events.
    ///
    /// Idempotent. Waits for an in-flight callback to finish unless called
    /// from inside that callback. No callback starts after this returns.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        if thread::current().id() == self.callback_thread {
            // Another thread may hold the lock while joining this one.
            if let Some(mut running) = self.running.try_lock()
                && let Some(Running { debouncer, thread }) = running.take()
            {
                drop(debouncer);
                drop(thread);
            }
            return;
        }

        let mut running = self.running.lock();
        if let Some(Running { debouncer, thread }) = running.take() {
            drop(debouncer);
            if thread.join().is_err() {
                warn!("Settings watcher thread panicked");
            }
            debug!("Settings watcher stopped");
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn process_events(
    rx: mpsc::Receiver<DebounceEventResult>,
    targets: &[WatchTarget],
    stopped: &AtomicBool,
    on_change: ChangeCallback,
) {
    while let Ok(result) = rx.recv() {
        match result {
            Ok(events) => {
                let changed = changed_targets(
                    events
                        .iter()
                        .filter(|event| {
                            matches!(
                                event.kind,
                                DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous
                            )
                        })
                        .map(|event| event.path.as_path()),
                    targets,
                );
                for path in changed {
                    if stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    debug!("Settings file changed: {}", path.display());
                    on_change(&path);
                }
            }
            Err(e) => warn!("File watcher error: {}", e),
        }
        if stopped.load(Ordering::SeqCst) {
            return;
        }
    }
    debug!("Settings watcher channel closed");
}

/// Watched files touched by `event_paths`, each once, in watch order.
fn changed_targets<'a>(
    event_paths: impl Iterator<Item = &'a Path>,
    targets: &[WatchTarget],
) -> Vec<PathBuf> {
    let hits: Vec<&Path> = event_paths.collect();
    targets
        .iter()
        .filter(|target| hits.iter().any(|hit| target.matches(hit)))
        .map(|target| target.path.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn target(path: &str) -> WatchTarget {
        WatchTarget {
            path: PathBuf::from(path),
            canonical: None,
            pending_dir: None,
        }
    }

    #[test]
    fn events_are_filtered_to_watched_files() {
        let targets = [
            target("/p/.claude/settings.json"),
            target("/p/.claude/settings.local.json"),
        ];
        let events = [
            Path::new("/p/.claude/settings.local.json"),
            Path::new("/p/.claude/.tmpA1b2c3"),
            Path::new("/p/.claude/settings.local.json"),
        ];

        let changed = changed_targets(events.into_iter(), &targets);

        assert_eq!(changed, vec![PathBuf::from("/p/.claude/settings.local.json")]);
    }

    #[test]
    fn missing_directory_maps_to_pending_file() {
        let pending = WatchTarget {
            path: PathBuf::from("/p/.claude/settings.json"),
            canonical: None,
            pending_dir: Some(PathBuf::from("/p/.claude")),
        };
        let changed = changed_targets([Path::new("/p/.claude")].into_iter(), &[pending]);
        assert_eq!(changed, vec![PathBuf::from("/p/.claude/settings.json")]);
    }

    #[test]
    fn unarmed_paths_are_reported() {
        let temp = TempDir::new().unwrap();
        let armed = temp.path().join("settings.json");
        let missing = temp.path().join("project").join(".claude").join("settings.json");

        let watcher = ChangeWatcher::watch(
            &[armed, missing.clone()],
            Duration::from_millis(50),
            Arc::new(|_| {}),
        )
        .unwrap();

        assert_eq!(watcher.unarmed(), &[missing]);
        assert_eq!(watcher.watched().len(), 2);
    }

    #[test]
    fn stop_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let watcher = ChangeWatcher::watch(
            &[temp.path().join("settings.json")],
            Duration::from_millis(50),
            Arc::new(|_| {}),
        )
        .unwrap();

        watcher.stop();
        watcher.stop();
        assert!(watcher.is_stopped());
    }
}
