#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::TempDir;

use strata_core::prelude::*;

/// Isolated home, managed-settings location and project directories.
pub struct Fixture {
    _temp: TempDir,
    pub root: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        Self { _temp: temp, root }
    }

    pub fn claude_dir(&self) -> PathBuf {
        self.root.join("home").join(".claude")
    }

    pub fn enterprise_path(&self) -> PathBuf {
        self.root.join("managed").join("managed-settings.json")
    }

    pub fn locator(&self) -> ScopeLocator {
        ScopeLocator::with_dirs(self.claude_dir(), self.enterprise_path())
    }

    /// Create an empty project directory named `name`.
    pub fn project(&self, name: &str) -> PathBuf {
        let root = self.root.join(name);
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    pub fn open(&self) -> Arc<ConfigStore> {
        self.open_with(CommandLineLayer::default(), false)
    }

    pub fn open_watching(&self) -> Arc<ConfigStore> {
        self.open_with(CommandLineLayer::default(), true)
    }

    pub fn open_with(&self, command_line: CommandLineLayer, watch: bool) -> Arc<ConfigStore> {
        let options = StoreOptions {
            watch,
            debounce_ms: 50,
            ..StoreOptions::default()
        };
        ConfigStore::open(self.locator(), options, command_line).unwrap()
    }

    pub fn open_with_options(&self, options: StoreOptions) -> Arc<ConfigStore> {
        ConfigStore::open(self.locator(), options, CommandLineLayer::default()).unwrap()
    }
}

pub fn key(raw: &str) -> ConfigKey {
    ConfigKey::parse(raw).unwrap()
}

/// Write `value` to `path` the way another program would.
pub fn write_json(path: &Path, value: &Value) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

pub fn read_json(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}
