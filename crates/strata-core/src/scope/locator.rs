//! Backing file path resolution for each scope.

use std::path::{Path, PathBuf};

use crate::error::{StoreError, StoreResult};

use super::Scope;

const SETTINGS_FILE: &str = "settings.json";
const LOCAL_SETTINGS_FILE: &str = "settings.local.json";
const MANAGED_SETTINGS_FILE: &str = "managed-settings.json";

/// Resolves the backing file of a scope from fixed base directories.
///
/// Base directories are captured once; `resolve` itself touches neither the
/// filesystem nor the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeLocator {
    claude_dir: PathBuf,
    enterprise_path: PathBuf,
}

impl ScopeLocator {
    /// Discover base directories from the environment.
    ///
    /// `STRATA_CLAUDE_DIR` and `STRATA_ENTERPRISE_PATH` override the defaults
    /// (`~/.claude` and the platform managed-settings location).
    pub fn discover() -> StoreResult<Self> {
        Self::discover_with(None, None)
    }

    /// Like `discover`, with configured fallbacks used when the environment
    /// variables are unset.
    pub fn discover_with(
        claude_dir: Option<PathBuf>,
        enterprise_path: Option<PathBuf>,
    ) -> StoreResult<Self> {
        let claude_dir = match std::env::var_os("STRATA_CLAUDE_DIR")
            .map(PathBuf::from)
            .or(claude_dir)
        {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or_else(|| StoreError::Options("Could not determine home directory".into()))?
                .join(".claude"),
        };
        let enterprise_path = std::env::var_os("STRATA_ENTERPRISE_PATH")
            .map(PathBuf::from)
            .or(enterprise_path)
            .unwrap_or_else(default_enterprise_path);

        Ok(Self::with_dirs(claude_dir, enterprise_path))
    }

    /// Create a locator with explicit base paths (for testing).
    pub fn with_dirs(claude_dir: PathBuf, enterprise_path: PathBuf) -> Self {
        Self {
            claude_dir,
            enterprise_path,
        }
    }

    pub fn claude_dir(&self) -> &Path {
        &self.claude_dir
    }

    pub fn enterprise_path(&self) -> &Path {
        &self.enterprise_path
    }

    pub fn resolve(&self, scope: Scope, project_root: Option<&Path>) -> StoreResult<PathBuf> {
        match scope {
            Scope::User => Ok(self.claude_dir.join(SETTINGS_FILE)),
            Scope::Enterprise => Ok(self.enterprise_path.clone()),
            Scope::ProjectShared => project_root
                .map(|root| ProjectPaths::new(root).settings_file())
                .ok_or(StoreError::ScopeRequiresProject { scope }),
            Scope::ProjectLocal => project_root
                .map(|root| ProjectPaths::new(root).local_settings_file())
                .ok_or(StoreError::ScopeRequiresProject { scope }),
            Scope::CommandLine => Err(StoreError::NotPersisted { scope }),
        }
    }
}

/// Platform location of the enterprise managed-settings file.
pub fn default_enterprise_path() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("/Library/Application Support/ClaudeCode").join(MANAGED_SETTINGS_FILE)
    } else if cfg!(windows) {
        PathBuf::from(r"C:\ProgramData\ClaudeCode").join(MANAGED_SETTINGS_FILE)
    } else {
        PathBuf::from("/etc/claude-code").join(MANAGED_SETTINGS_FILE)
    }
}

/// Well-known locations inside a project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn claude_folder(&self) -> PathBuf {
        self.root.join(".claude")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.claude_folder().join(SETTINGS_FILE)
    }

    pub fn local_settings_file(&self) -> PathBuf {
        self.claude_folder().join(LOCAL_SETTINGS_FILE)
    }

    pub fn mcp_file(&self) -> PathBuf {
        self.root.join(".mcp.json")
    }

    pub fn agents_folder(&self) -> PathBuf {
        self.claude_folder().join("agents")
    }

    pub fn commands_folder(&self) -> PathBuf {
        self.claude_folder().join("commands")
    }

    pub fn skills_folder(&self) -> PathBuf {
        self.claude_folder().join("skills")
    }

    pub fn plugins_folder(&self) -> PathBuf {
        self.claude_folder().join("plugins")
    }

    pub fn hooks_folder(&self) -> PathBuf {
        self.claude_folder().join("hooks")
    }
}
