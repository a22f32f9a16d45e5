//! Configuration scopes
//!
//! Five scopes contribute to the effective configuration, highest precedence first:
//! - CommandLine: process arguments/environment, never persisted
//! - Enterprise: managed settings installed by an administrator
//! - ProjectLocal: `<project>/.claude/settings.local.json`, not shared
//! - ProjectShared: `<project>/.claude/settings.json`, checked into version control
//! - User: `~/.claude/settings.json`

pub mod command_line;
pub mod locator;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use command_line::CommandLineLayer;
pub use locator::{ProjectPaths, ScopeLocator};

/// Configuration scope levels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    /// User-global settings.
    User,
    /// Per-project, shared (committed with the project).
    ProjectShared,
    /// Per-project, local to this machine.
    ProjectLocal,
    /// Enterprise-managed settings (read-only).
    Enterprise,
    /// Values from the process command line (read-only, never persisted).
    CommandLine,
}

impl Scope {
    /// Precedence order, highest first.
    pub const PRECEDENCE: [Scope; 5] = [
        Scope::CommandLine,
        Scope::Enterprise,
        Scope::ProjectLocal,
        Scope::ProjectShared,
        Scope::User,
    ];

    /// Scopes backed by a file.
    pub const PERSISTED: [Scope; 4] = [
        Scope::User,
        Scope::ProjectShared,
        Scope::ProjectLocal,
        Scope::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::ProjectShared => "project-shared",
            Scope::ProjectLocal => "project-local",
            Scope::Enterprise => "enterprise",
            Scope::CommandLine => "command-line",
        }
    }

    /// Whether the scope's file lives inside the active project.
    pub fn is_project_scoped(&self) -> bool {
        matches!(self, Scope::ProjectShared | Scope::ProjectLocal)
    }

    /// Whether `ConfigStore::set` may target this scope.
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            Scope::User | Scope::ProjectShared | Scope::ProjectLocal
        )
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "user" | "global" => Ok(Scope::User),
            "project-shared" | "shared" | "project" => Ok(Scope::ProjectShared),
            "project-local" | "local" => Ok(Scope::ProjectLocal),
            "enterprise" | "managed" => Ok(Scope::Enterprise),
            "command-line" | "cli" => Ok(Scope::CommandLine),
            other => Err(format!(
                "Unknown scope '{other}'. Use user, project-shared, project-local, enterprise or command-line"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_starts_with_command_line_and_ends_with_user() {
        assert_eq!(Scope::PRECEDENCE.first(), Some(&Scope::CommandLine));
        assert_eq!(Scope::PRECEDENCE.last(), Some(&Scope::User));
    }

    #[test]
    fn parse_accepts_aliases() {
        assert_eq!("shared".parse::<Scope>().unwrap(), Scope::ProjectShared);
        assert_eq!("LOCAL".parse::<Scope>().unwrap(), Scope::ProjectLocal);
        assert_eq!("global".parse::<Scope>().unwrap(), Scope::User);
        assert!("team".parse::<Scope>().is_err());
    }

    #[test]
    fn only_user_and_project_scopes_are_writable() {
        let writable: Vec<_> = Scope::PRECEDENCE
            .into_iter()
            .filter(Scope::is_writable)
            .collect();
        assert_eq!(
            writable,
            vec![Scope::ProjectLocal, Scope::ProjectShared, Scope::User]
        );
    }

    #[test]
    fn only_project_files_are_project_scoped() {
        let scoped: Vec<_> = Scope::PRECEDENCE
            .into_iter()
            .filter(Scope::is_project_scoped)
            .collect();
        assert_eq!(scoped, vec![Scope::ProjectLocal, Scope::ProjectShared]);
    }
}
