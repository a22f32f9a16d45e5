//! Store options file (`strata.toml`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::scope::ScopeLocator;

/// Tunables for a `ConfigStore`.
///
/// ```toml
/// debounce_ms = 200
/// write_attempts = 3
/// retry_backoff_ms = 25
/// watch = true
/// claude_dir = "/home/dev/.claude"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreOptions {
    /// Quiet period before a burst of file events is reported.
    pub debounce_ms: u64,
    /// Compare-and-swap attempts per write before giving up.
    pub write_attempts: u32,
    /// Backoff unit; attempt `n` sleeps `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
    /// Watch backing files for external edits.
    pub watch: bool,
    pub claude_dir: Option<PathBuf>,
    pub enterprise_path: Option<PathBuf>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            debounce_ms: 200,
            write_attempts: 3,
            retry_backoff_ms: 25,
            watch: true,
            claude_dir: None,
            enterprise_path: None,
        }
    }
}

impl StoreOptions {
    /// `$XDG_CONFIG_HOME/strata/strata.toml` (platform equivalent elsewhere).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("strata").join("strata.toml"))
    }

    /// Load the default options file, falling back to defaults if absent.
    pub fn load_default() -> StoreResult<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> StoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        Self::from_toml_str(&content)
            .map_err(|e| StoreError::Options(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(content: &str) -> StoreResult<Self> {
        let options: StoreOptions =
            toml::from_str(content).map_err(|e| enhance_toml_error(e, content))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.debounce_ms == 0 || self.debounce_ms >= 1000 {
            return Err(StoreError::Options(format!(
                "debounce_ms must be between 1 and 999, got {}",
                self.debounce_ms
            )));
        }
        if self.write_attempts == 0 {
            return Err(StoreError::Options(
                "write_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Locator honoring the environment first, then these options.
    pub fn locator(&self) -> StoreResult<ScopeLocator> {
        ScopeLocator::discover_with(self.claude_dir.clone(), self.enterprise_path.clone())
    }
}

fn enhance_toml_error(error: toml::de::Error, content: &str) -> StoreError {
    let message = error.message().to_string();
    match error.span() {
        Some(span) => {
            let before = content.get(..span.start).unwrap_or(content);
            let line_num = before.matches('\n').count() + 1;
            StoreError::Options(format!(
                "TOML parsing error at line {}:\n{}\n\nError: {}",
                line_num,
                get_line_context(content, line_num),
                message
            ))
        }
        None => StoreError::Options(format!("TOML parsing error: {message}")),
    }
}

fn get_line_context(content: &str, line_num: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = line_num.saturating_sub(2);
    let end = (line_num + 1).min(lines.len());

    lines[start.min(end)..end]
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let num = start + i + 1;
            let marker = if num == line_num { ">>>" } else { "   " };
            format!("{} {:4} | {}", marker, num, line)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let options = StoreOptions::from_toml_str("").unwrap();
        assert_eq!(options, StoreOptions::default());
        assert_eq!(options.debounce(), Duration::from_millis(200));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let options = StoreOptions::from_toml_str("write_attempts = 5\nwatch = false\n").unwrap();
        assert_eq!(options.write_attempts, 5);
        assert!(!options.watch);
        assert_eq!(options.retry_backoff_ms, 25);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(StoreOptions::from_toml_str("precedence = [\"user\"]").is_err());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(StoreOptions::from_toml_str("debounce_ms = 1500").is_err());
        assert!(StoreOptions::from_toml_str("write_attempts = 0").is_err());
    }

    #[test]
    fn parse_error_points_at_line() {
        let err = StoreOptions::from_toml_str("watch = true\ndebounce_ms = \"fast\"\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("line 2"), "{err}");
        assert!(err.contains(">>>"), "{err}");
    }
}
