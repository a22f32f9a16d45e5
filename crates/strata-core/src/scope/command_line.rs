//! The ephemeral `CommandLine` scope.
//!
//! Built once from `--setting KEY=VALUE` arguments and the `STRATA_SETTINGS`
//! environment variable, then frozen. Nothing here is ever written to disk.

use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::document::BackingDocument;
use crate::error::{StoreError, StoreResult};
use crate::key::ConfigKey;

/// Environment variable holding a JSON object of command-line settings.
pub const SETTINGS_ENV: &str = "STRATA_SETTINGS";

const SOURCE: &str = "<command-line>";

#[derive(Debug, Clone, PartialEq)]
pub struct CommandLineLayer {
    document: BackingDocument,
}

impl Default for CommandLineLayer {
    fn default() -> Self {
        Self {
            document: BackingDocument::empty(PathBuf::from(SOURCE)),
        }
    }
}

impl CommandLineLayer {
    /// Layer from a JSON object such as the contents of `STRATA_SETTINGS`.
    pub fn from_json(text: &str) -> StoreResult<Self> {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(root)) => Ok(Self {
                document: BackingDocument::new(PathBuf::from(SOURCE), 0, root),
            }),
            Ok(_) => Err(StoreError::Options(format!(
                "{SETTINGS_ENV} must be a JSON object"
            ))),
            Err(e) => Err(StoreError::Options(format!("{SETTINGS_ENV}: {e}"))),
        }
    }

    /// Layer from the `STRATA_SETTINGS` environment variable, empty when unset.
    pub fn from_env() -> StoreResult<Self> {
        match std::env::var(SETTINGS_ENV) {
            Ok(text) if !text.trim().is_empty() => Self::from_json(&text),
            _ => Ok(Self::default()),
        }
    }

    /// Layer from `KEY=VALUE` pairs.
    pub fn from_args<I, S>(args: I) -> StoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::default().with_args(args)
    }

    /// Apply `KEY=VALUE` pairs on top of this layer; later pairs win.
    ///
    /// `VALUE` is parsed as JSON and falls back to a plain string, so
    /// `model=opus` and `temperature=0.2` both do what they look like.
    pub fn with_args<I, S>(mut self, args: I) -> StoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            let (key, value) = parse_assignment(arg.as_ref())?;
            self.document.set(&key, value)?;
        }
        Ok(self)
    }

    pub fn fragment(&self, key: &ConfigKey) -> Option<&Value> {
        self.document.get(key)
    }

    pub fn root(&self) -> &Map<String, Value> {
        self.document.root()
    }

    pub fn is_empty(&self) -> bool {
        self.document.is_empty()
    }
}

fn parse_assignment(arg: &str) -> StoreResult<(ConfigKey, Value)> {
    let (key, raw) = arg.split_once('=').ok_or_else(|| StoreError::InvalidKey {
        key: arg.to_string(),
        reason: "expected KEY=VALUE".to_string(),
    })?;
    let key = ConfigKey::parse(key.trim())?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key, value))
}
