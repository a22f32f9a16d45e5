//! Parsed contents of one backing file.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};
use crate::key::ConfigKey;

/// JSON object held by a `FileStore`, tagged with the version it was read or
/// written at. Callers always receive clones.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackingDocument {
    path: PathBuf,
    version: u64,
    root: Map<String, Value>,
}

impl BackingDocument {
    pub fn new(path: PathBuf, version: u64, root: Map<String, Value>) -> Self {
        Self {
            path,
            version,
            root,
        }
    }

    pub fn empty(path: PathBuf) -> Self {
        Self::new(path, 0, Map::new())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn root(&self) -> &Map<String, Value> {
        &self.root
    }

    pub fn into_root(self) -> Map<String, Value> {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Fragment stored at `key`, if every segment exists.
    pub fn get(&self, key: &ConfigKey) -> Option<&Value> {
        let mut segments = key.segments();
        let first = segments.next()?;
        segments.try_fold(self.root.get(first)?, |value, segment| {
            value.as_object()?.get(segment)
        })
    }

    /// Replace the fragment at `key`, creating intermediate objects.
    ///
    /// Siblings of `key` are left untouched.
    pub fn set(&mut self, key: &ConfigKey, value: Value) -> StoreResult<()> {
        let segments: Vec<&str> = key.segments().collect();
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            })?;

        let mut current = &mut self.root;
        for segment in parents {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            current = match entry {
                Value::Object(map) => map,
                _ => {
                    return Err(StoreError::NotAContainer {
                        key: key.to_string(),
                        segment: segment.to_string(),
                        path: self.path.clone(),
                    });
                }
            };
        }
        current.insert(last.to_string(), value);
        Ok(())
    }

    /// Remove the fragment at `key`, returning it if it existed.
    pub fn remove(&mut self, key: &ConfigKey) -> Option<Value> {
        let segments: Vec<&str> = key.segments().collect();
        let (last, parents) = segments.split_last()?;

        let mut current = &mut self.root;
        for segment in parents {
            current = current.get_mut(*segment)?.as_object_mut()?;
        }
        current.shift_remove(*last)
    }
}

/// Serialized form written to disk: 2-space indented JSON in insertion order.
pub(crate) fn to_pretty_bytes(root: &Map<String, Value>) -> StoreResult<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(root)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(raw: &str) -> ConfigKey {
        ConfigKey::parse(raw).unwrap()
    }

    fn document(value: Value) -> BackingDocument {
        match value {
            Value::Object(map) => BackingDocument::new(PathBuf::from("settings.json"), 1, map),
            _ => panic!("test documents must be objects"),
        }
    }

    #[test]
    fn get_walks_nested_objects() {
        let doc = document(json!({"permissions": {"allow": ["Read"]}}));
        assert_eq!(doc.get(&key("permissions.allow")), Some(&json!(["Read"])));
        assert_eq!(doc.get(&key("permissions.deny")), None);
        assert_eq!(doc.get(&key("permissions.allow.0")), None);
    }

    #[test]
    fn set_preserves_siblings() {
        let mut doc = document(json!({
            "model": "sonnet",
            "permissions": {"deny": ["Bash(rm *)"]}
        }));

        doc.set(&key("permissions.allow"), json!(["Read"])).unwrap();

        assert_eq!(
            doc.root(),
            json!({
                "model": "sonnet",
                "permissions": {"deny": ["Bash(rm *)"], "allow": ["Read"]}
            })
            .as_object()
            .unwrap()
        );
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut doc = BackingDocument::empty(PathBuf::from("settings.json"));
        doc.set(&key("enabledPlugins.fmt@tools"), json!(true)).unwrap();
        assert_eq!(doc.get(&key("enabledPlugins.fmt@tools")), Some(&json!(true)));
    }

    #[test]
    fn set_through_scalar_fails() {
        let mut doc = document(json!({"model": "sonnet"}));
        let err = doc.set(&key("model.name"), json!("opus")).unwrap_err();
        assert!(matches!(err, StoreError::NotAContainer { ref segment, .. } if segment == "model"));
    }

    #[test]
    fn remove_returns_previous_value() {
        let mut doc = document(json!({"env": {"A": "1", "B": "2"}}));
        assert_eq!(doc.remove(&key("env.A")), Some(json!("1")));
        assert_eq!(doc.remove(&key("env.C")), None);
        assert_eq!(doc.get(&key("env")), Some(&json!({"B": "2"})));
    }

    #[test]
    fn serialized_form_keeps_key_order() {
        let doc = document(json!({"zeta": 1, "alpha": 2}));
        let text = String::from_utf8(to_pretty_bytes(doc.root()).unwrap()).unwrap();
        assert!(text.find("zeta").unwrap() < text.find("alpha").unwrap());
        assert!(text.contains("\n  \"zeta\": 1"));
    }
}
