//! Logical config keys and the declared merge-policy table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// Dotted path naming a setting, e.g. `permissions.allow`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConfigKey {
    raw: String,
}

impl ConfigKey {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let invalid = |reason: &str| StoreError::InvalidKey {
            key: raw.to_string(),
            reason: reason.to_string(),
        };
        if raw.is_empty() {
            return Err(invalid("key cannot be empty"));
        }
        if raw.split('.').any(str::is_empty) {
            return Err(invalid("key segments cannot be empty"));
        }
        if raw.split('.').any(|segment| segment == "*") {
            return Err(invalid("'*' is reserved for policy patterns"));
        }
        Ok(Self {
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.raw.split('.')
    }

    /// True if `self` equals `other` or is an ancestor of it.
    pub fn is_prefix_of(&self, other: &ConfigKey) -> bool {
        other.raw == self.raw
            || (other.raw.starts_with(&self.raw)
                && other.raw.as_bytes().get(self.raw.len()) == Some(&b'.'))
    }

    /// True if either key is a prefix of the other.
    pub fn overlaps(&self, other: &ConfigKey) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    pub fn policy(&self) -> KeyRule {
        rule_for(self)
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for ConfigKey {
    type Err = StoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for ConfigKey {
    type Error = StoreError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<ConfigKey> for String {
    fn from(key: ConfigKey) -> Self {
        key.raw
    }
}

/// How fragments from several scopes combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Highest-precedence scope wins outright.
    Override,
    /// Structural union across scopes.
    Merge(ListMerge),
}

/// Array handling inside a `Merge` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListMerge {
    /// Concatenate, dropping exact duplicates.
    Union,
    /// Concatenate, keeping per-scope order and duplicates.
    Concat,
}

/// Value reported when no scope defines the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyDefault {
    Unset,
    EmptyArray,
    EmptyObject,
}

impl KeyDefault {
    pub fn value(&self) -> Option<Value> {
        match self {
            KeyDefault::Unset => None,
            KeyDefault::EmptyArray => Some(Value::Array(Vec::new())),
            KeyDefault::EmptyObject => Some(Value::Object(Map::new())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRule {
    pub pattern: &'static str,
    pub policy: MergePolicy,
    pub default: KeyDefault,
}

const UNION: MergePolicy = MergePolicy::Merge(ListMerge::Union);
const CONCAT: MergePolicy = MergePolicy::Merge(ListMerge::Concat);

const fn rule(pattern: &'static str, policy: MergePolicy, default: KeyDefault) -> KeyRule {
    KeyRule {
        pattern,
        policy,
        default,
    }
}

/// Declared merge policies. `*` matches exactly one segment.
pub const POLICY_TABLE: &[KeyRule] = &[
    rule("permissions", UNION, KeyDefault::EmptyObject),
    rule("permissions.allow", UNION, KeyDefault::EmptyArray),
    rule("permissions.deny", UNION, KeyDefault::EmptyArray),
    rule("permissions.ask", UNION, KeyDefault::EmptyArray),
    rule("permissions.additionalDirectories", UNION, KeyDefault::EmptyArray),
    rule("hooks", CONCAT, KeyDefault::EmptyObject),
    rule("hooks.*", CONCAT, KeyDefault::EmptyArray),
    rule("enabledPlugins", UNION, KeyDefault::EmptyObject),
    rule("env", UNION, KeyDefault::EmptyObject),
    rule("statusLine", MergePolicy::Override, KeyDefault::Unset),
    rule("model", MergePolicy::Override, KeyDefault::Unset),
    rule("temperature", MergePolicy::Override, KeyDefault::Unset),
    rule("theme", MergePolicy::Override, KeyDefault::Unset),
];

const FALLBACK: KeyRule = rule("*", MergePolicy::Override, KeyDefault::Unset);

/// Look up the rule for `key`.
///
/// An exact pattern match wins; the most specific one if several match.
/// Otherwise the key inherits the policy of its nearest registered ancestor
/// with no default, and unregistered top-level keys are `Override`.
pub fn rule_for(key: &ConfigKey) -> KeyRule {
    let segments: Vec<&str> = key.segments().collect();

    let exact = POLICY_TABLE
        .iter()
        .filter(|rule| pattern_matches(rule.pattern, &segments))
        .min_by_key(|rule| wildcard_count(rule.pattern));
    if let Some(rule) = exact {
        return *rule;
    }

    (1..segments.len())
        .rev()
        .find_map(|len| {
            POLICY_TABLE
                .iter()
                .filter(|rule| pattern_matches(rule.pattern, &segments[..len]))
                .min_by_key(|rule| wildcard_count(rule.pattern))
        })
        .map(|ancestor| KeyRule {
            pattern: ancestor.pattern,
            policy: ancestor.policy,
            default: KeyDefault::Unset,
        })
        .unwrap_or(FALLBACK)
}

fn pattern_matches(pattern: &str, segments: &[&str]) -> bool {
    let parts: Vec<&str> = pattern.split('.').collect();
    parts.len() == segments.len()
        && parts
            .iter()
            .zip(segments)
            .all(|(part, segment)| *part == "*" || part == segment)
}

fn wildcard_count(pattern: &str) -> usize {
    pattern.split('.').filter(|part| *part == "*").count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> ConfigKey {
        ConfigKey::parse(raw).unwrap()
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(ConfigKey::parse("").is_err());
        assert!(ConfigKey::parse("permissions..allow").is_err());
        assert!(ConfigKey::parse("hooks.*").is_err());
    }

    #[test]
    fn prefix_respects_segment_boundaries() {
        assert!(key("permissions").is_prefix_of(&key("permissions.allow")));
        assert!(key("permissions").is_prefix_of(&key("permissions")));
        assert!(!key("perm").is_prefix_of(&key("permissions")));
        assert!(!key("permissions.allow").is_prefix_of(&key("permissions")));
        assert!(key("permissions.allow").overlaps(&key("permissions")));
    }

    #[test]
    fn registered_keys_use_declared_policy() {
        assert_eq!(key("permissions.allow").policy().policy, UNION);
        assert_eq!(
            key("permissions.allow").policy().default,
            KeyDefault::EmptyArray
        );
        assert_eq!(key("hooks").policy().policy, CONCAT);
        assert_eq!(key("model").policy().policy, MergePolicy::Override);
    }

    #[test]
    fn wildcard_rules_match_one_segment() {
        let rule = key("hooks.PreToolUse").policy();
        assert_eq!(rule.pattern, "hooks.*");
        assert_eq!(rule.default, KeyDefault::EmptyArray);
    }

    #[test]
    fn descendants_inherit_ancestor_policy_without_default() {
        let rule = key("enabledPlugins.formatter@tools").policy();
        assert_eq!(rule.policy, UNION);
        assert_eq!(rule.default, KeyDefault::Unset);

        let nested = key("statusLine.command").policy();
        assert_eq!(nested.policy, MergePolicy::Override);
    }

    #[test]
    fn unknown_keys_override() {
        let rule = key("includeCoAuthoredBy").policy();
        assert_eq!(rule.policy, MergePolicy::Override);
        assert_eq!(rule.default.value(), None);
    }
}
