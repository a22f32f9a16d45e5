//! Precedence resolution
//!
//! Combines the per-scope fragments of one key into its effective value.
//! `Override` keys take the highest-precedence fragment verbatim; `Merge` keys
//! are folded lowest to highest:
//! - objects merge recursively, a higher scope overriding overlapping members
//! - arrays union (exact-equality de-dup) or concatenate, per the key table
//! - `null` anywhere means "not specified" and never clears a lower scope

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::key::{ConfigKey, ListMerge, MergePolicy};
use crate::scope::Scope;

/// A scope skipped during resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeWarning {
    pub scope: Scope,
    pub path: PathBuf,
    pub message: String,
}

/// Resolved value of a key under the current project context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveValue {
    pub key: ConfigKey,
    /// `None` when no scope defines the key and it has no declared default.
    pub value: Option<Value>,
    /// Contributing scopes, highest precedence first.
    pub provenance: Vec<Scope>,
    pub warnings: Vec<ScopeWarning>,
}

impl EffectiveValue {
    /// Highest-precedence contributing scope.
    pub fn origin(&self) -> Option<Scope> {
        self.provenance.first().copied()
    }

    /// True when some scope defines the key, as opposed to a default.
    pub fn is_defined(&self) -> bool {
        !self.provenance.is_empty()
    }

    pub fn value_or_null(&self) -> Value {
        self.value.clone().unwrap_or(Value::Null)
    }
}

/// Resolve `key` from per-scope fragments, `order` listing scopes highest first.
///
/// Scopes absent from `order` are ignored. The result depends only on the
/// fragments and `order`.
pub fn resolve(
    key: &ConfigKey,
    fragments: &BTreeMap<Scope, Value>,
    order: &[Scope],
) -> EffectiveValue {
    let rule = key.policy();
    let layers = layers_lowest_first(fragments, order);

    let (value, provenance) = match rule.policy {
        MergePolicy::Override => match layers.last() {
            Some((scope, value)) => (Some((*value).clone()), vec![*scope]),
            None => (None, Vec::new()),
        },
        MergePolicy::Merge(lists) => {
            let mut merged: Option<Value> = None;
            for (_, fragment) in &layers {
                match merged.as_mut() {
                    Some(base) => merge_into(base, fragment, lists),
                    None => merged = Some(normalized(fragment, lists)),
                }
            }
            let provenance = layers.iter().rev().map(|(scope, _)| *scope).collect();
            (merged, provenance)
        }
    };

    EffectiveValue {
        key: key.clone(),
        value: value.or_else(|| rule.default.value()),
        provenance,
        warnings: Vec::new(),
    }
}

/// Recover which scope supplied each part of the resolved value.
///
/// Union array elements are credited to the lowest scope that lists them,
/// concatenated arrays to every scope, and scalars and overridden members to
/// the highest scope defining them. Resolving the returned map again yields
/// the same value.
pub fn split_by_provenance(
    key: &ConfigKey,
    fragments: &BTreeMap<Scope, Value>,
    order: &[Scope],
) -> BTreeMap<Scope, Value> {
    let layers = layers_lowest_first(fragments, order);
    let lists = match key.policy().policy {
        MergePolicy::Merge(lists) => lists,
        MergePolicy::Override => {
            return layers
                .last()
                .map(|(scope, value)| BTreeMap::from([(*scope, (*value).clone())]))
                .unwrap_or_default();
        }
    };

    match resolve(key, fragments, order) {
        EffectiveValue {
            value: Some(merged),
            provenance,
            ..
        } if !provenance.is_empty() => split_value(&merged, &layers, lists),
        _ => BTreeMap::new(),
    }
}

fn layers_lowest_first<'a>(
    fragments: &'a BTreeMap<Scope, Value>,
    order: &[Scope],
) -> Vec<(Scope, &'a Value)> {
    let mut seen = Vec::with_capacity(order.len());
    for scope in order {
        if !seen.contains(scope) {
            seen.push(*scope);
        }
    }
    seen.iter()
        .rev()
        .filter_map(|scope| {
            fragments
                .get(scope)
                .filter(|value| !value.is_null())
                .map(|value| (*scope, value))
        })
        .collect()
}

fn merge_into(base: &mut Value, overlay: &Value, lists: ListMerge) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                if overlay_value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => merge_into(existing, overlay_value, lists),
                    None => {
                        base_map.insert(key.clone(), normalized(overlay_value, lists));
                    }
                }
            }
        }
        (Value::Array(base_items), Value::Array(overlay_items)) => match lists {
            ListMerge::Union => {
                for item in overlay_items {
                    if !base_items.contains(item) {
                        base_items.push(item.clone());
                    }
                }
            }
            ListMerge::Concat => base_items.extend(overlay_items.iter().cloned()),
        },
        (base, overlay) => *base = normalized(overlay, lists),
    }
}

/// `value` with nulls dropped and union arrays de-duplicated.
fn normalized(value: &Value, lists: ListMerge) -> Value {
    let mut empty = match value {
        Value::Object(_) => Value::Object(Map::new()),
        Value::Array(_) => Value::Array(Vec::new()),
        other => return other.clone(),
    };
    merge_into(&mut empty, value, lists);
    empty
}

fn same_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Object(_), Value::Object(_)) | (Value::Array(_), Value::Array(_))
    ) || (!a.is_object() && !a.is_array() && !b.is_object() && !b.is_array())
}

fn split_value(
    merged: &Value,
    layers: &[(Scope, &Value)],
    lists: ListMerge,
) -> BTreeMap<Scope, Value> {
    // A layer of a different shape replaced everything below it.
    let start = layers
        .iter()
        .rposition(|(_, value)| !same_kind(value, merged))
        .map_or(0, |index| index + 1);
    let layers = &layers[start..];
    let Some((highest, _)) = layers.last() else {
        return BTreeMap::new();
    };

    let mut parts = BTreeMap::new();
    match merged {
        Value::Object(members) if !members.is_empty() => {
            for (name, member) in members {
                let sub_layers: Vec<(Scope, &Value)> = layers
                    .iter()
                    .filter_map(|(scope, value)| {
                        value
                            .as_object()?
                            .get(name)
                            .filter(|sub| !sub.is_null())
                            .map(|sub| (*scope, sub))
                    })
                    .collect();
                for (scope, part) in split_value(member, &sub_layers, lists) {
                    if let Value::Object(map) = parts
                        .entry(scope)
                        .or_insert_with(|| Value::Object(Map::new()))
                    {
                        map.insert(name.clone(), part);
                    }
                }
            }
        }
        Value::Array(items) if !items.is_empty() => match lists {
            ListMerge::Union => {
                for item in items {
                    let owner = layers
                        .iter()
                        .find(|(_, value)| value.as_array().is_some_and(|a| a.contains(item)))
                        .map_or(*highest, |(scope, _)| *scope);
                    if let Value::Array(owned) = parts
                        .entry(owner)
                        .or_insert_with(|| Value::Array(Vec::new()))
                    {
                        owned.push(item.clone());
                    }
                }
            }
            ListMerge::Concat => {
                for (scope, value) in layers {
                    if value.as_array().is_some_and(|a| !a.is_empty()) {
                        parts.insert(*scope, (*value).clone());
                    }
                }
            }
        },
        other => {
            parts.insert(*highest, other.clone());
        }
    }
    parts
}
