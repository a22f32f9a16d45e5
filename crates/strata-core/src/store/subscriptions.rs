//! Subscription registry.
//!
//! Each subscription remembers the value it last published. The store
//! recomputes every subscribed key after a write, an external change or a
//! project switch, and the registry decides which callbacks are due.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use crate::key::ConfigKey;
use crate::resolver::EffectiveValue;

/// Callback invoked with the new effective value of a subscribed key.
pub type SubscriberFn = Arc<dyn Fn(&EffectiveValue) + Send + Sync>;

struct Entry {
    key: ConfigKey,
    callback: SubscriberFn,
    last: Option<Value>,
    /// Bumped every time a new value is recorded for delivery.
    stamp: u64,
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    inner: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: BTreeMap<u64, Entry>,
}

impl SubscriptionRegistry {
    pub(crate) fn insert(
        &self,
        key: ConfigKey,
        callback: SubscriberFn,
        current: Option<Value>,
    ) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.insert(
            id,
            Entry {
                key,
                callback,
                last: current,
                stamp: 0,
            },
        );
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        self.inner.lock().entries.remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Subscribed keys, in subscription order.
    pub(crate) fn keys(&self) -> Vec<(u64, ConfigKey)> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(id, entry)| (*id, entry.key.clone()))
            .collect()
    }

    /// Record `value` for subscription `id`.
    ///
    /// Returns the callback and a delivery stamp when the value differs from
    /// the last one published, or unconditionally with `force`.
    pub(crate) fn record(
        &self,
        id: u64,
        value: &EffectiveValue,
        force: bool,
    ) -> Option<(SubscriberFn, u64)> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(&id)?;
        if !force && entry.last == value.value {
            return None;
        }
        entry.last = value.value.clone();
        entry.stamp += 1;
        Some((Arc::clone(&entry.callback), entry.stamp))
    }

    /// False once a newer value was recorded or the subscription is gone.
    pub(crate) fn is_current(&self, id: u64, stamp: u64) -> bool {
        self.inner
            .lock()
            .entries
            .get(&id)
            .is_some_and(|entry| entry.stamp == stamp)
    }
}

/// Handle for a registered callback. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    key: ConfigKey,
    registry: Weak<SubscriptionRegistry>,
}

impl Subscription {
    pub(crate) fn new(id: u64, key: ConfigKey, registry: &Arc<SubscriptionRegistry>) -> Self {
        Self {
            id,
            key,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn key(&self) -> &ConfigKey {
        &self.key
    }

    /// Same as dropping the handle.
    pub fn unsubscribe(self) {}
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn effective(key: &ConfigKey, value: Value) -> EffectiveValue {
        EffectiveValue {
            key: key.clone(),
            value: Some(value),
            provenance: Vec::new(),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn record_skips_unchanged_values() {
        let registry = Arc::new(SubscriptionRegistry::default());
        let key = ConfigKey::parse("model").unwrap();
        let id = registry.insert(key.clone(), Arc::new(|_| {}), Some(json!("opus")));

        assert!(registry.record(id, &effective(&key, json!("opus")), false).is_none());
        assert!(registry.record(id, &effective(&key, json!("opus")), true).is_some());
        assert!(registry.record(id, &effective(&key, json!("haiku")), false).is_some());
    }

    #[test]
    fn newer_record_supersedes_pending_delivery() {
        let registry = Arc::new(SubscriptionRegistry::default());
        let key = ConfigKey::parse("theme").unwrap();
        let id = registry.insert(key.clone(), Arc::new(|_| {}), None);

        let (_, first) = registry.record(id, &effective(&key, json!("dark")), false).unwrap();
        let (_, second) = registry.record(id, &effective(&key, json!("light")), false).unwrap();

        assert!(!registry.is_current(id, first));
        assert!(registry.is_current(id, second));
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let registry = Arc::new(SubscriptionRegistry::default());
        let key = ConfigKey::parse("env").unwrap();
        let id = registry.insert(key.clone(), Arc::new(|_| {}), None);

        let handle = Subscription::new(id, key, &registry);
        assert_eq!(registry.len(), 1);
        drop(handle);
        assert_eq!(registry.len(), 0);
    }
}
