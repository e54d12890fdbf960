//! # Mutation Observers
//!
//! Composite attribute values are handed out wrapped so that mutating them
//! re-persists the whole attribute. Reads go through `Deref`; there is no
//! `DerefMut`, so a mutation cannot bypass the observer.
//!
//! An element that fails the serializability check is refused and leaves the
//! value untouched.

use std::ops::Deref;

use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::attrs::Attributes;
use crate::value;

/// A list attribute that writes itself back on every mutation.
#[derive(Clone, Debug)]
pub struct TrackedList {
    name: String,
    items: Vec<Value>,
    attrs: Attributes,
}

impl TrackedList {
    pub(crate) fn new(name: &str, items: Vec<Value>, attrs: Attributes) -> Self {
        Self { name: name.to_string(), items, attrs }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.items
    }

    fn commit(&self) {
        self.attrs.store_value(&self.name, Some(Value::Array(self.items.clone())));
    }

    /// Item assignment. False if `index` is out of range or `value` is not portable.
    pub fn set<V: Serialize>(&mut self, index: usize, value: V) -> bool {
        let Some(value) = value::encode(&value) else { return false };
        let Some(slot) = self.items.get_mut(index) else { return false };
        *slot = value;
        self.commit();
        true
    }

    /// Append.
    pub fn push<V: Serialize>(&mut self, value: V) -> bool {
        let Some(value) = value::encode(&value) else { return false };
        self.items.push(value);
        self.commit();
        true
    }

    /// Insert before `index`, clamped to the end like a list insert.
    pub fn insert<V: Serialize>(&mut self, index: usize, value: V) -> bool {
        let Some(value) = value::encode(&value) else { return false };
        let index = index.min(self.items.len());
        self.items.insert(index, value);
        self.commit();
        true
    }

    /// Delete by index.
    pub fn remove(&mut self, index: usize) -> Option<Value> {
        if index >= self.items.len() {
            return None;
        }
        let removed = self.items.remove(index);
        self.commit();
        Some(removed)
    }

    pub fn pop(&mut self) -> Option<Value> {
        let popped = self.items.pop()?;
        self.commit();
        Some(popped)
    }

    /// Removes the first element equal to `value`.
    pub fn remove_value<V: Serialize>(&mut self, value: V) -> bool {
        let Some(value) = value::encode(&value) else { return false };
        let Some(index) = self.items.iter().position(|item| *item == value) else { return false };
        self.items.remove(index);
        self.commit();
        true
    }

    /// In-place extension (`+=`). All-or-nothing: one unportable element
    /// rejects the whole batch.
    pub fn extend<I, V>(&mut self, values: I) -> bool
    where
        I: IntoIterator<Item = V>,
        V: Serialize,
    {
        let encoded: Option<Vec<Value>> = values.into_iter().map(|v| value::encode(&v)).collect();
        let Some(encoded) = encoded else { return false };
        self.items.extend(encoded);
        self.commit();
        true
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.commit();
    }
}

impl Deref for TrackedList {
    type Target = [Value];

    fn deref(&self) -> &[Value] {
        &self.items
    }
}

/// A map attribute that writes itself back on every mutation.
#[derive(Clone, Debug)]
pub struct TrackedMap {
    name: String,
    entries: Map<String, Value>,
    attrs: Attributes,
}

impl TrackedMap {
    pub(crate) fn new(name: &str, entries: Map<String, Value>, attrs: Attributes) -> Self {
        Self { name: name.to_string(), entries, attrs }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.entries
    }

    fn commit(&self) {
        self.attrs.store_value(&self.name, Some(Value::Object(self.entries.clone())));
    }

    /// Item assignment. Returns false if `value` is not portable.
    pub fn insert<V: Serialize>(&mut self, key: impl Into<String>, value: V) -> bool {
        let Some(value) = value::encode(&value) else { return false };
        self.entries.insert(key.into(), value);
        self.commit();
        true
    }

    /// Item deletion; also serves as `pop(key)`.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.entries.remove(key)?;
        self.commit();
        Some(removed)
    }

    /// Removes and returns the last entry in iteration order.
    pub fn pop_item(&mut self) -> Option<(String, Value)> {
        let key = self.entries.keys().next_back()?.clone();
        let value = self.entries.remove(&key)?;
        self.commit();
        Some((key, value))
    }

    /// Returns the existing value for `key`, inserting `default` first if absent.
    pub fn set_default<V: Serialize>(&mut self, key: &str, default: V) -> Option<Value> {
        if let Some(existing) = self.entries.get(key) {
            return Some(existing.clone());
        }
        let default = value::encode(&default)?;
        self.entries.insert(key.to_string(), default.clone());
        self.commit();
        Some(default)
    }

    /// Merges `other` in, overwriting existing keys; one write for the batch.
    pub fn update<I, K, V>(&mut self, other: I) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Serialize,
    {
        let encoded: Option<Vec<(String, Value)>> = other
            .into_iter()
            .map(|(k, v)| value::encode(&v).map(|v| (k.into(), v)))
            .collect();
        let Some(encoded) = encoded else { return false };
        self.entries.extend(encoded);
        self.commit();
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.commit();
    }
}

impl Deref for TrackedMap {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Map<String, Value> {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use crate::attrs::AttrValue;
    use crate::attrs::Attributes;
    use crate::attrs::Role;
    use crate::store::Store;

    fn attrs() -> (tempfile::TempDir, Store, Attributes) {
        let base = tempfile::tempdir().unwrap();
        let store = Store::allocate(base.path(), "dirrun").unwrap();
        let attrs = Attributes::new(store.clone(), Role::Caller);
        (base, store, attrs)
    }

    #[test]
    fn test_list_mutations_persist_full_value() {
        let (_base, store, attrs) = attrs();
        attrs.set("log", &json!(["boot"]));

        let Some(AttrValue::List(mut log)) = attrs.get("log") else { panic!("expected a list") };
        assert!(log.push("connect"));
        assert_eq!(store.read_attribute("log").unwrap(), Some(json!(["boot", "connect"])));

        assert!(log.insert(0, 0));
        assert!(log.set(1, "BOOT"));
        assert_eq!(log.pop(), Some(json!("connect")));
        assert!(log.extend([1, 2]));
        assert!(log.remove_value(0));
        assert_eq!(store.read_attribute("log").unwrap(), Some(json!(["BOOT", 1, 2])));

        log.clear();
        assert_eq!(store.read_attribute("log").unwrap(), Some(json!([])));
    }

    #[test]
    fn test_map_mutations_persist_full_value() {
        let (_base, store, attrs) = attrs();
        attrs.set("registers", &json!({"1": 0.5}));

        let mut value = attrs.get("registers").unwrap();
        let registers = value.as_map().unwrap();
        assert!(registers.insert("2", 1.5));
        assert_eq!(registers.set_default("1", 9), Some(json!(0.5)));
        assert_eq!(registers.set_default("3", 3), Some(json!(3)));
        assert!(registers.update([("4", 4)]));
        assert_eq!(registers.remove("1"), Some(json!(0.5)));

        assert_eq!(
            store.read_attribute("registers").unwrap(),
            Some(json!({"2": 1.5, "3": 3, "4": 4}))
        );

        assert_eq!(registers.pop_item(), Some(("4".to_string(), json!(4))));
        registers.clear();
        assert_eq!(store.read_attribute("registers").unwrap(), Some(json!({})));
    }

    #[test]
    fn test_unportable_element_leaves_value_untouched() {
        let (_base, store, attrs) = attrs();
        attrs.set("log", &json!([1]));
        let Some(AttrValue::List(mut log)) = attrs.get("log") else { panic!("expected a list") };

        let mut grid = HashMap::new();
        grid.insert((1u8, 2u8), 3u8);
        assert!(!log.push(&grid));
        assert!(!log.extend([None, Some(grid.clone())]));
        assert_eq!(log.len(), 1);
        assert_eq!(store.read_attribute("log").unwrap(), Some(json!([1])));
    }
}
