//! # Attribute Synchronizer
//!
//! Mirrors plain-data attributes through the channel directory so both roles
//! observe the same values. Each side keeps an in-memory mirror; the record
//! on disk is authoritative whenever it exists.
//!
//! ## Invariants
//!
//! - The first read of a declared attribute materializes its record.
//! - A value that fails the serializability check has no record: setting one
//!   removes whatever record was there.
//! - Composite values come back wrapped in a mutation observer; every
//!   mutation rewrites the complete record.
//! - Names starting with `_` are internal and never touch the directory.
//! - Every other name shares the channel root with the method directories:
//!   it must be a plain entry name and must not be one of the target's
//!   operations. Refused names are logged and ignored.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

use crate::store;
use crate::store::Store;
use crate::tracked::TrackedList;
use crate::tracked::TrackedMap;
use crate::value;

/// Which side of the channel a handle lives on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Caller,
    Worker,
}

/// What a read hands back.
#[derive(Clone, Debug)]
pub enum AttrValue {
    Plain(Value),
    List(TrackedList),
    Map(TrackedMap),
}

impl AttrValue {
    /// The current value, unwrapped from any observer.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Plain(value) => value.clone(),
            Self::List(list) => Value::Array(list.to_vec()),
            Self::Map(map) => Value::Object((**map).clone()),
        }
    }

    pub fn as_list(&mut self) -> Option<&mut TrackedList> {
        match self {
            Self::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_map(&mut self) -> Option<&mut TrackedMap> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }
}

struct Shared {
    store: Store,
    role: Role,
    mirror: DashMap<String, Value>,
    operations: HashSet<String>,
    halted: AtomicBool,
}

/// Cloneable handle to one side's attributes.
#[derive(Clone)]
pub struct Attributes {
    shared: Arc<Shared>,
    sync: bool,
}

impl std::fmt::Debug for Attributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attributes")
            .field("root", &self.shared.store.root())
            .field("role", &self.shared.role)
            .field("sync", &self.sync)
            .finish()
    }
}

pub fn is_internal(name: &str) -> bool {
    name.starts_with('_')
}

impl Attributes {
    pub(crate) fn new(store: Store, role: Role) -> Self {
        Self::with_operations(store, role, std::iter::empty::<&str>())
    }

    /// Attributes for a channel whose target exposes `operations`; those
    /// names belong to method directories and are refused here.
    pub(crate) fn with_operations<I, S>(store: Store, role: Role, operations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            shared: Arc::new(Shared {
                store,
                role,
                mirror: DashMap::new(),
                operations: operations.into_iter().map(Into::into).collect(),
                halted: AtomicBool::new(false),
            }),
            sync: true,
        }
    }

    /// A handle onto the same mirror that no longer writes through to disk.
    pub fn detached(&self) -> Self {
        Self { shared: Arc::clone(&self.shared), sync: false }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn is_synced(&self) -> bool {
        self.sync
    }

    /// Set on the worker side when a write found the channel directory gone.
    pub fn halted(&self) -> bool {
        self.shared.halted.load(Ordering::Acquire)
    }

    pub(crate) fn halt(&self) {
        self.shared.halted.store(true, Ordering::Release);
    }

    /// Whether `name` may be used as an attribute on this channel.
    pub fn accepts(&self, name: &str) -> bool {
        is_internal(name) || (store::is_entry_name(name) && !self.shared.operations.contains(name))
    }

    fn refuse(&self, name: &str) -> bool {
        if self.accepts(name) {
            return false;
        }
        tracing::warn!(name, "attribute name collides with the channel layout, ignored");
        true
    }

    /// Records an in-memory default without persisting it. The first read
    /// (or the worker's priming pass) materializes the record.
    pub fn declare<V: Serialize>(&self, name: &str, value: V) {
        if self.refuse(name) {
            return;
        }
        match value::encode(&value) {
            Some(value) => {
                self.shared.mirror.insert(name.to_string(), value);
            }
            None => tracing::warn!(name, "default is not portable, attribute not declared"),
        }
    }

    /// Names currently held in the in-memory mirror.
    pub fn names(&self) -> Vec<String> {
        self.shared.mirror.iter().map(|e| e.key().clone()).collect()
    }

    /// The in-memory mirror only, without consulting the directory.
    pub fn local(&self, name: &str) -> Option<Value> {
        self.shared.mirror.get(name).map(|e| e.value().clone())
    }

    pub fn get(&self, name: &str) -> Option<AttrValue> {
        if self.refuse(name) {
            return None;
        }
        if is_internal(name) || !self.sync {
            return self.local(name).map(AttrValue::Plain);
        }

        match self.shared.store.read_attribute(name) {
            Ok(Some(value)) => {
                self.shared.mirror.insert(name.to_string(), value.clone());
                return Some(self.wrap(name, value));
            }
            Ok(None) => {}
            Err(store::Error::Corrupt { .. }) => {
                // Mid-write by the other side; serve the mirror without persisting it.
                tracing::debug!(name, "attribute record not ready");
                return self.local(name).map(|value| self.wrap(name, value));
            }
            Err(e) => tracing::debug!(name, error = %e, "attribute read failed"),
        }

        let default = self.local(name)?;
        self.write_through(name, Some(&default));
        Some(self.wrap(name, default))
    }

    /// Typed read of the current value.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, name: &str) -> Option<T> {
        let value = self.get(name)?.to_value();
        serde_json::from_value(value).ok()
    }

    /// Updates the mirror and, when synced, persists `value` or removes the
    /// record if `value` is not portable.
    pub fn set<V: Serialize + ?Sized>(&self, name: &str, value: &V) {
        self.store_value(name, value::encode(value));
    }

    pub(crate) fn store_value(&self, name: &str, value: Option<Value>) {
        if self.refuse(name) {
            return;
        }
        if self.sync && !is_internal(name) {
            self.write_through(name, value.as_ref());
        }
        match value {
            Some(value) => {
                self.shared.mirror.insert(name.to_string(), value);
            }
            None => {
                self.shared.mirror.remove(name);
            }
        }
    }

    fn write_through(&self, name: &str, value: Option<&Value>) {
        let store = &self.shared.store;
        let outcome = match value {
            Some(value) => store.write_attribute(name, value),
            None => store.remove_attribute(name),
        };

        match outcome {
            Ok(()) => tracing::trace!(name, "attribute persisted"),
            Err(store::Error::Missing(_)) => match self.shared.role {
                Role::Worker => {
                    tracing::info!(name, "channel directory gone, worker halting");
                    self.halt();
                }
                Role::Caller => tracing::warn!(name, "channel directory gone, attribute not persisted"),
            },
            Err(e) => tracing::warn!(name, error = %e, "attribute write failed"),
        }
    }

    /// Reads every declared attribute that has no record yet, so worker-side
    /// defaults become visible without an explicit first write. Returns how
    /// many were materialized.
    pub fn prime(&self) -> usize {
        let mut primed = 0;
        for name in self.names() {
            if is_internal(name.as_str()) || self.shared.store.attr_path(&name).exists() {
                continue;
            }
            if self.get(&name).is_some() {
                primed += 1;
            }
        }
        primed
    }

    fn wrap(&self, name: &str, value: Value) -> AttrValue {
        match value {
            Value::Array(items) => AttrValue::List(TrackedList::new(name, items, self.clone())),
            Value::Object(map) => AttrValue::Map(TrackedMap::new(name, map, self.clone())),
            value => AttrValue::Plain(value),
        }
    }
}
