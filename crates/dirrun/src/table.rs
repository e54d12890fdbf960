//! # Operation Table
//!
//! The explicit map from operation names to typed handlers that stands in for
//! intercepting every attribute access on an object. A target type builds its
//! table once; the caller side only reads the names out of it, the worker
//! side dispatches through it.
//!
//! ## Philosophy
//!
//! - **Composition**: the channel holds a plain instance of the target and
//!   owns the table. The target type itself is never altered.
//! - **Receiver by kind**: an [`OpKind::Instance`] handler receives the
//!   worker's own instance first, an [`OpKind::Static`] handler receives
//!   none. Class-level operations are static ones in Rust.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::attrs::Attributes;
use crate::store;
use crate::value;
use crate::value::Args;

/// Names that belong to the channel itself and are never proxied.
pub const RESERVED: [&str; 6] = [
    "terminate",
    "result",
    "result_by_id",
    "bind",
    "check_bindings",
    "is_active",
];

/// A type whose operations can be driven through a channel.
pub trait Target: Sized + Send + 'static {
    /// Type descriptor written into the launch manifest; the worker uses it
    /// to find the constructor.
    const NAME: &'static str;

    /// Builds the worker-side instance from the constructor arguments the
    /// caller supplied. The target may keep `attrs` and declare defaults on it.
    fn construct(args: &Args, attrs: &Attributes) -> anyhow::Result<Self>;

    /// Registers every exposed operation.
    fn operations(table: &mut OperationTable<Self>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The name cannot be used as a method directory.
    InvalidName(String),
    /// The name belongs to the channel's own operations.
    Reserved(String),
    Duplicate(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "'{}' is not a valid operation name", name),
            Self::Reserved(name) => write!(f, "'{}' is reserved by the channel", name),
            Self::Duplicate(name) => write!(f, "operation '{}' is already registered", name),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OpKind {
    Instance,
    Static,
}

type InstanceFn<T> = Box<dyn Fn(&mut T, &Args) -> anyhow::Result<Value> + Send + Sync>;
type StaticFn = Box<dyn Fn(&Args) -> anyhow::Result<Value> + Send + Sync>;

pub enum Handler<T> {
    Instance(InstanceFn<T>),
    Static(StaticFn),
}

impl<T> Handler<T> {
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Instance(_) => OpKind::Instance,
            Self::Static(_) => OpKind::Static,
        }
    }

    pub fn invoke(&self, target: &mut T, args: &Args) -> anyhow::Result<Value> {
        match self {
            Self::Instance(f) => f(target, args),
            Self::Static(f) => f(args),
        }
    }
}

/// Results that fail the serializability check are stored as null.
fn portable<R: Serialize>(result: R) -> Value {
    value::encode(&result).unwrap_or(Value::Null)
}

/// Checks that `name` can name a method directory and is not the channel's own.
pub fn validate_name(name: &str) -> Result<()> {
    if !store::is_entry_name(name) {
        return Err(Error::InvalidName(name.to_string()));
    }
    if RESERVED.contains(&name) {
        return Err(Error::Reserved(name.to_string()));
    }
    Ok(())
}

pub struct OperationTable<T> {
    ops: HashMap<String, Handler<T>>,
}

impl<T> OperationTable<T> {
    pub fn new() -> Self {
        Self { ops: HashMap::new() }
    }

    pub fn insert(&mut self, name: &str, handler: Handler<T>) -> Result<()> {
        validate_name(name)?;
        if self.ops.contains_key(name) {
            return Err(Error::Duplicate(name.to_string()));
        }
        self.ops.insert(name.to_string(), handler);
        Ok(())
    }

    /// Registers an operation that receives the instance. Invalid names are
    /// logged and skipped.
    pub fn method<R, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        R: Serialize,
        F: Fn(&mut T, &Args) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let handler = Handler::Instance(Box::new(move |target: &mut T, args: &Args| {
            f(target, args).map(portable)
        }));
        if let Err(e) = self.insert(name, handler) {
            tracing::warn!(error = %e, "operation skipped");
        }
        self
    }

    /// Registers an operation without a receiver (static or class-level).
    pub fn function<R, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        R: Serialize,
        F: Fn(&Args) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let handler = Handler::Static(Box::new(move |args: &Args| f(args).map(portable)));
        if let Err(e) = self.insert(name, handler) {
            tracing::warn!(error = %e, "operation skipped");
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Handler<T>> {
        self.ops.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    pub fn kind(&self, name: &str) -> Option<OpKind> {
        self.ops.get(name).map(Handler::kind)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl<T: Target> OperationTable<T> {
    /// The table for `T`, built from its own registration.
    pub fn of() -> Self {
        let mut table = Self::new();
        T::operations(&mut table);
        table
    }
}

impl<T> Default for OperationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    struct Counter {
        hits: u32,
    }

    fn table() -> OperationTable<Counter> {
        let mut table = OperationTable::new();
        table
            .method("hit", |c: &mut Counter, _| {
                c.hits += 1;
                Ok(c.hits)
            })
            .function("double", |args| Ok(args.param::<i64>(0, "n")? * 2))
            .method("grid", |_, _| {
                let mut grid = HashMap::new();
                grid.insert((1u8, 1u8), 0u8);
                Ok(grid)
            });
        table
    }

    #[test]
    fn test_kinds_decide_the_receiver() {
        let table = table();
        let mut counter = Counter { hits: 0 };

        assert_eq!(table.kind("hit"), Some(OpKind::Instance));
        assert_eq!(table.kind("double"), Some(OpKind::Static));

        let hit = table.get("hit").unwrap();
        assert_eq!(hit.invoke(&mut counter, &Args::new()).unwrap(), json!(1));
        assert_eq!(counter.hits, 1);

        let double = table.get("double").unwrap();
        assert_eq!(double.invoke(&mut counter, &crate::args![21]).unwrap(), json!(42));
        assert_eq!(counter.hits, 1);
    }

    #[test]
    fn test_unportable_result_becomes_null() {
        let table = table();
        let mut counter = Counter { hits: 0 };
        let grid = table.get("grid").unwrap();
        assert_eq!(grid.invoke(&mut counter, &Args::new()).unwrap(), Value::Null);
    }

    #[test]
    fn test_names_are_validated() {
        assert!(validate_name("read_register").is_ok());
        assert_eq!(validate_name("12"), Err(Error::InvalidName("12".into())));
        assert_eq!(validate_name("a/b"), Err(Error::InvalidName("a/b".into())));
        assert_eq!(validate_name("__init__"), Err(Error::InvalidName("__init__".into())));
        assert_eq!(validate_name("terminate"), Err(Error::Reserved("terminate".into())));

        let mut table = table();
        table.function("bind", |_| Ok(()));
        table.function("double", |_| Ok(0));
        assert!(!table.contains("bind"));
        assert_eq!(table.len(), 3);
    }
}
