//! # Portable Values
//!
//! Everything that crosses the channel is a [`Value`]: booleans, numbers,
//! strings, null, and arrays/objects nested out of those. Any Rust value whose
//! `Serialize` impl lands in that shape is accepted. Anything else is dropped
//! at the boundary instead of raising.
//!
//! ## Invariants
//!
//! - The caller and the worker use the same predicate ([`encode`]).
//! - An [`Args`] that saw a rejected value stays rejected; it is never written.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Map;
use serde_json::Value;

/// Converts `value` to its wire form, or `None` if it cannot cross the boundary.
pub fn encode<V: Serialize + ?Sized>(value: &V) -> Option<Value> {
    match serde_json::to_value(value) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(error = %e, "value rejected by serializability check");
            None
        }
    }
}

/// Whether `value` may cross the boundary.
pub fn is_portable<V: Serialize + ?Sized>(value: &V) -> bool {
    encode(value).is_some()
}

/// Collapses a stored `null` into "no result".
pub(crate) fn non_null(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        value => Some(value),
    }
}

/// Failures while pulling typed parameters out of [`Args`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgError {
    /// Neither the positional slot nor the named key was supplied.
    Missing { index: usize, name: String },
    /// The supplied value does not deserialize into the requested type.
    Type { param: String, details: String },
}

impl std::fmt::Display for ArgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing { index, name } => {
                write!(f, "missing argument '{}' (position {})", name, index)
            }
            Self::Type { param, details } => {
                write!(f, "argument '{}' has the wrong type: {}", param, details)
            }
        }
    }
}

impl std::error::Error for ArgError {}

/// Positional and named arguments for one call or one constructor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Args {
    positional: Vec<Value>,
    named: Map<String, Value>,
    rejected: bool,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds arguments that were already checked, e.g. read back from a record.
    pub fn from_parts(positional: Vec<Value>, named: Map<String, Value>) -> Self {
        Self { positional, named, rejected: false }
    }

    /// Appends a positional argument.
    pub fn arg<V: Serialize>(mut self, value: V) -> Self {
        self.push(value);
        self
    }

    /// Adds a named argument, replacing an earlier one with the same name.
    pub fn named<V: Serialize>(mut self, name: impl Into<String>, value: V) -> Self {
        self.insert(name, value);
        self
    }

    pub fn push<V: Serialize>(&mut self, value: V) {
        match encode(&value) {
            Some(value) => self.positional.push(value),
            None => self.rejected = true,
        }
    }

    pub fn insert<V: Serialize>(&mut self, name: impl Into<String>, value: V) {
        match encode(&value) {
            Some(value) => {
                self.named.insert(name.into(), value);
            }
            None => self.rejected = true,
        }
    }

    /// False once any argument failed the serializability check.
    pub fn is_portable(&self) -> bool {
        !self.rejected
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn named_args(&self) -> &Map<String, Value> {
        &self.named
    }

    pub fn into_parts(self) -> (Vec<Value>, Map<String, Value>) {
        (self.positional, self.named)
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a parameter the way a keyword-aware signature would: by name
    /// first, then by position.
    pub fn lookup(&self, index: usize, name: &str) -> Option<&Value> {
        self.named.get(name).or_else(|| self.positional.get(index))
    }

    /// Typed parameter; missing is an error.
    pub fn param<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, ArgError> {
        match self.lookup(index, name) {
            Some(value) => decode(value, name),
            None => Err(ArgError::Missing { index, name: name.to_string() }),
        }
    }

    /// Typed parameter with a default for when it was not supplied.
    pub fn param_or<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
        default: T,
    ) -> Result<T, ArgError> {
        match self.lookup(index, name) {
            Some(value) => decode(value, name),
            None => Ok(default),
        }
    }
}

fn decode<T: DeserializeOwned>(value: &Value, name: &str) -> Result<T, ArgError> {
    T::deserialize(value).map_err(|e| ArgError::Type {
        param: name.to_string(),
        details: e.to_string(),
    })
}

/// Builds positional [`Args`]: `args![2, 3]`.
#[macro_export]
macro_rules! args {
    () => { $crate::value::Args::new() };
    ($($value:expr),+ $(,)?) => {
        $crate::value::Args::new()$(.arg($value))+
    };
}
