//! # dirrun
//!
//! Drives an object that lives in a detached worker process as if it were
//! local. The only thing the two processes share is a directory tree: calls
//! and attribute values are files in it, and removing it ends the worker.

pub mod attrs;
pub mod bind;
pub mod bootstrap;
pub mod channel;
pub mod dispatch;
pub mod lifecycle;
pub mod marshal;
pub mod record;
pub mod store;
pub mod table;
pub mod tracked;
pub mod value;

pub use attrs::AttrValue;
pub use attrs::Attributes;
pub use bootstrap::Targets;
pub use channel::Channel;
pub use channel::ChannelBuilder;
pub use channel::ChannelConfig;
pub use lifecycle::Registry;
pub use marshal::CallMode;
pub use marshal::CallStatus;
pub use marshal::Reply;
pub use marshal::Wait;
pub use record::CallId;
pub use table::OperationTable;
pub use table::Target;
pub use value::Args;

/// Failures that reach the host: building a channel, or starting a worker.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Store(store::Error),
    /// The worker could not be launched.
    Spawn(std::io::Error),
    /// Constructor arguments failed the serializability check.
    Encode(String),
    /// The launch manifest is missing or unreadable.
    Manifest(String),
    /// The manifest names a target this executable does not serve.
    UnknownTarget(String),
    /// The target's constructor failed in the worker.
    Construct(anyhow::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Store(e) => write!(f, "Store error: {}", e),
            Self::Spawn(e) => write!(f, "Worker launch failed: {}", e),
            Self::Encode(msg) => write!(f, "Encode error: {}", msg),
            Self::Manifest(msg) => write!(f, "Manifest error: {}", msg),
            Self::UnknownTarget(name) => write!(f, "Unknown target type '{}'", name),
            Self::Construct(e) => write!(f, "Target construction failed: {:#}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) | Self::Spawn(e) => Some(e),
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<store::Error> for Error {
    fn from(e: store::Error) -> Self {
        Self::Store(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests;
