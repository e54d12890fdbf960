//! # Channel Store
//!
//! Owns one channel's working directory and moves whole records in and out
//! of it.
//!
//! ```text
//! <base>/<namespace>/<channel-id>/
//!     __bootstrap__          launch manifest, consumed by the worker
//!     <attribute>            {"v": ...}
//!     <method>/<call-id>     {"a": [...], "k": {...}, "r": ...}
//! ```
//!
//! ## Invariants
//!
//! - Reads and writes are whole-file. A record caught mid-write fails to
//!   parse and surfaces as [`Error::Corrupt`]; pollers treat that as "not
//!   ready" and look again on their next pass. This is best-effort, not a
//!   guarantee.
//! - Nothing here recreates the channel root. Once it is gone every write
//!   fails with [`Error::Missing`].
//! - Attribute records and method directories share the root, so every name
//!   placed there is a single path component (see [`is_entry_name`]).

use std::fs;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;

use rand::Rng;
use serde_json::Value;

use crate::record::AttrRecord;
use crate::record::CallId;
use crate::record::CallRecord;
use crate::value::Args;

/// File holding the launch manifest until the worker consumes it.
pub const BOOTSTRAP_FILE: &str = "__bootstrap__";

const CHANNEL_IDS: std::ops::RangeInclusive<u64> = 111..=9_999_999_999;

/// True when `name` can sit directly under the channel root: one path
/// component, not numeric, and clear of the `__` names the channel keeps
/// for itself.
pub fn is_entry_name(name: &str) -> bool {
    !(name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with("__")
        || name.contains(['/', '\\', '\0'])
        || name.bytes().all(|b| b.is_ascii_digit()))
}

/// Strong type for channel identifiers (the channel directory's name).
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

#[derive(Debug)]
pub enum Error {
    /// The channel directory no longer exists.
    Missing(PathBuf),
    /// A record exists but does not parse (yet).
    Corrupt { path: PathBuf, details: String },
    /// A directory name that is not a channel id.
    BadRoot(PathBuf),
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(path) => write!(f, "Channel directory missing: {}", path.display()),
            Self::Corrupt { path, details } => {
                write!(f, "Unreadable record {}: {}", path.display(), details)
            }
            Self::BadRoot(path) => write!(f, "Not a channel directory: {}", path.display()),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Handle to one channel directory. Cloning it is cheap; all clones address
/// the same tree.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
    id: ChannelId,
}

impl Store {
    /// Creates a fresh channel directory under `<base>/<namespace>`, drawing
    /// random ids until an unused one is found.
    pub fn allocate(base: &Path, namespace: &str) -> Result<Self> {
        let parent = base.join(namespace);
        fs::create_dir_all(&parent)?;

        let mut rng = rand::thread_rng();
        loop {
            let id = ChannelId(rng.gen_range(CHANNEL_IDS));
            let root = parent.join(id.0.to_string());
            match fs::create_dir(&root) {
                Ok(()) => {
                    tracing::debug!(path = %root.display(), "allocated channel directory");
                    return Ok(Self { root, id });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Opens an existing channel directory, as the worker does with the one
    /// it was launched in.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let id = root
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.parse().ok())
            .map(ChannelId)
            .ok_or_else(|| Error::BadRoot(root.clone()))?;

        if !root.is_dir() {
            return Err(Error::Missing(root));
        }
        Ok(Self { root, id })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn method_dir(&self, method: &str) -> PathBuf {
        self.root.join(method)
    }

    pub fn call_path(&self, method: &str, id: CallId) -> PathBuf {
        self.method_dir(method).join(id.to_string())
    }

    pub fn attr_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Maps an I/O failure to `Missing` when the root is what disappeared.
    fn classify(&self, e: std::io::Error) -> Error {
        if !self.exists() {
            Error::Missing(self.root.clone())
        } else {
            Error::Io(e)
        }
    }

    fn ensure_method_dir(&self, method: &str) -> Result<PathBuf> {
        let dir = self.method_dir(method);
        match fs::create_dir(&dir) {
            Ok(()) => Ok(dir),
            Err(e) if e.kind() == ErrorKind::AlreadyExists && dir.is_dir() => Ok(dir),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::Io(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("'{}' is taken by a non-directory entry", method),
            ))),
            Err(e) => Err(self.classify(e)),
        }
    }

    /// Persists a new call under the next free id above both the highest
    /// existing id and `floor`. Collisions with a concurrent writer bump the id
    /// and try again, so ids never repeat.
    pub fn create_call(&self, method: &str, floor: CallId, args: &Args) -> Result<CallId> {
        let dir = self.ensure_method_dir(method)?;
        let bytes = encode_record(&CallRecord::request(args))?;

        let highest = self.highest_call_id(method)?.unwrap_or(CallId::FLOOR);
        let mut id = highest.max(floor).max(CallId::FLOOR).next();
        loop {
            let path = dir.join(id.to_string());
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(&bytes).map_err(|e| self.classify(e))?;
                    tracing::debug!(method, %id, "call record written");
                    return Ok(id);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => id = id.next(),
                Err(e) => return Err(self.classify(e)),
            }
        }
    }

    /// Persists a request under an exact id; fails if that id is taken.
    pub fn write_call(&self, method: &str, id: CallId, args: &Args) -> Result<()> {
        let dir = self.ensure_method_dir(method)?;
        let bytes = encode_record(&CallRecord::request(args))?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(id.to_string()))
            .map_err(|e| self.classify(e))?;
        file.write_all(&bytes).map_err(|e| self.classify(e))?;
        Ok(())
    }

    /// `Ok(None)` when the record does not exist.
    pub fn read_call(&self, method: &str, id: CallId) -> Result<Option<CallRecord>> {
        let path = self.call_path(method, id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return if self.exists() { Ok(None) } else { Err(Error::Missing(self.root.clone())) };
            }
            Err(e) => return Err(self.classify(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::Corrupt { path, details: e.to_string() })
    }

    /// Overwrites a record in place with its completed form and returns the
    /// file's new modification time.
    pub fn write_result(&self, method: &str, id: CallId, record: &CallRecord) -> Result<SystemTime> {
        let path = self.call_path(method, id);
        if !self.exists() {
            return Err(Error::Missing(self.root.clone()));
        }
        fs::write(&path, encode_record(record)?).map_err(|e| self.classify(e))?;
        let modified = fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .map_err(|e| self.classify(e))?;
        Ok(modified)
    }

    /// `Ok(None)` when the record does not exist.
    pub fn modified(&self, method: &str, id: CallId) -> Result<Option<SystemTime>> {
        match fs::metadata(self.call_path(method, id)) {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.classify(e)),
        }
    }

    /// Method directories, in directory-listing order.
    pub fn list_methods(&self) -> Result<Vec<String>> {
        let mut methods = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| self.classify(e))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                methods.push(name.to_string());
            }
        }
        Ok(methods)
    }

    /// Call ids present for `method`, in directory-listing order. Entries whose
    /// names are not purely numeric are ignored.
    pub fn list_call_ids(&self, method: &str) -> Result<Vec<CallId>> {
        let entries = match fs::read_dir(self.method_dir(method)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound && self.exists() => return Ok(Vec::new()),
            Err(e) => return Err(self.classify(e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(CallId::parse) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    pub fn highest_call_id(&self, method: &str) -> Result<Option<CallId>> {
        Ok(self.list_call_ids(method)?.into_iter().max())
    }

    pub fn write_attribute(&self, name: &str, value: &Value) -> Result<()> {
        if !self.exists() {
            return Err(Error::Missing(self.root.clone()));
        }
        let record = AttrRecord { value: value.clone() };
        fs::write(self.attr_path(name), encode_record(&record)?).map_err(|e| self.classify(e))
    }

    /// `Ok(None)` when there is no record for `name`.
    pub fn read_attribute(&self, name: &str) -> Result<Option<Value>> {
        let path = self.attr_path(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.classify(e)),
        };
        serde_json::from_slice::<AttrRecord>(&bytes)
            .map(|record| Some(record.value))
            .map_err(|e| Error::Corrupt { path, details: e.to_string() })
    }

    /// Removing an attribute that has no record is not an error.
    pub fn remove_attribute(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.attr_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.classify(e)),
        }
    }

    /// Recursively deletes the channel directory. Returns whether anything
    /// was removed; calling it again is harmless.
    pub fn remove(&self) -> Result<bool> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn encode_record<R: serde::Serialize>(record: &R) -> Result<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| Error::Io(std::io::Error::other(e)))
}
