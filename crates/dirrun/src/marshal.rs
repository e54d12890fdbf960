//! # Call Marshaller
//!
//! Turns calls into call records and call records back into invocations.
//!
//! - [`Caller`] runs in the host: it checks arguments, allocates a call id,
//!   persists the request and, depending on the [`CallMode`], waits for the
//!   result, hands back the id, or echoes the previous call's result.
//! - [`Executor`] runs in the worker: it loads one record, invokes the
//!   operation with the worker's instance when the handler wants one, and
//!   writes the result into the same file.
//!
//! ## Invariants
//!
//! - A record is written twice at most: once by the caller, once by the
//!   worker when the result is attached.
//! - A missing or unreadable record abandons that one invocation. Nothing is
//!   written and the dispatcher looks at it again on its next pass.
//! - A null result is indistinguishable from "not processed" in the value
//!   returning readers; [`Caller::status`] tells them apart.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use dashmap::DashMap;
use serde_json::Value;

use crate::record::CallId;
use crate::store;
use crate::store::Store;
use crate::table::OperationTable;
use crate::value::Args;
use crate::value::non_null;

/// Caller-supplied flags for one call.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CallMode {
    /// Fire and forget; return the previous call's result if it is already in.
    #[default]
    Echo,
    /// Return the new call's id without waiting.
    Handle,
    /// Poll for this call's result until it arrives or the duration elapses.
    /// A zero duration behaves like `Echo`.
    Wait(Duration),
    /// Poll until the result arrives. Blocks forever if the worker never
    /// completes the call; bounding that is the caller's job.
    WaitForever,
}

/// How long a result lookup may poll.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Wait {
    /// One non-blocking check.
    #[default]
    No,
    For(Duration),
    Forever,
}

/// Outcome of [`Caller::call`].
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Handle(CallId),
    Value(Option<Value>),
    /// Nothing was written: an argument was not portable, or the record
    /// could not be created.
    Rejected,
}

impl Reply {
    pub fn value(self) -> Option<Value> {
        match self {
            Self::Value(value) => value,
            _ => None,
        }
    }

    pub fn handle(&self) -> Option<CallId> {
        match self {
            Self::Handle(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected)
    }
}

/// Where one call stands, as seen from its record.
#[derive(Clone, Debug, PartialEq)]
pub enum CallStatus {
    Missing,
    Pending,
    /// Completed; the value may be null.
    Completed(Value),
}

/// A persisted request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Submitted {
    pub id: CallId,
    /// The last id this caller issued for the same method before this one.
    pub previous: CallId,
}

/// Caller half of the marshaller.
pub struct Caller {
    store: Store,
    last: DashMap<String, CallId>,
    poll: Duration,
}

impl Caller {
    pub fn new(store: Store, poll: Duration) -> Self {
        Self { store, last: DashMap::new(), poll }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The last id issued for `method`, or [`CallId::FLOOR`] if none.
    pub fn last_id(&self, method: &str) -> CallId {
        self.last.get(method).map(|e| *e.value()).unwrap_or(CallId::FLOOR)
    }

    /// Persists a request. `None` when nothing was written.
    pub fn submit(&self, method: &str, args: &Args) -> Option<Submitted> {
        if !args.is_portable() {
            tracing::warn!(method, "call rejected: argument is not portable");
            return None;
        }

        let previous = self.last_id(method);
        match self.store.create_call(method, previous, args) {
            Ok(id) => {
                self.last
                    .entry(method.to_string())
                    .and_modify(|last| *last = (*last).max(id))
                    .or_insert(id);
                Some(Submitted { id, previous })
            }
            Err(e) => {
                tracing::warn!(method, error = %e, "call record not written");
                None
            }
        }
    }

    pub async fn call(&self, method: &str, args: &Args, mode: CallMode) -> Reply {
        let Some(submitted) = self.submit(method, args) else {
            return Reply::Rejected;
        };

        match mode {
            CallMode::Handle => Reply::Handle(submitted.id),
            CallMode::Wait(duration) if !duration.is_zero() => {
                Reply::Value(self.result(method, submitted.id, Wait::For(duration)).await)
            }
            CallMode::WaitForever => {
                Reply::Value(self.result(method, submitted.id, Wait::Forever).await)
            }
            CallMode::Echo | CallMode::Wait(_) => {
                if submitted.previous.is_user() {
                    Reply::Value(self.peek(method, submitted.previous))
                } else {
                    Reply::Value(None)
                }
            }
        }
    }

    pub fn status(&self, method: &str, id: CallId) -> CallStatus {
        match self.store.read_call(method, id) {
            Ok(Some(record)) => match record.result {
                Some(value) => CallStatus::Completed(value),
                None => CallStatus::Pending,
            },
            Ok(None) => CallStatus::Missing,
            Err(store::Error::Corrupt { .. }) => CallStatus::Pending,
            Err(e) => {
                tracing::debug!(method, %id, error = %e, "call status unavailable");
                CallStatus::Missing
            }
        }
    }

    /// Non-blocking result read; null and pending both come back as `None`.
    pub fn peek(&self, method: &str, id: CallId) -> Option<Value> {
        match self.status(method, id) {
            CallStatus::Completed(value) => non_null(value),
            _ => None,
        }
    }

    /// Polls one record until it completes, the wait runs out, or the channel
    /// directory disappears.
    pub async fn result(&self, method: &str, id: CallId, wait: Wait) -> Option<Value> {
        let deadline = match wait {
            Wait::No => Some(Instant::now()),
            Wait::For(duration) => Some(Instant::now() + duration),
            Wait::Forever => None,
        };

        loop {
            if let CallStatus::Completed(value) = self.status(method, id) {
                return non_null(value);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return None;
            }
            if !self.store.exists() {
                return None;
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    /// The first method directory holding a record with this id.
    pub fn locate(&self, id: CallId) -> Option<String> {
        let methods = self.store.list_methods().ok()?;
        methods
            .into_iter()
            .find(|method| self.store.call_path(method, id).is_file())
    }

    /// Non-blocking read of `id` in whichever method holds it.
    pub fn peek_by_id(&self, id: CallId) -> Option<Value> {
        let method = self.locate(id)?;
        self.peek(&method, id)
    }

    /// Result lookup for callers that no longer know which method an id
    /// belongs to. An id no method holds yields `None` straight away.
    pub async fn result_by_id(&self, id: CallId, wait: Wait) -> Option<Value> {
        let method = self.locate(id)?;
        self.result(&method, id, wait).await
    }
}

/// Per-record modification times the worker has already handled. Entries
/// are never pruned: dropping one while its record still exists would run
/// that record again.
#[derive(Debug, Default)]
pub struct LastSeen {
    times: HashMap<String, HashMap<CallId, SystemTime>>,
}

impl LastSeen {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `modified` is exactly what was recorded for this record.
    pub fn is_current(&self, method: &str, id: CallId, modified: SystemTime) -> bool {
        self.times
            .get(method)
            .and_then(|calls| calls.get(&id))
            .is_some_and(|seen| *seen == modified)
    }

    pub fn record(&mut self, method: &str, id: CallId, modified: SystemTime) {
        self.times.entry(method.to_string()).or_default().insert(id, modified);
    }

    pub fn len(&self) -> usize {
        self.times.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub enum Error {
    /// The record vanished between listing and reading it.
    Absent { method: String, id: CallId },
    /// The record does not parse, probably because it is still being written.
    Corrupt(store::Error),
    /// The channel directory is gone.
    ChannelMissing,
    Store(store::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent { method, id } => write!(f, "Call record {}/{} not found", method, id),
            Self::Corrupt(e) => write!(f, "Call record not ready: {}", e),
            Self::ChannelMissing => write!(f, "Channel directory missing"),
            Self::Store(e) => write!(f, "Store error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<store::Error> for Error {
    fn from(e: store::Error) -> Self {
        match e {
            store::Error::Missing(_) => Self::ChannelMissing,
            e @ store::Error::Corrupt { .. } => Self::Corrupt(e),
            e => Self::Store(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Worker half of the marshaller.
pub struct Executor<T> {
    store: Store,
    table: OperationTable<T>,
}

impl<T> Executor<T> {
    pub fn new(store: Store, table: OperationTable<T>) -> Self {
        Self { store, table }
    }

    pub fn table(&self) -> &OperationTable<T> {
        &self.table
    }

    /// Executes one call record and attaches its result.
    ///
    /// Returns `Ok(true)` if an operation ran, `Ok(false)` if the record was
    /// already complete and only got marked as seen.
    pub fn execute(
        &self,
        target: &mut T,
        method: &str,
        id: CallId,
        seen: &mut LastSeen,
    ) -> Result<bool> {
        let mut record = self
            .store
            .read_call(method, id)?
            .ok_or_else(|| Error::Absent { method: method.to_string(), id })?;

        if record.is_completed() {
            if let Some(modified) = self.store.modified(method, id)? {
                seen.record(method, id, modified);
            }
            return Ok(false);
        }

        let args = record.to_args();
        let result = match self.table.get(method) {
            Some(handler) => {
                let outcome =
                    std::panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(target, &args)));
                match outcome {
                    Ok(Ok(value)) => value,
                    Ok(Err(e)) => {
                        tracing::warn!(method, %id, error = %e, "operation failed, storing null");
                        Value::Null
                    }
                    Err(_) => {
                        tracing::error!(method, %id, "operation panicked, storing null");
                        Value::Null
                    }
                }
            }
            None => {
                tracing::warn!(method, %id, "unknown operation, storing null");
                Value::Null
            }
        };

        record.result = Some(result);
        let modified = self.store.write_result(method, id, &record)?;
        seen.record(method, id, modified);
        tracing::debug!(method, %id, "call completed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::record::CallRecord;

    struct Adder;

    fn fixture() -> (tempfile::TempDir, Store, Caller, Executor<Adder>) {
        let base = tempfile::tempdir().unwrap();
        let store = Store::allocate(base.path(), "dirrun").unwrap();
        let caller = Caller::new(store.clone(), Duration::from_millis(2));

        let mut table = OperationTable::new();
        table
            .method("add", |_: &mut Adder, args| {
                Ok(args.param::<i64>(0, "a")? + args.param::<i64>(1, "b")?)
            })
            .method("fail", |_: &mut Adder, _| -> anyhow::Result<()> { anyhow::bail!("device offline") })
            .method("nothing", |_: &mut Adder, _| Ok(()));
        let executor = Executor::new(store.clone(), table);
        (base, store, caller, executor)
    }

    #[tokio::test]
    async fn test_handle_then_result() {
        let (_base, _store, caller, executor) = fixture();
        let mut seen = LastSeen::new();

        let id = caller.call("add", &crate::args![2, 3], CallMode::Handle).await.handle().unwrap();
        assert!(id.is_user());
        assert_eq!(caller.status("add", id), CallStatus::Pending);
        assert_eq!(caller.result("add", id, Wait::No).await, None);

        assert!(executor.execute(&mut Adder, "add", id, &mut seen).unwrap());
        assert_eq!(caller.result("add", id, Wait::No).await, Some(json!(5)));
        assert_eq!(caller.result_by_id(id, Wait::No).await, Some(json!(5)));
    }

    #[tokio::test]
    async fn test_echo_returns_previous_result() {
        let (_base, _store, caller, executor) = fixture();
        let mut seen = LastSeen::new();

        assert_eq!(caller.call("add", &crate::args![1, 1], CallMode::Echo).await, Reply::Value(None));
        executor.execute(&mut Adder, "add", CallId::FIRST, &mut seen).unwrap();

        let reply = caller.call("add", &crate::args![5, 5], CallMode::default()).await;
        assert_eq!(reply, Reply::Value(Some(json!(2))));
        assert_eq!(caller.last_id("add"), CallId(12));
    }

    #[tokio::test]
    async fn test_bounded_wait_times_out() {
        let (_base, _store, caller, _executor) = fixture();
        let started = Instant::now();
        let reply = caller.call("add", &crate::args![1, 2], CallMode::Wait(Duration::from_millis(30))).await;
        assert_eq!(reply, Reply::Value(None));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_unportable_arguments_write_nothing() {
        let (_base, store, caller, _executor) = fixture();
        let mut grid = std::collections::HashMap::new();
        grid.insert((1, 2), 3);

        let reply = caller.call("add", &crate::args![grid], CallMode::Handle).await;
        assert!(reply.is_rejected());
        assert!(store.list_methods().unwrap().is_empty());
    }

    #[test]
    fn test_failures_store_null_and_complete() {
        let (_base, store, caller, executor) = fixture();
        let mut seen = LastSeen::new();

        let failing = caller.submit("fail", &Args::new()).unwrap().id;
        let unit = caller.submit("nothing", &Args::new()).unwrap().id;
        let unknown = caller.submit("missing", &Args::new()).unwrap().id;

        for (method, id) in [("fail", failing), ("nothing", unit), ("missing", unknown)] {
            assert!(executor.execute(&mut Adder, method, id, &mut seen).unwrap());
            assert_eq!(caller.status(method, id), CallStatus::Completed(Value::Null));
            assert_eq!(caller.peek(method, id), None);
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(store.read_call("fail", failing).unwrap().unwrap().result, Some(Value::Null));
    }

    #[test]
    fn test_corrupt_record_is_skipped_without_marking() {
        let (_base, store, caller, executor) = fixture();
        let mut seen = LastSeen::new();
        let id = caller.submit("add", &crate::args![1, 2]).unwrap().id;
        std::fs::write(store.call_path("add", id), b"{\"a\":").unwrap();

        assert!(matches!(executor.execute(&mut Adder, "add", id, &mut seen), Err(Error::Corrupt(_))));
        assert!(seen.is_empty());
        assert!(matches!(
            executor.execute(&mut Adder, "add", CallId(77), &mut seen),
            Err(Error::Absent { .. })
        ));
    }

    #[test]
    fn test_completed_record_is_never_rewritten() {
        let (_base, store, caller, executor) = fixture();
        let mut seen = LastSeen::new();
        let id = caller.submit("add", &crate::args![1, 2]).unwrap().id;

        let done = CallRecord { args: vec![json!(1), json!(2)], result: Some(json!(99)), ..Default::default() };
        store.write_result("add", id, &done).unwrap();

        assert!(!executor.execute(&mut Adder, "add", id, &mut seen).unwrap());
        assert_eq!(caller.peek("add", id), Some(json!(99)));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_missing_channel_is_reported() {
        let (_base, store, caller, executor) = fixture();
        let mut seen = LastSeen::new();
        let id = caller.submit("add", &crate::args![1, 2]).unwrap().id;
        store.remove().unwrap();

        assert!(matches!(
            executor.execute(&mut Adder, "add", id, &mut seen),
            Err(Error::ChannelMissing)
        ));
        assert!(caller.submit("add", &Args::new()).is_none());
    }
}
