//! # Channel
//!
//! The caller-facing handle to one worker. It owns the caller half of the
//! marshaller, the caller's attribute mirror, the binding registry and the
//! lifecycle bookkeeping for one channel directory.
//!
//! ## Philosophy
//!
//! - **Composition over mutation**: a `Channel<T>` never holds a `T`. It only
//!   knows `T`'s operation names, and refuses calls to anything else.
//! - **Quiet failures**: calls, attribute writes and binding checks never
//!   return errors. The only `Err` a host sees is from [`ChannelBuilder::spawn`].
//! - **No implicit teardown**: dropping a channel leaves the worker running.
//!   Hosts call [`Channel::terminate`] (or [`Registry::terminate_all`]).

use std::collections::HashSet;
use std::marker::PhantomData;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::Error;
use crate::attrs::AttrValue;
use crate::attrs::Attributes;
use crate::attrs::Role;
use crate::bind::Bindings;
use crate::bootstrap::Launcher;
use crate::bootstrap::Manifest;
use crate::bootstrap::ProcessLauncher;
use crate::lifecycle::Lifecycle;
use crate::lifecycle::Registry;
use crate::marshal::CallMode;
use crate::marshal::CallStatus;
use crate::marshal::Caller;
use crate::marshal::Reply;
use crate::marshal::Wait;
use crate::record::CallId;
use crate::store::ChannelId;
use crate::store::Store;
use crate::table::OperationTable;
use crate::table::Target;
use crate::value::Args;

/// Host-facing settings for one channel.
#[derive(Clone)]
pub struct ChannelConfig {
    /// Parent of the namespace directory.
    pub base: PathBuf,
    pub namespace: String,
    /// Worker dispatcher interval.
    pub tick: Duration,
    /// Caller wait poll interval.
    pub poll: Duration,
    /// Retention for completed calls. Reserved: it is carried to the worker
    /// in the manifest but nothing reads it, and completed records (and the
    /// worker's record of having seen them) live until the channel is
    /// terminated.
    pub history: Duration,
    /// Constructor arguments for the worker-side instance.
    pub args: Args,
    /// `None` re-executes the current executable.
    pub launcher: Option<Arc<dyn Launcher>>,
    pub registry: Option<Arc<Registry>>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base: std::env::temp_dir(),
            namespace: "dirrun".to_string(),
            tick: Duration::from_millis(50),
            poll: Duration::from_millis(10),
            history: Duration::from_secs(10),
            args: Args::new(),
            launcher: None,
            registry: None,
        }
    }
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("base", &self.base)
            .field("namespace", &self.namespace)
            .field("tick", &self.tick)
            .field("poll", &self.poll)
            .field("history", &self.history)
            .field("args", &self.args)
            .field("launcher", &self.launcher.is_some())
            .field("registry", &self.registry.is_some())
            .finish()
    }
}

/// Fluent builder for [`Channel`].
pub struct ChannelBuilder<T> {
    config: ChannelConfig,
    _target: PhantomData<fn() -> T>,
}

impl<T: Target> ChannelBuilder<T> {
    pub fn new() -> Self {
        Self::from_config(ChannelConfig::default())
    }

    pub fn from_config(config: ChannelConfig) -> Self {
        Self { config, _target: PhantomData }
    }

    pub fn base(mut self, base: impl Into<PathBuf>) -> Self {
        self.config.base = base.into();
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.config.tick = tick;
        self
    }

    pub fn poll(mut self, poll: Duration) -> Self {
        self.config.poll = poll;
        self
    }

    /// Sets [`ChannelConfig::history`], which is reserved.
    pub fn history(mut self, history: Duration) -> Self {
        self.config.history = history;
        self
    }

    pub fn args(mut self, args: Args) -> Self {
        self.config.args = args;
        self
    }

    pub fn launcher(mut self, launcher: impl Launcher) -> Self {
        self.config.launcher = Some(Arc::new(launcher));
        self
    }

    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.config.registry = Some(registry);
        self
    }

    /// Allocates the channel directory, leaves the launch manifest in it and
    /// starts the worker. On failure nothing is left on disk.
    pub fn spawn(self) -> crate::Result<Channel<T>> {
        let config = self.config;
        if !config.args.is_portable() {
            return Err(Error::Encode(format!("constructor arguments for {} are not portable", T::NAME)));
        }

        let launcher: Arc<dyn Launcher> = match &config.launcher {
            Some(launcher) => Arc::clone(launcher),
            None => Arc::new(ProcessLauncher::current_exe().map_err(Error::Spawn)?),
        };

        let store = Store::allocate(&config.base, &config.namespace)?;
        let manifest = Manifest::new(T::NAME, &config.args, config.tick, config.history);
        if let Err(e) = manifest.write(&store) {
            discard(&store);
            return Err(e);
        }

        let child = match launcher.launch(store.root()) {
            Ok(child) => child,
            Err(e) => {
                discard(&store);
                return Err(Error::Spawn(e));
            }
        };

        tracing::info!(id = %store.id(), target_name = T::NAME, "channel spawned");
        Ok(Channel::new(config, store, child))
    }
}

impl<T: Target> Default for ChannelBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn discard(store: &Store) {
    if let Err(e) = store.remove() {
        tracing::warn!(error = %e, "channel directory not removed after failed spawn");
    }
}

/// Caller-side handle to a worker running `T`.
pub struct Channel<T> {
    config: ChannelConfig,
    caller: Caller,
    attrs: Attributes,
    bindings: Bindings,
    lifecycle: Lifecycle,
    operations: HashSet<String>,
    _target: PhantomData<fn() -> T>,
}

impl<T: Target> Channel<T> {
    pub fn builder() -> ChannelBuilder<T> {
        ChannelBuilder::new()
    }

    fn new(config: ChannelConfig, store: Store, child: Option<std::process::Child>) -> Self {
        let operations: HashSet<String> = OperationTable::<T>::of().names().map(str::to_string).collect();
        Self {
            caller: Caller::new(store.clone(), config.poll),
            attrs: Attributes::with_operations(store.clone(), Role::Caller, operations.iter().cloned()),
            bindings: Bindings::new(),
            lifecycle: Lifecycle::new(store, config.registry.clone(), child),
            operations,
            config,
            _target: PhantomData,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.caller.store().id()
    }

    pub fn dir(&self) -> &Path {
        self.caller.store().root()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn pid(&self) -> Option<u32> {
        self.lifecycle.pid()
    }

    pub fn has_operation(&self, method: &str) -> bool {
        self.operations.contains(method)
    }

    fn accepts(&self, method: &str) -> bool {
        if !self.has_operation(method) {
            tracing::warn!(method, target_name = T::NAME, "call rejected: unknown operation");
            return false;
        }
        if !self.lifecycle.is_active() {
            tracing::warn!(method, id = %self.id(), "call rejected: channel inactive");
            return false;
        }
        true
    }

    /// Invokes `method` on the worker.
    pub async fn call(&self, method: &str, args: &Args, mode: CallMode) -> Reply {
        if !self.accepts(method) {
            return Reply::Rejected;
        }
        self.caller.call(method, args, mode).await
    }

    /// Persists a call and returns its id; the synchronous form of
    /// [`CallMode::Handle`].
    pub fn submit(&self, method: &str, args: &Args) -> Option<CallId> {
        if !self.accepts(method) {
            return None;
        }
        self.caller.submit(method, args).map(|submitted| submitted.id)
    }

    pub fn status(&self, method: &str, id: CallId) -> CallStatus {
        self.caller.status(method, id)
    }

    pub fn peek(&self, method: &str, id: CallId) -> Option<Value> {
        self.caller.peek(method, id)
    }

    pub async fn result(&self, method: &str, id: CallId, wait: Wait) -> Option<Value> {
        self.caller.result(method, id, wait).await
    }

    /// Looks `id` up across every method directory.
    pub async fn result_by_id(&self, id: CallId, wait: Wait) -> Option<Value> {
        if !self.lifecycle.is_active() {
            return None;
        }
        self.caller.result_by_id(id, wait).await
    }

    /// Runs `callback` with `args` and the result once call `id` completes
    /// with a non-null value. Replaces any earlier binding for `id`.
    pub fn bind<F>(&self, id: CallId, args: Args, callback: F)
    where
        F: FnOnce(Args, Value) + Send + Sync + 'static,
    {
        self.bindings.bind(id, args, callback);
    }

    pub fn unbind(&self, id: CallId) -> bool {
        self.bindings.unbind(id)
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Fires every binding whose result is in. Call from the host's own tick.
    pub fn check_bindings(&self) -> bool {
        if self.bindings.is_empty() {
            return false;
        }
        self.bindings.check(|id| self.caller.peek_by_id(id))
    }

    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    pub fn get(&self, name: &str) -> Option<AttrValue> {
        self.attrs.get(name)
    }

    pub fn get_as<V: serde::de::DeserializeOwned>(&self, name: &str) -> Option<V> {
        self.attrs.get_as(name)
    }

    pub fn set<V: Serialize + ?Sized>(&self, name: &str, value: &V) {
        self.attrs.set(name, value);
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle.is_active()
    }

    /// Removes the channel directory; the worker exits on its next pass.
    pub fn terminate(&self) {
        self.lifecycle.terminate();
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("dir", &self.caller.store().root())
            .field("bindings", &self.bindings.len())
            .finish()
    }
}
