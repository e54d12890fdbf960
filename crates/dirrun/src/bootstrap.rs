//! # Worker Bootstrap
//!
//! A worker is the host's own executable started again with
//! `--dirrun-worker <channel-dir>`. The caller leaves a launch manifest in
//! the channel directory; the worker consumes it, constructs the target in
//! worker role and runs the dispatcher until the directory disappears.
//!
//! ## Philosophy
//!
//! - **One executable, two roles**: `main` calls [`enter`] before anything
//!   else. Without the worker flag it returns `None` and the host carries on.
//! - **Explicit registry**: the worker can only build types registered in
//!   [`Targets`], looked up by [`Target::NAME`].
//! - **Launch is a seam**: the caller spawns through a [`Launcher`], so tests
//!   and embedders can run the worker somewhere other than a child process.
//!
//! ## Invariants
//!
//! - Once the worker has opened its directory, it deletes it on exit, whether
//!   the loop ended, construction failed, or something panicked.

use std::collections::HashMap;
use std::ffi::OsString;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::path::PathBuf;
use std::process::Child;
use std::process::Command;
use std::process::ExitCode;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::Error;
use crate::attrs::Attributes;
use crate::attrs::Role;
use crate::dispatch::Dispatcher;
use crate::store::BOOTSTRAP_FILE;
use crate::store::Store;
use crate::table::OperationTable;
use crate::table::Target;
use crate::value::Args;

/// Command-line flag that turns an executable into a worker.
pub const WORKER_FLAG: &str = "--dirrun-worker";

/// What the worker needs to rebuild the target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "t")]
    pub target: String,
    #[serde(rename = "a", default)]
    pub args: Vec<Value>,
    #[serde(rename = "k", default)]
    pub kwargs: Map<String, Value>,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_history_s")]
    pub history_s: u64,
}

fn default_tick_ms() -> u64 {
    50
}

fn default_history_s() -> u64 {
    10
}

impl Manifest {
    pub fn new(target: &str, args: &Args, tick: Duration, history: Duration) -> Self {
        Self {
            target: target.to_string(),
            args: args.positional().to_vec(),
            kwargs: args.named_args().clone(),
            tick_ms: tick.as_millis().try_into().unwrap_or(u64::MAX),
            history_s: history.as_secs(),
        }
    }

    pub fn to_args(&self) -> Args {
        Args::from_parts(self.args.clone(), self.kwargs.clone())
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    /// Reserved; see [`ChannelConfig::history`](crate::channel::ChannelConfig::history).
    pub fn history(&self) -> Duration {
        Duration::from_secs(self.history_s)
    }

    pub fn path(store: &Store) -> PathBuf {
        store.root().join(BOOTSTRAP_FILE)
    }

    pub fn write(&self, store: &Store) -> crate::Result<()> {
        let bytes = serde_json::to_vec(self).map_err(|e| Error::Manifest(e.to_string()))?;
        std::fs::write(Self::path(store), bytes)?;
        Ok(())
    }

    /// Reads the manifest and deletes it, so it is consumed exactly once.
    pub fn take(store: &Store) -> crate::Result<Self> {
        let path = Self::path(store);
        let bytes = std::fs::read(&path)
            .map_err(|e| Error::Manifest(format!("{}: {}", path.display(), e)))?;
        let manifest = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Manifest(format!("{}: {}", path.display(), e)))?;
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(error = %e, "launch manifest not removed");
        }
        Ok(manifest)
    }
}

/// Starts a worker for a prepared channel directory.
///
/// `Ok(Some(child))` when a child process was spawned, `Ok(None)` when the
/// worker runs somewhere this side does not own.
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, dir: &Path) -> std::io::Result<Option<Child>>;
}

impl<F> Launcher for F
where
    F: Fn(&Path) -> std::io::Result<Option<Child>> + Send + Sync + 'static,
{
    fn launch(&self, dir: &Path) -> std::io::Result<Option<Child>> {
        self(dir)
    }
}

/// Re-executes a program (normally the current executable) with the worker
/// flag, detached from the caller's terminal.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Extra argument placed before the worker flag.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, dir: &Path) -> std::io::Result<Option<Child>> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(WORKER_FLAG)
            .arg(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn()?;
        tracing::info!(pid = child.id(), program = %self.program.display(), "worker launched");
        Ok(Some(child))
    }
}

type Entry = fn(Store, Manifest) -> crate::Result<()>;

/// The target types this executable can serve as a worker.
#[derive(Default)]
pub struct Targets {
    entries: HashMap<&'static str, Entry>,
}

impl Targets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Target>(mut self) -> Self {
        if self.entries.insert(T::NAME, serve::<T>).is_some() {
            tracing::warn!(target_name = T::NAME, "target registered twice");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs the worker for `dir` to completion and removes the directory
    /// afterwards. A directory without a launch manifest is not a channel
    /// and is never removed.
    pub fn serve(&self, dir: &Path) -> crate::Result<()> {
        let store = Store::open(dir)?;
        let manifest = Manifest::take(&store)?;
        let _cleanup = Cleanup(store.clone());

        let entry = self
            .entries
            .get(manifest.target.as_str())
            .ok_or_else(|| Error::UnknownTarget(manifest.target.clone()))?;
        entry(store, manifest)
    }
}

impl std::fmt::Debug for Targets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

struct Cleanup(Store);

impl Drop for Cleanup {
    fn drop(&mut self) {
        match self.0.remove() {
            Ok(true) => tracing::debug!(path = %self.0.root().display(), "worker removed channel directory"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "channel directory not removed"),
        }
    }
}

/// Worker entry point. Call first thing in `main`:
///
/// ```ignore
/// fn main() -> ExitCode {
///     let targets = Targets::new().register::<Meter>();
///     if let Some(code) = dirrun::bootstrap::enter(&targets) {
///         return code;
///     }
///     // host code
/// }
/// ```
pub fn enter(targets: &Targets) -> Option<ExitCode> {
    let dir = worker_dir(std::env::args_os())?;
    Some(run_worker(targets, &dir))
}

fn worker_dir<I: IntoIterator<Item = OsString>>(args: I) -> Option<PathBuf> {
    let mut args = args.into_iter();
    args.by_ref().find(|arg| arg == WORKER_FLAG)?;
    args.next().map(PathBuf::from)
}

/// Serves `dir`, turning every outcome into an exit code.
pub fn run_worker(targets: &Targets, dir: &Path) -> ExitCode {
    tracing::info!(path = %dir.display(), "worker starting");
    match std::panic::catch_unwind(AssertUnwindSafe(|| targets.serve(dir))) {
        Ok(Ok(())) => {
            tracing::info!("worker finished");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "worker failed");
            ExitCode::FAILURE
        }
        Err(_) => {
            tracing::error!("worker panicked");
            ExitCode::FAILURE
        }
    }
}

fn serve<T: Target>(store: Store, manifest: Manifest) -> crate::Result<()> {
    let dispatcher = prepare::<T>(store, &manifest)?;
    let runtime = tokio::runtime::Builder::new_current_thread().enable_time().build()?;
    runtime.block_on(dispatcher.run());
    Ok(())
}

/// Builds the worker-side dispatcher for `T` from a manifest.
pub fn prepare<T: Target>(store: Store, manifest: &Manifest) -> crate::Result<Dispatcher<T>> {
    let table = OperationTable::<T>::of();
    let attrs = Attributes::with_operations(store.clone(), Role::Worker, table.names());
    let target = T::construct(&manifest.to_args(), &attrs).map_err(Error::Construct)?;
    tracing::debug!(target_name = T::NAME, path = %store.root().display(), "target constructed");
    Ok(Dispatcher::new(target, table, store, attrs, manifest.tick()))
}

/// Consumes the manifest in `dir` and builds a dispatcher for `T`, for
/// workers that run inside an existing process. The caller owns cleanup.
pub fn attach<T: Target>(dir: &Path) -> crate::Result<Dispatcher<T>> {
    let store = Store::open(dir)?;
    let manifest = Manifest::take(&store)?;
    if manifest.target != T::NAME {
        return Err(Error::UnknownTarget(manifest.target));
    }
    prepare::<T>(store, &manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_dir_follows_flag() {
        let args = ["devsim", "--verbose", WORKER_FLAG, "/tmp/dirrun/123"].map(OsString::from);
        assert_eq!(worker_dir(args), Some(PathBuf::from("/tmp/dirrun/123")));

        assert_eq!(worker_dir(["devsim"].map(OsString::from)), None);
        assert_eq!(worker_dir(["devsim", WORKER_FLAG].map(OsString::from)), None);
    }

    #[test]
    fn test_manifest_is_consumed_once() {
        let base = tempfile::tempdir().unwrap();
        let store = Store::allocate(base.path(), "dirrun").unwrap();
        let args = Args::new().arg("meter-1").named("port", 502);

        let manifest = Manifest::new("Meter", &args, Duration::from_millis(20), Duration::from_secs(10));
        manifest.write(&store).unwrap();

        let taken = Manifest::take(&store).unwrap();
        assert_eq!(taken, manifest);
        assert_eq!(taken.to_args(), args);
        assert_eq!(taken.tick(), Duration::from_millis(20));
        assert!(!Manifest::path(&store).exists());
        assert!(matches!(Manifest::take(&store), Err(Error::Manifest(_))));
    }

    #[test]
    fn test_unknown_target_still_cleans_up() {
        let base = tempfile::tempdir().unwrap();
        let store = Store::allocate(base.path(), "dirrun").unwrap();
        Manifest::new("Nobody", &Args::new(), Duration::from_millis(5), Duration::ZERO)
            .write(&store)
            .unwrap();

        let outcome = Targets::new().serve(store.root());
        assert!(matches!(outcome, Err(Error::UnknownTarget(name)) if name == "Nobody"));
        assert!(!store.root().exists());
    }

    #[test]
    fn test_numeric_directory_without_manifest_survives() {
        let base = tempfile::tempdir().unwrap();
        let photos = base.path().join("2024");
        std::fs::create_dir(&photos).unwrap();
        std::fs::write(photos.join("holiday.jpg"), b"jpeg").unwrap();

        let targets = Targets::new();
        assert!(matches!(targets.serve(&photos), Err(Error::Manifest(_))));
        let _ = run_worker(&targets, &photos);
        assert!(photos.join("holiday.jpg").exists());
    }

    #[test]
    fn test_non_channel_directory_is_left_alone() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("not-a-channel");
        std::fs::create_dir(&dir).unwrap();

        assert!(matches!(Targets::new().serve(&dir), Err(Error::Store(_))));
        assert!(dir.exists());
    }
}
