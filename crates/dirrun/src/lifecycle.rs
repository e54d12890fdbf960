//! # Lifecycle
//!
//! Liveness and teardown for one channel, plus the explicit [`Registry`] a
//! host can share between channels to enumerate and shut down everything it
//! started.
//!
//! ## Invariants
//!
//! - Termination is removal of the channel directory. It is idempotent.
//! - The worker notices the removal on its next pass and exits by itself;
//!   the caller never signals the process.

use std::path::PathBuf;
use std::process::Child;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use dashmap::DashMap;

use crate::store::ChannelId;
use crate::store::Store;

/// Running channels, keyed by id. Shared by `Arc` among the channels that
/// enrolled in it.
#[derive(Debug, Default)]
pub struct Registry {
    channels: DashMap<ChannelId, PathBuf>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enroll(&self, id: ChannelId, root: PathBuf) {
        self.channels.insert(id, root);
    }

    pub fn leave(&self, id: ChannelId) -> bool {
        self.channels.remove(&id).is_some()
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Enrolled channels whose directory still exists.
    pub fn active(&self) -> Vec<ChannelId> {
        self.channels
            .iter()
            .filter(|e| e.value().is_dir())
            .map(|e| *e.key())
            .collect()
    }

    /// Removes every enrolled channel directory and empties the registry.
    /// Returns how many directories were actually removed.
    pub fn terminate_all(&self) -> usize {
        let ids: Vec<ChannelId> = self.channels.iter().map(|e| *e.key()).collect();

        let mut removed = 0;
        for id in ids {
            let Some((_, root)) = self.channels.remove(&id) else { continue };
            match std::fs::remove_dir_all(&root) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(%id, error = %e, "channel directory not removed"),
            }
        }
        tracing::info!(removed, "registry terminated");
        removed
    }
}

/// Caller-side liveness bookkeeping for one channel.
#[derive(Debug)]
pub struct Lifecycle {
    store: Store,
    active: AtomicBool,
    registry: Option<Arc<Registry>>,
    child: Mutex<Option<Child>>,
}

impl Lifecycle {
    pub fn new(store: Store, registry: Option<Arc<Registry>>, child: Option<Child>) -> Self {
        if let Some(registry) = &registry {
            registry.enroll(store.id(), store.root().to_path_buf());
        }
        Self { store, active: AtomicBool::new(true), registry, child: Mutex::new(child) }
    }

    /// True while not terminated and the directory still exists.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && self.store.exists()
    }

    /// OS process id of the worker, when this side launched it.
    pub fn pid(&self) -> Option<u32> {
        let child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        child.as_ref().map(Child::id)
    }

    /// Removes the channel directory. Safe to call any number of times.
    pub fn terminate(&self) {
        let first = self.active.swap(false, Ordering::AcqRel);

        match self.store.remove() {
            Ok(true) => tracing::info!(id = %self.store.id(), "channel terminated"),
            Ok(false) => tracing::debug!(id = %self.store.id(), "channel already gone"),
            Err(e) => tracing::warn!(id = %self.store.id(), error = %e, "channel directory not removed"),
        }

        if !first {
            return;
        }
        if let Some(registry) = &self.registry {
            registry.leave(self.store.id());
        }
        self.reap();
    }

    /// Collects the worker's exit status once it is gone, so it does not
    /// linger as a zombie.
    fn reap(&self) {
        let taken = self.child.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut child) = taken else { return };

        match child.try_wait() {
            Ok(Some(status)) => tracing::debug!(%status, "worker already exited"),
            Ok(None) => {
                std::thread::spawn(move || match child.wait() {
                    Ok(status) => tracing::debug!(%status, "worker exited"),
                    Err(e) => tracing::debug!(error = %e, "worker wait failed"),
                });
            }
            Err(e) => tracing::debug!(error = %e, "worker status unavailable"),
        }
    }
}
