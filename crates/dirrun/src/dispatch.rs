//! # Dispatcher Loop
//!
//! The worker's polling cycle. Single-threaded and cooperative: one pass
//! scans every method directory and executes each record whose modification
//! time changed since it was last handled, then the loop sleeps for one tick.
//!
//! ```text
//! Priming ──► Polling ──► Terminated
//!               ▲   │
//!               └───┘ (directory exists, not halted)
//! ```
//!
//! ## Invariants
//!
//! - A record whose modification time is unchanged is never executed again.
//! - One bad record never stops the pass; the remaining records still run.
//! - Records within a method run in directory-listing order, not submission
//!   order.

use std::time::Duration;

use crate::attrs::Attributes;
use crate::marshal;
use crate::marshal::Executor;
use crate::marshal::LastSeen;
use crate::store::Store;
use crate::table::OperationTable;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Priming,
    Polling,
    Terminated,
}

pub struct Dispatcher<T> {
    target: T,
    executor: Executor<T>,
    attrs: Attributes,
    store: Store,
    seen: LastSeen,
    tick: Duration,
    state: State,
}

impl<T> Dispatcher<T> {
    pub fn new(
        target: T,
        table: OperationTable<T>,
        store: Store,
        attrs: Attributes,
        tick: Duration,
    ) -> Self {
        Self {
            target,
            executor: Executor::new(store.clone(), table),
            attrs,
            store,
            seen: LastSeen::new(),
            tick,
            state: State::Priming,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    /// Materializes every declared attribute that has no record yet. Runs
    /// once; later calls are no-ops.
    pub fn prime(&mut self) {
        if self.state != State::Priming {
            return;
        }
        let primed = self.attrs.prime();
        tracing::debug!(primed, "attribute defaults materialized");
        self.state = if self.attrs.halted() { State::Terminated } else { State::Polling };
    }

    fn should_stop(&self) -> bool {
        !self.store.exists() || self.attrs.halted()
    }

    /// One polling pass. Returns how many operations ran.
    pub fn tick(&mut self) -> usize {
        self.prime();
        if self.state == State::Terminated {
            return 0;
        }
        if self.should_stop() {
            self.terminate();
            return 0;
        }

        let methods = match self.store.list_methods() {
            Ok(methods) => methods,
            Err(e) => {
                tracing::debug!(error = %e, "method listing failed");
                if !self.store.exists() {
                    self.terminate();
                }
                return 0;
            }
        };

        let mut executed = 0;
        for method in methods {
            let ids = match self.store.list_call_ids(&method) {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::debug!(method = %method, error = %e, "call listing failed");
                    continue;
                }
            };

            for id in ids {
                let modified = match self.store.modified(&method, id) {
                    Ok(Some(modified)) => modified,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::debug!(method = %method, %id, error = %e, "record stat failed");
                        continue;
                    }
                };
                if self.seen.is_current(&method, id, modified) {
                    continue;
                }

                match self.executor.execute(&mut self.target, &method, id, &mut self.seen) {
                    Ok(true) => executed += 1,
                    Ok(false) => {}
                    Err(marshal::Error::ChannelMissing) => {
                        self.terminate();
                        return executed;
                    }
                    Err(e @ (marshal::Error::Corrupt(_) | marshal::Error::Absent { .. })) => {
                        tracing::trace!(method = %method, %id, error = %e, "record not ready");
                    }
                    Err(e) => tracing::warn!(method = %method, %id, error = %e, "call abandoned"),
                }

                if self.attrs.halted() {
                    self.terminate();
                    return executed;
                }
            }
        }

        tracing::trace!(executed, "dispatcher pass finished");
        executed
    }

    fn terminate(&mut self) {
        if self.state != State::Terminated {
            tracing::info!(path = %self.store.root().display(), "channel directory gone, dispatcher stopping");
            self.state = State::Terminated;
        }
    }

    /// Polls until the channel directory disappears or the attributes halt.
    /// Hands the target back for whoever wants to inspect it afterwards.
    pub async fn run(mut self) -> T {
        self.prime();
        tracing::info!(path = %self.store.root().display(), tick = ?self.tick, "dispatcher running");
        while self.state != State::Terminated {
            self.tick();
            if self.state == State::Terminated {
                break;
            }
            tokio::time::sleep(self.tick).await;
        }
        self.target
    }
}
