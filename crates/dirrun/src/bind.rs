//! # Binding Registry
//!
//! Caller-side "tell me when call X completes" callbacks. Nothing here runs
//! on its own: the host calls [`Bindings::check`] from its own periodic tick.
//! Bindings live only in memory and are never persisted.

use dashmap::DashMap;
use serde_json::Value;

use crate::record::CallId;
use crate::value::Args;

/// Receives the bound arguments and the call's result.
pub type Callback = Box<dyn FnOnce(Args, Value) + Send + Sync>;

struct Binding {
    callback: Callback,
    args: Args,
}

#[derive(Default)]
pub struct Bindings {
    entries: DashMap<CallId, Binding>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `id`, replacing any earlier binding for it.
    pub fn bind<F>(&self, id: CallId, args: Args, callback: F)
    where
        F: FnOnce(Args, Value) + Send + Sync + 'static,
    {
        let replaced = self
            .entries
            .insert(id, Binding { callback: Box::new(callback), args })
            .is_some();
        tracing::debug!(%id, replaced, "binding registered");
    }

    pub fn unbind(&self, id: CallId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn contains(&self, id: CallId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves every bound id with `resolve` (a non-blocking read) and fires
    /// the callbacks whose result is in. Each fired binding is removed before
    /// its callback runs. Returns whether anything fired.
    pub fn check<R>(&self, resolve: R) -> bool
    where
        R: Fn(CallId) -> Option<Value>,
    {
        let ids: Vec<CallId> = self.entries.iter().map(|e| *e.key()).collect();

        let mut fired = false;
        for id in ids {
            let Some(result) = resolve(id) else { continue };
            // A callback may re-bind from inside; the shard lock is released first.
            let Some((_, binding)) = self.entries.remove(&id) else { continue };
            tracing::debug!(%id, "binding fired");
            (binding.callback)(binding.args, result);
            fired = true;
        }
        fired
    }
}

impl std::fmt::Debug for Bindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bindings").field("len", &self.entries.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_fires_once_then_forgets() {
        let bindings = Bindings::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&calls);
        bindings.bind(CallId(11), crate::args!["tag"], move |args, result| {
            sink.lock().unwrap().push((args.positional().to_vec(), result));
        });

        assert!(!bindings.check(|_| None));
        assert!(bindings.contains(CallId(11)));

        assert!(bindings.check(|_| Some(json!(5))));
        assert!(!bindings.check(|_| Some(json!(5))));
        assert!(bindings.is_empty());
        assert_eq!(*calls.lock().unwrap(), vec![(vec![json!("tag")], json!(5))]);
    }

    #[test]
    fn test_rebinding_replaces() {
        let bindings = Bindings::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second"] {
            let hits = Arc::clone(&hits);
            bindings.bind(CallId(12), Args::new(), move |_, _| hits.lock().unwrap().push(label));
        }
        assert_eq!(bindings.len(), 1);

        bindings.check(|id| (id == CallId(12)).then(|| json!(true)));
        assert_eq!(*hits.lock().unwrap(), vec!["second"]);
    }

    #[test]
    fn test_only_completed_ids_fire() {
        let bindings = Bindings::new();
        bindings.bind(CallId(11), Args::new(), |_, _| {});
        bindings.bind(CallId(12), Args::new(), |_, _| {});

        assert!(bindings.check(|id| (id == CallId(12)).then(|| json!(1))));
        assert!(bindings.contains(CallId(11)));
        assert!(!bindings.contains(CallId(12)));
        assert!(bindings.unbind(CallId(11)));
        assert!(!bindings.unbind(CallId(11)));
    }
}
