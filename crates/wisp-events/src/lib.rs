/// Named-channel event bus for the wisp script host
///
/// Publish/subscribe over string event names with three dispatch modes:
/// synchronous on the calling thread, fire-and-forget on the bus's worker
/// pool, and wait-for-all concurrent dispatch. Listeners for one event fire
/// in registration order for the synchronous and wait modes; a faulty
/// listener never breaks the rest.
use std::collections::HashMap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};
use wisp_core::{Value, WorkerPool};

/// Handle returned by [`EventBus::add_listener`], used for removal.
/// Closures are not comparable, so the token is the listener's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Numeric form, for crossing the script boundary.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Rebuild from [`ListenerId::raw`]. A forged id is harmless: removal
    /// with it simply finds nothing.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// A registered callback invoked when a named event is emitted.
pub type Listener = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// One emitted occurrence: name, ordered arguments, and a defensive copy
/// of the bus metadata taken at construction time.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub args: Vec<Value>,
    pub metadata: HashMap<String, Value>,
    pub timestamp: Instant,
}

impl Event {
    fn new(name: &str, args: Vec<Value>, metadata: HashMap<String, Value>) -> Self {
        Self {
            name: name.to_string(),
            args,
            metadata,
            timestamp: Instant::now(),
        }
    }
}

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    listener: Listener,
}

/// The bus. Safe to share behind an `Arc` and call from any thread;
/// listeners may re-enter the bus (register, remove, emit) from inside a
/// callback because dispatch iterates a snapshot, not the live table.
pub struct EventBus {
    listeners: RwLock<HashMap<String, Vec<ListenerEntry>>>,
    metadata: RwLock<HashMap<String, Value>>,
    pool: WorkerPool,
    next_listener_id: AtomicU64,
}

impl EventBus {
    /// Build a bus with a fixed-size worker pool of `workers` threads for
    /// the async dispatch modes.
    pub fn new(workers: usize) -> io::Result<Self> {
        Ok(Self {
            listeners: RwLock::new(HashMap::new()),
            metadata: RwLock::new(HashMap::new()),
            pool: WorkerPool::new("events", workers)?,
            next_listener_id: AtomicU64::new(0),
        })
    }

    /// Register a listener for `event`. Listeners fire in registration
    /// order within a single dispatch.
    pub fn add_listener(&self, event: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        debug!(target: "events", "Adding listener {id:?} for '{event}'");
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event.to_string())
            .or_default()
            .push(ListenerEntry { id, listener });
        id
    }

    /// Remove one listener by its token. Returns false if it was already
    /// gone.
    pub fn remove_listener(&self, event: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = listeners.get_mut(event) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() < before;
        if entries.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    /// Drop every listener for `event`.
    pub fn remove_all(&self, event: &str) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(event);
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Event names with at least one listener, sorted.
    pub fn registered_events(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Set a metadata key attached (as a copy) to every event constructed
    /// from now on. Bus-scoped shared mutable state: callers must not
    /// assume per-listener isolation.
    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.metadata
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value);
    }

    pub fn metadata_snapshot(&self) -> HashMap<String, Value> {
        self.metadata
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Dispatch synchronously on the calling thread, in registration
    /// order. A listener error or panic is logged and does not stop
    /// dispatch to the rest.
    pub fn emit(&self, event: &str, args: Vec<Value>) {
        let snapshot = self.snapshot(event);
        let event = self.make_event(event, args);
        dispatch_in_order(&snapshot, &event);
    }

    /// Enqueue the full ordered dispatch on the worker pool and return
    /// immediately. No ordering across independent async emits; listeners
    /// within this one emit still fire in registration order.
    pub fn emit_async(&self, event: &str, args: Vec<Value>) {
        let snapshot = self.snapshot(event);
        if snapshot.is_empty() {
            return;
        }
        let event = self.make_event(event, args);
        let name = event.name.clone();
        let accepted = self.pool.spawn(move || {
            dispatch_in_order(&snapshot, &event);
        });
        if !accepted {
            warn!(target: "events", "Bus is shut down, dropping async emit of '{name}'");
        }
    }

    /// Dispatch every listener concurrently on the worker pool and block
    /// until all of them have completed or errored.
    ///
    /// Do not call this from inside a listener running on the pool: with
    /// every worker blocked waiting, the nested dispatch can never run.
    pub fn emit_wait(&self, event: &str, args: Vec<Value>) {
        let snapshot = self.snapshot(event);
        if snapshot.is_empty() {
            return;
        }
        let event = Arc::new(self.make_event(event, args));

        let (tx, rx) = mpsc::channel();
        let mut dispatched = 0;
        for entry in snapshot {
            let ev = Arc::clone(&event);
            let done = tx.clone();
            let accepted = self.pool.spawn(move || {
                run_listener(&entry, &ev);
                let _ = done.send(());
            });
            if accepted {
                dispatched += 1;
            } else {
                warn!(target: "events", "Bus is shut down, skipping listener for '{}'", event.name);
            }
        }
        drop(tx);

        for _ in 0..dispatched {
            let _ = rx.recv();
        }
    }

    /// Drain the worker pool within `grace`, then force-stop it. Async
    /// emits submitted afterwards are dropped.
    pub fn shutdown(&self, grace: Duration) {
        debug!(target: "events", "Shutting down event bus worker pool");
        self.pool.shutdown(grace);
    }

    fn snapshot(&self, event: &str) -> Vec<ListenerEntry> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event)
            .cloned()
            .unwrap_or_default()
    }

    fn make_event(&self, name: &str, args: Vec<Value>) -> Event {
        Event::new(name, args, self.metadata_snapshot())
    }
}

fn dispatch_in_order(entries: &[ListenerEntry], event: &Event) {
    for entry in entries {
        run_listener(entry, event);
    }
}

/// Run one listener, isolating errors and panics from its siblings.
fn run_listener(entry: &ListenerEntry, event: &Event) {
    match catch_unwind(AssertUnwindSafe(|| (entry.listener)(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(
                target: "events",
                "Listener {:?} for '{}' failed: {e:#}",
                entry.id, event.name
            );
        }
        Err(_) => {
            error!(
                target: "events",
                "Listener {:?} for '{}' panicked",
                entry.id, event.name
            );
        }
    }
}
