//! Event routing.
//!
//! Two handler tables drive delivery:
//!
//! - a **global** table keyed by effective event name (`Event-Subclass`
//!   for `CUSTOM`, `Event-Name` otherwise) with a `*` wildcard bucket
//!   matched for every event;
//! - a **channel** table keyed `"<uuid>:<name>"` for O(1) dispatch of
//!   channel-scoped handlers.  When a channel entry matches, it is
//!   authoritative: global handlers do not run for that event.
//!
//! Handlers run as detached tasks so a slow or panicking handler can never
//! stall the reader; panics are caught and logged.  Removing a handler is
//! idempotent, and removing the last handler for a key drops the key.

use crate::metrics::metrics;
use esl_wire::EslEvent;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Identity of a registered handler, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type TaskFn = Arc<dyn Fn(EslEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
type BlockingFn = Arc<dyn Fn(EslEvent) + Send + Sync>;

/// A registered handler: either an async task or a plain function that is
/// shunted to the blocking pool so it cannot stall the consumer loop.
#[derive(Clone)]
pub enum EventHandler {
    Task(TaskFn),
    Blocking(BlockingFn),
}

impl EventHandler {
    /// An async handler, spawned as a detached task per delivery.
    pub fn task<F, Fut>(f: F) -> Self
    where
        F: Fn(EslEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        EventHandler::Task(Arc::new(move |event| Box::pin(f(event))))
    }

    /// A synchronous handler, run on the blocking pool per delivery.
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(EslEvent) + Send + Sync + 'static,
    {
        EventHandler::Blocking(Arc::new(f))
    }

    fn dispatch(&self, event: EslEvent, key: String) {
        match self {
            EventHandler::Task(f) => {
                let fut = f(event);
                tokio::spawn(async move {
                    if std::panic::AssertUnwindSafe(fut)
                        .catch_unwind()
                        .await
                        .is_err()
                    {
                        warn!(key = %key, "event handler panicked");
                    }
                });
            }
            EventHandler::Blocking(f) => {
                let f = f.clone();
                tokio::spawn(async move {
                    if tokio::task::spawn_blocking(move || f(event)).await.is_err() {
                        warn!(key = %key, "blocking event handler panicked");
                    }
                });
            }
        }
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventHandler::Task(_) => f.write_str("EventHandler::Task"),
            EventHandler::Blocking(_) => f.write_str("EventHandler::Blocking"),
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tables {
    global: HashMap<String, Vec<(HandlerId, EventHandler)>>,
    channel: HashMap<String, Vec<(HandlerId, EventHandler)>>,
}

/// The event routing fabric shared by one connection.
#[derive(Default)]
pub struct Router {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
}

impl Router {
    pub fn new() -> Self {
        Router::default()
    }

    /// Reserve a handler id without registering anything yet.  Correlation
    /// code allocates ids up front so a handler can unregister itself and
    /// its siblings from inside its own body.
    pub fn allocate_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a global handler for an event name (or `*`).
    pub fn on(&self, name: &str, handler: EventHandler) -> HandlerId {
        let id = self.allocate_id();
        self.on_with_id(name, id, handler);
        id
    }

    pub fn on_with_id(&self, name: &str, id: HandlerId, handler: EventHandler) {
        debug!(event = %name, "register global handler");
        self.tables
            .lock()
            .unwrap()
            .global
            .entry(name.to_owned())
            .or_default()
            .push((id, handler));
    }

    /// Remove a global handler; idempotent.
    pub fn remove(&self, name: &str, id: HandlerId) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(handlers) = tables.global.get_mut(name) {
            handlers.retain(|(hid, _)| *hid != id);
            if handlers.is_empty() {
                tables.global.remove(name);
            }
        }
    }

    /// Register a channel-scoped handler for `(uuid, event name)`.
    pub fn on_channel(&self, uuid: &str, name: &str, handler: EventHandler) -> HandlerId {
        let id = self.allocate_id();
        self.on_channel_with_id(uuid, name, id, handler);
        id
    }

    pub fn on_channel_with_id(&self, uuid: &str, name: &str, id: HandlerId, handler: EventHandler) {
        let key = channel_key(uuid, name);
        debug!(key = %key, "register channel handler");
        self.tables
            .lock()
            .unwrap()
            .channel
            .entry(key)
            .or_default()
            .push((id, handler));
    }

    /// Remove a channel-scoped handler; idempotent.
    pub fn remove_channel(&self, uuid: &str, name: &str, id: HandlerId) {
        let key = channel_key(uuid, name);
        let mut tables = self.tables.lock().unwrap();
        if let Some(handlers) = tables.channel.get_mut(&key) {
            handlers.retain(|(hid, _)| *hid != id);
            if handlers.is_empty() {
                tables.channel.remove(&key);
            }
        }
    }

    /// Route one event.  Channel-table hits stop the chain; otherwise the
    /// global bucket for the effective name plus the wildcard bucket run.
    pub fn dispatch(&self, event: &EslEvent) {
        let name = event.effective_name().map(str::to_owned);

        // O(1) channel routing first.
        if let (Some(uuid), Some(name)) = (event.unique_id(), name.as_deref()) {
            let key = channel_key(uuid, name);
            let handlers: Vec<EventHandler> = {
                let tables = self.tables.lock().unwrap();
                tables
                    .channel
                    .get(&key)
                    .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
                    .unwrap_or_default()
            };
            if !handlers.is_empty() {
                trace!(key = %key, handlers = handlers.len(), "channel routing hit");
                metrics().channel_routing_hits.fetch_add(1, Ordering::Relaxed);
                for handler in handlers {
                    handler.dispatch(event.clone(), key.clone());
                }
                return;
            }
        }

        // Global fallback: named bucket plus wildcard.
        let handlers: Vec<EventHandler> = {
            let tables = self.tables.lock().unwrap();
            let mut out = Vec::new();
            if let Some(name) = name.as_deref() {
                if let Some(hs) = tables.global.get(name) {
                    out.extend(hs.iter().map(|(_, h)| h.clone()));
                }
            }
            if let Some(hs) = tables.global.get("*") {
                out.extend(hs.iter().map(|(_, h)| h.clone()));
            }
            out
        };
        if handlers.is_empty() {
            return;
        }
        metrics()
            .global_routing_fallbacks
            .fetch_add(1, Ordering::Relaxed);
        let key = name.unwrap_or_else(|| "*".to_owned());
        for handler in handlers {
            handler.dispatch(event.clone(), key.clone());
        }
    }
}

fn channel_key(uuid: &str, name: &str) -> String {
    format!("{uuid}:{name}")
}
