//! Event subscriptions and fan-out.
//!
//! Handlers are plain synchronous callbacks. A dispatch works on a snapshot
//! of the handlers registered when it starts, so handlers may subscribe or
//! unsubscribe from inside a callback, and a panicking handler is contained
//! without starving its siblings.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{error, trace};

/// Callback invoked with an event's payload.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

type HandlerId = u64;

#[derive(Default)]
struct Handlers {
    next_id: HandlerId,
    by_event: HashMap<String, Vec<(HandlerId, EventHandler)>>,
}

/// Event name → handlers.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    handlers: Arc<Mutex<Handlers>>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.lock();
        let counts: HashMap<&str, usize> = handlers
            .by_event
            .iter()
            .map(|(event, list)| (event.as_str(), list.len()))
            .collect();
        f.debug_struct("SubscriptionRegistry")
            .field("handlers", &counts)
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`. The handler stays registered until the
    /// returned [`Subscription`] is used to remove it.
    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let event = event.into();
        let mut handlers = self.handlers.lock();
        let id = handlers.next_id;
        handlers.next_id += 1;
        handlers
            .by_event
            .entry(event.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            registry: Arc::downgrade(&self.handlers),
            event,
            id,
        }
    }

    /// Invoke every handler registered for `event` and return how many ran
    /// to completion.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let snapshot: Vec<EventHandler> = {
            let handlers = self.handlers.lock();
            match handlers.by_event.get(event) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => Vec::new(),
            }
        };
        if snapshot.is_empty() {
            trace!(event, "no subscribers for event");
            return 0;
        }

        let mut delivered = 0;
        for handler in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    error!(event, reason = panic_message(&*panic), "event handler panicked");
                }
            }
        }
        delivered
    }

    #[cfg(test)]
    fn handler_count(&self, event: &str) -> usize {
        self.handlers
            .lock()
            .by_event
            .get(event)
            .map_or(0, Vec::len)
    }
}

/// Handle returned by [`SubscriptionRegistry::subscribe`].
///
/// Dropping it does **not** unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Debug)]
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    registry: Weak<Mutex<Handlers>>,
    event: String,
    id: HandlerId,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Remove exactly this handler. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut handlers = registry.lock();
        let Some(list) = handlers.by_event.get_mut(&self.event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != self.id);
        let removed = list.len() != before;
        if list.is_empty() {
            let _ = handlers.by_event.remove(&self.event);
        }
        removed
    }

    /// Turn the handle into a plain closure that unsubscribes when called.
    pub fn into_unsubscribe_fn(self) -> impl FnOnce() + Send + 'static {
        move || {
            let _ = self.unsubscribe();
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
