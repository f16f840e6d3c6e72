use crate::core::domain::notification::NotificationPayload;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Subscribes to every event type.
pub const WILDCARD: &str = "*";

/// A subscriber callback. An `Err` makes the runtime acknowledge the event as failed.
pub type Handler = Arc<dyn Fn(&NotificationPayload) -> Result<(), String> + Send + Sync>;

/// Wraps a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&NotificationPayload) -> Result<(), String> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Default)]
struct Handlers {
    next_id: u64,
    by_type: HashMap<String, Vec<(u64, Handler)>>,
    closed: bool,
}

/// Event type to handler table shared by the runtime and its [`Subscription`]s.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<Handlers>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Handlers> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `handler` for `event_type` (or [`WILDCARD`]).
    ///
    /// The returned guard unsubscribes when dropped.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe(&self, event_type: impl Into<String>, handler: Handler) -> Subscription {
        let event_type = event_type.into();
        let mut handlers = self.lock();
        let id = handlers.next_id;
        handlers.next_id += 1;
        if !handlers.closed {
            handlers
                .by_type
                .entry(event_type.clone())
                .or_default()
                .push((id, handler));
        }
        Subscription {
            registry: Arc::downgrade(&self.inner),
            event_type,
            id,
        }
    }

    /// Runs the handlers of `payload.event_type`, then the wildcard handlers,
    /// each in subscription order. A handler registered twice runs once.
    ///
    /// # Returns
    ///
    /// The number of handlers run, or the first handler error.
    pub fn dispatch(&self, payload: &NotificationPayload) -> Result<usize, String> {
        let selected: Vec<Handler> = {
            let handlers = self.lock();
            if handlers.closed {
                return Ok(0);
            }
            let mut selected: Vec<Handler> = Vec::new();
            for key in [payload.event_type.as_str(), WILDCARD] {
                for (_, handler) in handlers.by_type.get(key).into_iter().flatten() {
                    if !selected.iter().any(|h| Arc::ptr_eq(h, handler)) {
                        selected.push(handler.clone());
                    }
                }
            }
            selected
        };

        let mut first_error = None;
        for handler in &selected {
            if let Err(e) = handler(payload) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(selected.len()),
        }
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.lock().by_type.get(event_type).map_or(0, Vec::len)
    }

    /// Drops every handler and refuses new ones; later dispatches are no-ops.
    pub fn close(&self) {
        let mut handlers = self.lock();
        handlers.closed = true;
        handlers.by_type.clear();
    }
}

/// Scoped registration of one handler.
pub struct Subscription {
    registry: Weak<Mutex<Handlers>>,
    event_type: String,
    id: u64,
}

impl Subscription {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Unsubscribes now. Same as dropping the guard.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut handlers = inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = handlers.by_type.get_mut(&self.event_type) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                handlers.by_type.remove(&self.event_type);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: &Arc<AtomicUsize>) -> Handler {
        let counter = counter.clone();
        handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_drop_unsubscribes() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let payload = NotificationPayload::new("order:new", json!({}));

        let subscription = registry.subscribe("order:new", counting(&hits));
        assert_eq!(registry.dispatch(&payload), Ok(1));
        drop(subscription);
        assert_eq!(registry.handler_count("order:new"), 0);
        assert_eq!(registry.dispatch(&payload), Ok(0));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wildcard_and_shared_handler_run_once() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let shared = counting(&hits);
        let _a = registry.subscribe("order:ready", shared.clone());
        let _b = registry.subscribe(WILDCARD, shared);
        let _c = registry.subscribe(WILDCARD, counting(&hits));

        let payload = NotificationPayload::new("order:ready", json!({}));
        assert_eq!(registry.dispatch(&payload), Ok(2));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_handler_error_is_reported_after_all_ran() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let _a = registry.subscribe("payment:requested", handler(|_| Err("boom".to_string())));
        let _b = registry.subscribe("payment:requested", counting(&hits));

        let payload = NotificationPayload::new("payment:requested", json!({}));
        assert_eq!(registry.dispatch(&payload), Err("boom".to_string()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_registry_never_dispatches() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let subscription = registry.subscribe("order:new", counting(&hits));
        registry.close();
        let _late = registry.subscribe("order:new", counting(&hits));

        let payload = NotificationPayload::new("order:new", json!({}));
        assert_eq!(registry.dispatch(&payload), Ok(0));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        drop(subscription);
    }
}
