use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::SentEvent;

type Handler = Arc<dyn Fn(&SentEvent) + Send + Sync>;

/// In-process listeners keyed by event name
#[derive(Default)]
pub struct Listeners {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, name: &str, handler: F)
    where
        F: Fn(&SentEvent) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(name.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Call every handler registered for `name`; returns how many ran
    pub fn emit(&self, name: &str, event: &SentEvent) -> usize {
        // Handlers run outside the lock so they may register more listeners
        let handlers: Vec<Handler> = match self.handlers.read().get(name) {
            Some(handlers) => handlers.clone(),
            None => return 0,
        };

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.handlers.read().get(name).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<String, usize> = self
            .handlers
            .read()
            .iter()
            .map(|(name, handlers)| (name.clone(), handlers.len()))
            .collect();
        f.debug_struct("Listeners").field("handlers", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::Flow;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sent_event() -> SentEvent {
        SentEvent {
            event_id: "m-1".to_string(),
            event_type: "order.created".to_string(),
            resource: "orders-service".to_string(),
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
            trace: String::new(),
            context: Default::default(),
            priority: None,
            delay: None,
            schedule: None,
            flow: Flow::Exit,
            origin: true,
        }
    }

    #[test]
    fn test_emit_calls_only_matching_handlers() {
        let listeners = Listeners::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            listeners.on("sent", move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        listeners.on("received", |_| panic!("wrong listener"));

        assert_eq!(listeners.emit("sent", &sent_event()), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(listeners.emit("unknown", &sent_event()), 0);
        assert_eq!(listeners.listener_count("received"), 1);
    }

    #[test]
    fn test_handler_may_register_listener() {
        let listeners = Arc::new(Listeners::new());
        let inner = Arc::clone(&listeners);
        listeners.on("sent", move |_| inner.on("sent", |_| {}));

        listeners.emit("sent", &sent_event());
        assert_eq!(listeners.listener_count("sent"), 2);
    }
}
