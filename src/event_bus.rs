//! C1: process-local pub/sub event bus.
//!
//! Topics are a closed set of tagged variants rather than string-keyed
//! dynamic payloads (dropped unknown fields happen at serde's deserialize
//! boundary upstream of this module, not here). Each handler is dispatched
//! in its own tokio task so a slow or panicking handler never blocks the
//! publisher or its siblings.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::models::{EntrySignal, ExitSignal, OrderStatusEvent, OrderTimeoutEvent};

#[derive(Debug, Clone)]
pub enum Event {
    EntrySignal(EntrySignal),
    ExitSignal(ExitSignal),
    OrderPlaced(OrderStatusEvent),
    OrderFilled(OrderStatusEvent),
    OrderTimeout(OrderTimeoutEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    EntrySignal,
    ExitSignal,
    OrderPlaced,
    OrderFilled,
    OrderTimeout,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::EntrySignal(_) => EventKind::EntrySignal,
            Event::ExitSignal(_) => EventKind::ExitSignal,
            Event::OrderPlaced(_) => EventKind::OrderPlaced,
            Event::OrderFilled(_) => EventKind::OrderFilled,
            Event::OrderTimeout(_) => EventKind::OrderTimeout,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::EntrySignal => "ENTRY_SIGNAL",
            EventKind::ExitSignal => "EXIT_SIGNAL",
            EventKind::OrderPlaced => "ORDER_PLACED",
            EventKind::OrderFilled => "ORDER_FILLED",
            EventKind::OrderTimeout => "ORDER_TIMEOUT",
        };
        write!(f, "{name}")
    }
}

pub type Handler = Arc<dyn Fn(Event) -> futures_handler::HandlerFuture + Send + Sync>;

/// Boxed-future plumbing kept in its own tiny module so the trait-object
/// signature above stays readable.
mod futures_handler {
    use std::future::Future;
    use std::pin::Pin;

    pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
}

#[derive(Default, Clone)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<EventKind, Vec<Handler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `kind`. Returns nothing comparable to an
    /// unsubscribe token by design — callers that need to unsubscribe keep
    /// the bus scoped to their own lifetime instead, matching this core's
    /// usage (handlers live for the process).
    pub fn subscribe<F, Fut>(&self, kind: EventKind, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let wrapped: Handler = Arc::new(move |event| Box::pin(handler(event)));
        self.subscribers.write().entry(kind).or_default().push(wrapped);
    }

    /// Removes all handlers for `kind`.
    pub fn unsubscribe_all(&self, kind: EventKind) {
        self.subscribers.write().remove(&kind);
    }

    /// Publishes `event`, dispatching a copy to each subscribed handler on
    /// its own tokio task. Never blocks on handler completion and never
    /// propagates handler panics to the caller.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        let handlers = {
            let guard = self.subscribers.read();
            guard.get(&kind).cloned().unwrap_or_default()
        };

        if handlers.is_empty() {
            debug!(topic = %kind, "publish with no subscribers");
            return;
        }

        for handler in handlers {
            let event = event.clone();
            tokio::spawn(async move {
                // catch_unwind needs UnwindSafe; handlers are already
                // isolated by being spawned on their own task, so a panic
                // here only aborts this task, never the publisher.
                handler(event).await;
            });
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .get(&kind)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

pub fn log_handler_error(topic: EventKind, err: &anyhow::Error) {
    error!(topic = %topic, error = %err, "event handler failed");
}
