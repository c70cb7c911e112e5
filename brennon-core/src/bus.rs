//! In-process event bus.
//!
//! Handlers run synchronously on the publishing thread, in registration
//! order, and only for the event's concrete type. A failing handler (error
//! or panic) is logged and never stops the remaining handlers or reaches the
//! publisher.

use crate::events::Event;
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::error;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

type Handler = Arc<dyn Fn(&mut dyn Any) -> HandlerResult + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<TypeId, Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for events of type `E`.
    pub fn subscribe<E, F>(&self, handler: F)
    where
        E: Event,
        F: Fn(&mut E) -> HandlerResult + Send + Sync + 'static,
    {
        let erased: Handler = Arc::new(move |event: &mut dyn Any| match event.downcast_mut::<E>() {
            Some(event) => handler(event),
            None => Ok(()),
        });

        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(TypeId::of::<E>())
            .or_default()
            .push(erased);
    }

    /// Run every handler registered for `E` and hand the event back, so the
    /// caller can inspect the cancelled flag.
    pub fn publish<E: Event>(&self, mut event: E) -> E {
        // Snapshot the list so handlers may subscribe or publish re-entrantly.
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<E>())
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&mut event as &mut dyn Any)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(event = type_name::<E>(), error = %err, "event handler failed");
                }
                Err(_) => {
                    error!(event = type_name::<E>(), "event handler panicked");
                }
            }
        }

        event
    }

    /// Drop all handlers for `E`. Used on shutdown/reload.
    pub fn unsubscribe_all<E: Event>(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&TypeId::of::<E>());
    }

    /// Drop every handler.
    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn handler_count<E: Event>(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<E>())
            .map_or(0, Vec::len)
    }
}
