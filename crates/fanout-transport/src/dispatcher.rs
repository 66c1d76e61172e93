//! Single-owner inbound event dispatch.

use crate::traits::{EventHandler, TransportError, TransportEvent};
use std::fmt;
use std::sync::OnceLock;
use tracing::trace;

/// Holds the one event handler a transport delivers to.
#[derive(Default)]
pub struct EventDispatcher {
    handler: OnceLock<EventHandler>,
}

impl EventDispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler.
    ///
    /// # Errors
    ///
    /// Returns an error if a handler is already registered.
    pub fn register(&self, handler: EventHandler) -> Result<(), TransportError> {
        self.handler
            .set(handler)
            .map_err(|_| TransportError::HandlerAlreadyRegistered)
    }

    /// Check if a handler is registered.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.handler.get().is_some()
    }

    /// Deliver an event to the handler, if any.
    pub fn emit(&self, event: TransportEvent) {
        match self.handler.get() {
            Some(handler) => handler(event),
            None => trace!("No event handler registered; dropping transport event"),
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("registered", &self.is_registered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_single_registration() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));

        // Emitting before registration is a no-op.
        dispatcher.emit(TransportEvent::Closed);

        let counter = Arc::clone(&seen);
        dispatcher
            .register(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert!(dispatcher.is_registered());

        assert!(matches!(
            dispatcher.register(Arc::new(|_| {})),
            Err(TransportError::HandlerAlreadyRegistered)
        ));

        dispatcher.emit(TransportEvent::Error("boom".into()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
