//! In-process loopback transport.
//!
//! The loopback transport keeps no socket. It records every command it is
//! given and echoes publishes back as inbound events for topics it has been
//! asked to deliver. Hooks let callers inject inbound traffic and refuse
//! requests.

use async_trait::async_trait;
use fanout_core::InboundEvent;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::dispatcher::EventDispatcher;
use crate::traits::{
    ConnectionError, ConnectionHandle, EventHandler, Identity, PublishAck, PublishError, Transport,
    TransportError, TransportEvent,
};

/// A request the loopback transport received.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `send_subscribe` was called.
    Subscribe(String),
    /// `send_unsubscribe` was called.
    Unsubscribe(String),
    /// `publish` was called.
    Publish {
        /// Target topic.
        topic: String,
        /// Published payload.
        payload: Value,
    },
}

/// In-process transport for embedding and tests.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    dispatcher: EventDispatcher,
    connection: Mutex<Option<ConnectionHandle>>,
    commands: Mutex<Vec<Command>>,
    delivering: Mutex<HashSet<String>>,
    connects: AtomicUsize,
    refuse_subscribe: AtomicBool,
    reject_publish: AtomicBool,
    next_timetoken: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LoopbackTransport {
    /// Create a new, unconnected loopback transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `send_subscribe` calls fail.
    pub fn set_refuse_subscribe(&self, refuse: bool) {
        self.refuse_subscribe.store(refuse, Ordering::SeqCst);
    }

    /// Make subsequent `publish` calls be rejected.
    pub fn set_reject_publish(&self, reject: bool) {
        self.reject_publish.store(reject, Ordering::SeqCst);
    }

    /// Deliver an event as if the remote side had sent it.
    ///
    /// The event is passed to the handler whether or not its topic was
    /// subscribed.
    pub fn inject(&self, event: InboundEvent) {
        self.dispatcher.emit(TransportEvent::Message(event));
    }

    /// Report a connection error to the handler.
    pub fn inject_error(&self, error: impl Into<String>) {
        self.dispatcher.emit(TransportEvent::Error(error.into()));
    }

    /// Close the connection and report it to the handler.
    pub fn close(&self) {
        lock(&self.connection).take();
        lock(&self.delivering).clear();
        self.dispatcher.emit(TransportEvent::Closed);
    }

    /// Every command received so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<Command> {
        lock(&self.commands).clone()
    }

    /// Forget recorded commands.
    pub fn clear_commands(&self) {
        lock(&self.commands).clear();
    }

    /// Number of subscribe requests received for a topic.
    #[must_use]
    pub fn subscribe_count(&self, topic: &str) -> usize {
        lock(&self.commands)
            .iter()
            .filter(|c| matches!(c, Command::Subscribe(t) if t == topic))
            .count()
    }

    /// Number of unsubscribe requests received for a topic.
    #[must_use]
    pub fn unsubscribe_count(&self, topic: &str) -> usize {
        lock(&self.commands)
            .iter()
            .filter(|c| matches!(c, Command::Unsubscribe(t) if t == topic))
            .count()
    }

    /// Number of connections actually opened.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Whether the transport currently delivers a topic.
    #[must_use]
    pub fn is_delivering(&self, topic: &str) -> bool {
        lock(&self.delivering).contains(topic)
    }

    fn identity(&self) -> Option<Identity> {
        lock(&self.connection)
            .as_ref()
            .map(|handle| handle.identity().clone())
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn connect(&self, identity: &Identity) -> Result<ConnectionHandle, ConnectionError> {
        if identity.is_empty() {
            return Err(ConnectionError::MissingCredentials("identity"));
        }

        let mut connection = lock(&self.connection);
        if let Some(handle) = connection.as_ref() {
            debug!("Loopback already connected");
            return Ok(handle.clone());
        }

        let handle = ConnectionHandle::new(identity.clone(), self.name());
        *connection = Some(handle.clone());
        self.connects.fetch_add(1, Ordering::SeqCst);

        info!(identity = %identity, "Loopback transport connected");
        Ok(handle)
    }

    fn is_connected(&self) -> bool {
        lock(&self.connection).is_some()
    }

    fn send_subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.refuse_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("subscribe refused".into()));
        }

        lock(&self.commands).push(Command::Subscribe(topic.to_string()));
        lock(&self.delivering).insert(topic.to_string());
        Ok(())
    }

    fn send_unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        lock(&self.commands).push(Command::Unsubscribe(topic.to_string()));
        lock(&self.delivering).remove(topic);
        Ok(())
    }

    fn on_event(&self, handler: EventHandler) -> Result<(), TransportError> {
        self.dispatcher.register(handler)
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<PublishAck, PublishError> {
        let identity = self.identity().ok_or(PublishError::NotConnected)?;
        if self.reject_publish.load(Ordering::SeqCst) {
            return Err(PublishError::Rejected("payload rejected".into()));
        }

        lock(&self.commands).push(Command::Publish {
            topic: topic.to_string(),
            payload: payload.clone(),
        });

        let timetoken = self.next_timetoken.fetch_add(1, Ordering::SeqCst).to_string();

        // Echo only what a real server would deliver back to us.
        if self.is_delivering(topic) {
            let event = InboundEvent::new(topic, payload)
                .with_publisher(identity.as_str())
                .with_timetoken(timetoken.clone());
            self.dispatcher.emit(TransportEvent::Message(event));
        }

        Ok(PublishAck {
            timetoken: Some(timetoken),
        })
    }
}
