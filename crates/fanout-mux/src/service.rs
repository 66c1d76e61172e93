//! The multiplexer service.
//!
//! Owns the lifecycle around a [`Multiplexer`]: wiring the inbound handler,
//! connecting the transport, replaying topics subscribed before the
//! connection existed, and draining everything on stop.

use fanout_core::{RegistryConfig, RegistryStats, TopicRegistry, DEFAULT_STREAM_CAPACITY};
use fanout_transport::{ConnectionHandle, Identity, PublishAck, Transport};
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::binding::Subscription;
use crate::error::MuxError;
use crate::multiplexer::Multiplexer;

/// Multiplexer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Events buffered per topic before slow consumers start skipping.
    /// Must be non-zero.
    pub stream_capacity: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            stream_capacity: DEFAULT_STREAM_CAPACITY,
        }
    }
}

/// A multiplexer with an explicit start/stop lifecycle.
pub struct MultiplexerService {
    mux: Multiplexer,
    identity: Identity,
    handler_registered: AtomicBool,
}

impl MultiplexerService {
    /// Create a stopped service.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        transport: Arc<dyn Transport>,
        identity: Identity,
        config: MuxConfig,
    ) -> Result<Self, MuxError> {
        let registry = TopicRegistry::with_config(RegistryConfig {
            stream_capacity: config.stream_capacity,
        })?;
        Ok(Self {
            mux: Multiplexer::new(transport, Arc::new(registry)),
            identity,
            handler_registered: AtomicBool::new(false),
        })
    }

    /// Register the inbound handler, connect, and subscribe every topic
    /// that is still waiting for a transport subscribe.
    ///
    /// Calling `start` again is harmless.
    ///
    /// # Errors
    ///
    /// Returns an error if another handler already owns the transport's
    /// events or the connection fails.
    pub async fn start(&self) -> Result<ConnectionHandle, MuxError> {
        let transport = self.mux.transport();

        if !self.handler_registered.swap(true, Ordering::AcqRel) {
            if let Err(e) = transport.on_event(self.mux.event_handler()) {
                self.handler_registered.store(false, Ordering::Release);
                return Err(e.into());
            }
            debug!(transport = transport.name(), "Inbound handler registered");
        }

        let handle = transport.connect(&self.identity).await?;
        let replayed = self.mux.resubscribe_pending();

        info!(
            transport = transport.name(),
            identity = %self.identity,
            replayed,
            "Multiplexer service started"
        );
        Ok(handle)
    }

    /// Tear down every topic.
    ///
    /// Each transport-subscribed topic is unsubscribed and every binding's
    /// stream ends. Returns the number of topics removed.
    pub fn stop(&self) -> usize {
        let drained = self.mux.drain();
        info!(drained, "Multiplexer service stopped");
        drained
    }

    /// A cloneable multiplexer to hand to consumers.
    #[must_use]
    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    /// The identity used to connect.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Whether the transport is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.mux.transport().is_connected()
    }

    /// See [`Multiplexer::subscribe`].
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid.
    pub fn subscribe(&self, topic: &str) -> Result<Subscription, MuxError> {
        self.mux.subscribe(topic)
    }

    /// See [`Multiplexer::unsubscribe`].
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.mux.unsubscribe(subscription)
    }

    /// See [`Multiplexer::publish`].
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid or the transport fails.
    pub async fn publish(&self, topic: &str, payload: Value) -> Result<PublishAck, MuxError> {
        self.mux.publish(topic, payload).await
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.mux.stats()
    }
}
