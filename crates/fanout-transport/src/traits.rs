//! Transport abstraction traits for Fanout.
//!
//! A transport owns exactly one physical connection and exposes a minimal
//! capability set to the multiplexer: connect, fire-and-forget subscribe and
//! unsubscribe requests, publish, and a single inbound event callback.

use async_trait::async_trait;
use fanout_core::InboundEvent;
use fanout_protocol::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

/// The identity a process presents when connecting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub String);

impl Identity {
    /// Create a new identity.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random identity.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::UNIX_EPOCH;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self(format!("fanout-{:x}", timestamp))
    }

    /// Get the identity as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identity is blank.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Describes an established connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    identity: Identity,
    transport: &'static str,
    connected_at: SystemTime,
}

impl ConnectionHandle {
    /// Create a handle for a connection that was just opened.
    #[must_use]
    pub fn new(identity: Identity, transport: &'static str) -> Self {
        Self {
            identity,
            transport,
            connected_at: SystemTime::now(),
        }
    }

    /// The identity the connection was opened with.
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The name of the transport that owns the connection.
    #[must_use]
    pub fn transport(&self) -> &'static str {
        self.transport
    }

    /// When the connection was opened.
    #[must_use]
    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }
}

/// A connection-level event, translated into a uniform shape.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A message arrived for a topic.
    Message(InboundEvent),
    /// The connection reported an error.
    Error(String),
    /// The connection closed.
    Closed,
}

/// The single inbound dispatcher registered with a transport.
pub type EventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Acknowledgment of a successful publish.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishAck {
    /// Server-assigned timetoken, when the transport reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timetoken: Option<String>,
}

/// Errors raised by [`Transport::connect`].
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Required configuration is missing.
    #[error("Missing configuration: {0}")]
    MissingConfig(&'static str),

    /// Required credentials are missing.
    #[error("Missing credentials: {0}")]
    MissingCredentials(&'static str),

    /// The configured URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The handshake with the remote side failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The remote side refused the connection.
    #[error("Connection rejected: {0}")]
    Rejected(String),
}

/// Errors raised by [`Transport::publish`].
#[derive(Debug, Error)]
pub enum PublishError {
    /// No connection is established.
    #[error("Not connected")]
    NotConnected,

    /// Publishing needs configuration that is absent.
    #[error("Publish not configured: {0}")]
    NotConfigured(&'static str),

    /// The transport cannot publish.
    #[error("Publish unsupported: {0}")]
    Unsupported(&'static str),

    /// The remote side rejected the payload.
    #[error("Publish rejected: {0}")]
    Rejected(String),

    /// No acknowledgment arrived in time.
    #[error("Publish timed out")]
    Timeout,

    /// Writing to the connection failed.
    #[error("Send failed: {0}")]
    Send(String),

    /// The payload could not be encoded.
    #[error("Encoding failed: {0}")]
    Encode(#[from] ProtocolError),
}

/// Errors raised by the fire-and-forget primitives.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No connection is established.
    #[error("Not connected")]
    NotConnected,

    /// An event handler was already registered.
    #[error("Event handler already registered")]
    HandlerAlreadyRegistered,

    /// The request could not be queued.
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// A transport owning one physical connection.
///
/// `send_subscribe` and `send_unsubscribe` must not block and must not call
/// the registered event handler synchronously: the multiplexer invokes them
/// inside the per-topic critical section.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Get the transport name (e.g., "websocket", "sse").
    fn name(&self) -> &'static str;

    /// Open the connection, or return the existing one.
    ///
    /// Idempotent: while a connection is open no network action is taken.
    async fn connect(&self, identity: &Identity) -> Result<ConnectionHandle, ConnectionError>;

    /// Check if a connection is currently open.
    fn is_connected(&self) -> bool;

    /// Ask the remote side to start delivering a topic.
    fn send_subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Ask the remote side to stop delivering a topic.
    fn send_unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Register the one dispatcher that receives every inbound event.
    fn on_event(&self, handler: EventHandler) -> Result<(), TransportError>;

    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, payload: Value) -> Result<PublishAck, PublishError>;
}
