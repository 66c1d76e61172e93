//! Frame types for the Fanout protocol.
//!
//! Outbound frames are internally tagged by `action`. Inbound frames carry no
//! tag; they are told apart by the keys they contain.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A frame sent from the multiplexer to the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Begin delivery of a channel over this connection.
    Subscribe {
        /// Channel name to subscribe to.
        channel: String,
    },

    /// Stop delivery of a channel over this connection.
    Unsubscribe {
        /// Channel name to unsubscribe from.
        channel: String,
    },

    /// Publish a message to a channel.
    Publish {
        /// Request ID, present only when the sender waits for an ack.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Target channel.
        channel: String,
        /// JSON payload.
        message: Value,
    },
}

impl ClientFrame {
    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(channel: impl Into<String>) -> Self {
        ClientFrame::Subscribe {
            channel: channel.into(),
        }
    }

    /// Create a new Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(channel: impl Into<String>) -> Self {
        ClientFrame::Unsubscribe {
            channel: channel.into(),
        }
    }

    /// Create a new fire-and-forget Publish frame.
    #[must_use]
    pub fn publish(channel: impl Into<String>, message: Value) -> Self {
        ClientFrame::Publish {
            id: None,
            channel: channel.into(),
            message,
        }
    }

    /// Create a new Publish frame that expects an acknowledgment.
    #[must_use]
    pub fn publish_with_ack(id: u64, channel: impl Into<String>, message: Value) -> Self {
        ClientFrame::Publish {
            id: Some(id),
            channel: channel.into(),
            message,
        }
    }

    /// The channel this frame targets.
    #[must_use]
    pub fn channel(&self) -> &str {
        match self {
            ClientFrame::Subscribe { channel }
            | ClientFrame::Unsubscribe { channel }
            | ClientFrame::Publish { channel, .. } => channel,
        }
    }

    /// The wire name of the frame's action.
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            ClientFrame::Subscribe { .. } => "subscribe",
            ClientFrame::Unsubscribe { .. } => "unsubscribe",
            ClientFrame::Publish { .. } => "publish",
        }
    }
}

/// A message pushed by the server for one channel.
///
/// Servers either wrap the payload in `message` or push a flat object that
/// merely carries a `channel` key. In the second case every other key is
/// treated as the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Channel the event belongs to.
    pub channel: String,
    /// Wrapped payload, if the server used one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    /// Identity of the publisher, when the server reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    /// Server-assigned ordering token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timetoken: Option<String>,
    /// Any remaining keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EventEnvelope {
    /// Create an envelope with a wrapped payload.
    #[must_use]
    pub fn new(channel: impl Into<String>, message: Value) -> Self {
        Self {
            channel: channel.into(),
            message: Some(message),
            publisher: None,
            timetoken: None,
            extra: Map::new(),
        }
    }

    /// Set the publisher identity.
    #[must_use]
    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = Some(publisher.into());
        self
    }

    /// Split the envelope into its channel, payload and publisher.
    #[must_use]
    pub fn into_parts(self) -> (String, Value, Option<String>) {
        let payload = match self.message {
            Some(message) => message,
            None => Value::Object(self.extra),
        };
        (self.channel, payload, self.publisher)
    }
}

/// A frame received from the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// A message for a subscribed channel.
    Event(EventEnvelope),

    /// Acknowledgment of a publish.
    Ack {
        /// ID of the acknowledged publish.
        ack: u64,
    },

    /// Error response.
    Error {
        /// Human-readable error message.
        error: String,
        /// ID of the failed publish, if the error answers one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
}

impl ServerFrame {
    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        ServerFrame::Ack { ack: id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: Option<u64>, error: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: error.into(),
            id,
        }
    }
}
