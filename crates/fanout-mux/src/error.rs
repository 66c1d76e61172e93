//! Error and warning types for the multiplexer.

use crate::metrics;
use fanout_core::RegistryError;
use fanout_transport::{ConnectionError, PublishError, TransportError};
use thiserror::Error;
use tracing::warn;

/// Errors returned to multiplexer callers.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The topic name was rejected.
    #[error("Invalid topic name: {0}")]
    InvalidTopic(&'static str),

    /// Connecting the transport failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Publishing failed.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// The transport refused a request.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The registry rejected an operation.
    #[error(transparent)]
    Registry(RegistryError),
}

impl From<RegistryError> for MuxError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidTopic(reason) => Self::InvalidTopic(reason),
            other => Self::Registry(other),
        }
    }
}

/// A non-fatal condition that is logged and counted, never returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionWarning {
    /// An operation ran before the transport was connected.
    #[error("{0} attempted before the transport connected")]
    NotConnected(&'static str),

    /// A release targeted a topic with no live entry.
    #[error("topic {0} is not subscribed")]
    UnknownTopic(String),

    /// A release targeted an earlier incarnation of a topic.
    #[error("stale release for topic {0}")]
    StaleRelease(String),

    /// The transport refused a subscribe or unsubscribe request.
    #[error("transport refused request for topic {0}: {1}")]
    TransportRefused(String, String),

    /// An inbound event arrived for a topic with no live entry.
    #[error("dropped event for unsubscribed topic {0}")]
    DroppedEvent(String),
}

impl SubscriptionWarning {
    /// Short label used as the metric tag.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected(_) => "not_connected",
            Self::UnknownTopic(_) => "unknown_topic",
            Self::StaleRelease(_) => "stale_release",
            Self::TransportRefused(..) => "transport_refused",
            Self::DroppedEvent(_) => "dropped_event",
        }
    }

    /// Log the warning and count it.
    pub fn emit(self) {
        metrics::record_warning(self.kind());
        warn!(kind = self.kind(), "{}", self);
    }
}
