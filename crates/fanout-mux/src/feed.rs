//! A topic feed: a subscription plus the state a UI-facing consumer keeps.

use fanout_core::InboundEvent;
use fanout_transport::PublishAck;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::binding::Subscription;
use crate::error::MuxError;
use crate::multiplexer::Multiplexer;

/// A subscription that remembers the latest event and, optionally, a bounded
/// local history.
///
/// The history is the feed's own; the multiplexer never replays events.
#[derive(Debug)]
pub struct TopicFeed {
    mux: Multiplexer,
    subscription: Subscription,
    last: Option<Arc<InboundEvent>>,
    history: VecDeque<Arc<InboundEvent>>,
    history_limit: usize,
}

impl TopicFeed {
    /// Subscribe to a topic without keeping history.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid.
    pub fn new(mux: &Multiplexer, topic: &str) -> Result<Self, MuxError> {
        Self::with_history(mux, topic, 0)
    }

    /// Subscribe to a topic, keeping up to `limit` received events.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid.
    pub fn with_history(mux: &Multiplexer, topic: &str, limit: usize) -> Result<Self, MuxError> {
        Ok(Self {
            mux: mux.clone(),
            subscription: mux.subscribe(topic)?,
            last: None,
            history: VecDeque::with_capacity(limit),
            history_limit: limit,
        })
    }

    /// The topic of this feed.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.subscription.topic()
    }

    /// Wait for the next event and record it.
    pub async fn next(&mut self) -> Option<Arc<InboundEvent>> {
        let event = self.subscription.recv().await?;

        if self.history_limit > 0 {
            if self.history.len() == self.history_limit {
                self.history.pop_front();
            }
            self.history.push_back(Arc::clone(&event));
        }
        self.last = Some(Arc::clone(&event));

        Some(event)
    }

    /// The most recent event, if any.
    #[must_use]
    pub fn last_message(&self) -> Option<&InboundEvent> {
        self.last.as_deref()
    }

    /// Retained events, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &InboundEvent> {
        self.history.iter().map(|event| &**event)
    }

    /// Whether the feed is still attached.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_active()
    }

    /// Forget the latest event and the history.
    pub fn clear(&mut self) {
        self.last = None;
        self.history.clear();
    }

    /// Publish a payload to this feed's topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport is not connected or rejects the
    /// payload.
    pub async fn publish(&self, payload: Value) -> Result<PublishAck, MuxError> {
        self.mux.publish(self.topic(), payload).await
    }

    /// Detach the feed.
    pub fn unsubscribe(&self) -> bool {
        self.subscription.unsubscribe()
    }
}
