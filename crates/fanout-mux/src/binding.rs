//! Consumer bindings.
//!
//! A [`Subscription`] is one consumer's attachment to one topic. It yields
//! every event delivered to the topic after it attached, until it is
//! detached or the topic is torn down underneath it.

use fanout_core::{Attachment, InboundEvent, TopicStream};
use futures_util::Stream;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::metrics;
use crate::multiplexer::Multiplexer;

/// Release state shared by a subscription and its detach handles.
struct Binding {
    mux: Multiplexer,
    topic: String,
    epoch: u64,
    released: AtomicBool,
    cancel: CancellationToken,
}

impl Binding {
    /// Release the subscription. Only the first call has any effect.
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        self.mux.release(&self.topic, self.epoch);
        trace!(topic = %self.topic, epoch = self.epoch, "Binding released");
        true
    }
}

/// One consumer's attachment to a topic.
///
/// Dropping the subscription releases it.
pub struct Subscription {
    binding: Arc<Binding>,
    stream: TopicStream,
}

impl Subscription {
    pub(crate) fn new(mux: Multiplexer, attachment: Attachment) -> Self {
        Self {
            binding: Arc::new(Binding {
                mux,
                topic: attachment.topic,
                epoch: attachment.epoch,
                released: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
            stream: attachment.stream,
        }
    }

    /// The topic this subscription is attached to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.binding.topic
    }

    /// The topic incarnation this subscription is attached to.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.binding.epoch
    }

    /// Whether the subscription has not been released yet.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.binding.released.load(Ordering::Acquire)
    }

    /// Receive the next event.
    ///
    /// Returns `None` once the subscription is released or the topic is torn
    /// down. A consumer that falls too far behind skips the overwritten
    /// events.
    pub async fn recv(&mut self) -> Option<Arc<InboundEvent>> {
        loop {
            tokio::select! {
                biased;
                _ = self.binding.cancel.cancelled() => return None,
                result = self.stream.recv() => match result {
                    Ok(event) => return Some(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(topic = %self.binding.topic, skipped, "Consumer lagged; skipping events");
                        metrics::record_lagged(skipped);
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Release the subscription.
    ///
    /// Returns `false` if it was already released.
    pub fn unsubscribe(&self) -> bool {
        self.binding.release()
    }

    /// A handle that can release this subscription from elsewhere.
    #[must_use]
    pub fn detach_handle(&self) -> DetachHandle {
        DetachHandle {
            binding: Arc::clone(&self.binding),
        }
    }

    /// Turn the subscription into a stream of events.
    ///
    /// The stream ends when the subscription is released or the topic is
    /// torn down; dropping it releases the subscription.
    pub fn into_stream(self) -> impl Stream<Item = Arc<InboundEvent>> + Send + 'static {
        futures_util::stream::unfold(self, |mut subscription| async move {
            let event = subscription.recv().await?;
            Some((event, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.binding.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.binding.topic)
            .field("epoch", &self.binding.epoch)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Releases a [`Subscription`] from another task.
#[derive(Clone)]
pub struct DetachHandle {
    binding: Arc<Binding>,
}

impl DetachHandle {
    /// Release the subscription.
    ///
    /// Returns `false` if it was already released.
    pub fn detach(&self) -> bool {
        self.binding.release()
    }

    /// Whether the subscription was released.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.binding.released.load(Ordering::Acquire)
    }
}

impl fmt::Debug for DetachHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachHandle")
            .field("topic", &self.binding.topic)
            .field("detached", &self.is_detached())
            .finish()
    }
}
