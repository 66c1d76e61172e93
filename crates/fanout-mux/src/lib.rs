//! # fanout-mux
//!
//! Shares one transport connection across many logical topics.
//!
//! The [`Multiplexer`] reference-counts consumers per topic, issues exactly
//! one transport subscribe while a topic has consumers, and one unsubscribe
//! when the last consumer leaves. Each [`Subscription`] receives every event
//! delivered to its topic after it attached.
//!
//! ```rust,no_run
//! use fanout_mux::{MultiplexerService, MuxConfig};
//! use fanout_transport::{Identity, LoopbackTransport};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), fanout_mux::MuxError> {
//! let service = MultiplexerService::new(
//!     Arc::new(LoopbackTransport::new()),
//!     Identity::new("user-1"),
//!     MuxConfig::default(),
//! )?;
//! service.start().await?;
//!
//! let mut room = service.subscribe("room.1")?;
//! service.publish("room.1", serde_json::json!({"text": "hi"})).await?;
//! if let Some(event) = room.recv().await {
//!     println!("{}: {}", event.topic, event.payload);
//! }
//! # Ok(())
//! # }
//! ```

pub mod binding;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod multiplexer;
pub mod service;

pub use binding::{DetachHandle, Subscription};
pub use error::{MuxError, SubscriptionWarning};
pub use feed::TopicFeed;
pub use multiplexer::Multiplexer;
pub use service::{MultiplexerService, MuxConfig};
