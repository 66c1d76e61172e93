//! # fanout-core
//!
//! Core types and the topic registry for the Fanout realtime multiplexer.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Topic** - A named logical channel with a multicast stream and a
//!   live-consumer count
//! - **TopicRegistry** - Topic name to stream map, the authority on which
//!   topics are subscribed at the transport level
//! - **InboundEvent** - A message delivered by a transport for one topic
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  dispatch  ┌───────────────┐  broadcast  ┌─────────────┐
//! │  Transport  │───────────▶│ TopicRegistry │────────────▶│  Consumers  │
//! └─────────────┘            └───────────────┘             └─────────────┘
//! ```

pub mod event;
pub mod registry;
pub mod topic;

pub use event::InboundEvent;
pub use registry::{
    Attachment, RegistryConfig, RegistryError, RegistryStats, Release, TopicRegistry,
};
pub use topic::{
    validate_topic_name, Topic, TopicName, TopicStream, DEFAULT_STREAM_CAPACITY, MAX_TOPIC_NAME_LENGTH,
};
