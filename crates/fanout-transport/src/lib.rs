//! # fanout-transport
//!
//! Transport abstraction layer for the Fanout channel multiplexer.
//!
//! Every adapter owns exactly one physical connection and translates its
//! wire traffic into a uniform [`TransportEvent`] stream:
//!
//! - **WebSocket** - JSON or MessagePack frames over a single socket
//! - **SSE** - server-managed membership with HTTP publish
//! - **PubNub** - the PubNub REST API with long-poll subscribe
//! - **Loopback** - in-process, for embedding and tests
//!
//! ```rust,no_run
//! use fanout_transport::{Identity, LoopbackTransport, Transport};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = LoopbackTransport::new();
//! transport.connect(&Identity::new("user-1")).await?;
//! transport.send_subscribe("room.1")?;
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
pub mod loopback;
pub mod pubnub;
pub mod traits;

#[cfg(feature = "sse")]
pub mod sse;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use dispatcher::EventDispatcher;
pub use loopback::{Command, LoopbackTransport};
pub use pubnub::{PubNubConfig, PubNubTransport};
pub use traits::{
    ConnectionError, ConnectionHandle, EventHandler, Identity, PublishAck, PublishError, Transport,
    TransportError, TransportEvent,
};

#[cfg(feature = "sse")]
pub use sse::{SseConfig, SseTransport};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};
