//! # fanout-protocol
//!
//! Wire protocol definitions for the Fanout realtime multiplexer.
//!
//! Fanout speaks a small JSON protocol with the remote side of a socket:
//! the client sends `subscribe` / `unsubscribe` / `publish` frames tagged by
//! `action`, and the server pushes event envelopes keyed by `channel`.
//!
//! ## Frame Types
//!
//! - [`ClientFrame`] - outbound subscription control and publishes
//! - [`ServerFrame`] - inbound events, acknowledgments and errors
//!
//! ## Encodings
//!
//! - `json` - one frame per WebSocket text message
//! - `msgpack` - length-prefixed MessagePack in binary messages
//!
//! ## Example
//!
//! ```rust
//! use fanout_protocol::{codec, ClientFrame, ServerFrame};
//!
//! let frame = ClientFrame::subscribe("room.1");
//! let text = codec::encode_json(&frame).unwrap();
//! assert_eq!(text, r#"{"action":"subscribe","channel":"room.1"}"#);
//!
//! let inbound: ServerFrame =
//!     codec::decode_json(r#"{"channel":"room.1","message":{"text":"hi"}}"#).unwrap();
//! assert!(matches!(inbound, ServerFrame::Event(_)));
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode_json, encode_json, EncodedFrame, Encoding, ProtocolError};
pub use frames::{ClientFrame, EventEnvelope, ServerFrame};
