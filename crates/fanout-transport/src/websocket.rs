//! WebSocket transport implementation.
//!
//! This module provides a WebSocket client transport using tokio-tungstenite.
//! One socket carries every topic; subscription control travels as frames on
//! that socket.

use async_trait::async_trait;
use bytes::BytesMut;
use fanout_protocol::{codec, ClientFrame, EncodedFrame, Encoding, ServerFrame};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::dispatcher::EventDispatcher;
use crate::traits::{
    ConnectionError, ConnectionHandle, EventHandler, Identity, PublishAck, PublishError, Transport,
    TransportError, TransportEvent,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), String>>>>>;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Server URL (`ws://` or `wss://`).
    pub url: Option<String>,
    /// Frame encoding.
    pub encoding: Encoding,
    /// Query parameter carrying the identity.
    pub identity_param: String,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Wait this long for a publish acknowledgment; `None` treats a written
    /// frame as acknowledged.
    pub publish_ack_timeout: Option<Duration>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: None,
            encoding: Encoding::Json,
            identity_param: "uuid".to_string(),
            max_message_size: 64 * 1024, // 64 KB
            publish_ack_timeout: None,
        }
    }
}

impl WebSocketConfig {
    /// Create a configuration for a server URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }
}

/// A frame queued for the writer task.
struct Outbound {
    message: Message,
    written: Option<oneshot::Sender<Result<(), String>>>,
}

impl Outbound {
    fn fire(message: Message) -> Self {
        Self {
            message,
            written: None,
        }
    }
}

/// The live socket behind a [`WebSocketTransport`].
struct WebSocketConnection {
    handle: ConnectionHandle,
    outbound: mpsc::UnboundedSender<Outbound>,
    is_open: Arc<AtomicBool>,
    pending: PendingAcks,
}

impl WebSocketConnection {
    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }
}

/// WebSocket client transport.
pub struct WebSocketTransport {
    config: WebSocketConfig,
    dispatcher: Arc<EventDispatcher>,
    connect_lock: tokio::sync::Mutex<()>,
    connection: RwLock<Option<Arc<WebSocketConnection>>>,
    next_publish_id: AtomicU64,
}

impl WebSocketTransport {
    /// Create a new, unconnected WebSocket transport.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self {
            config,
            dispatcher: Arc::new(EventDispatcher::new()),
            connect_lock: tokio::sync::Mutex::new(()),
            connection: RwLock::new(None),
            next_publish_id: AtomicU64::new(1),
        }
    }

    fn active(&self) -> Option<Arc<WebSocketConnection>> {
        self.connection
            .read()
            .ok()?
            .as_ref()
            .filter(|conn| conn.is_open())
            .cloned()
    }

    fn send_frame(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        let conn = self.active().ok_or(TransportError::NotConnected)?;
        let message = self
            .config
            .encoding
            .encode(frame)
            .map(to_message)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        conn.outbound
            .send(Outbound::fire(message))
            .map_err(|_| TransportError::NotConnected)?;

        debug!(action = frame.action(), topic = %frame.channel(), "Queued control frame");
        Ok(())
    }
}

fn to_message(frame: EncodedFrame) -> Message {
    match frame {
        EncodedFrame::Text(text) => Message::Text(text),
        EncodedFrame::Binary(data) => Message::Binary(data.to_vec()),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn connect(&self, identity: &Identity) -> Result<ConnectionHandle, ConnectionError> {
        let _guard = self.connect_lock.lock().await;

        if let Some(conn) = self.active() {
            debug!("WebSocket already connected");
            return Ok(conn.handle.clone());
        }

        let base = self
            .config
            .url
            .as_deref()
            .ok_or(ConnectionError::MissingConfig("websocket url"))?;
        if identity.is_empty() {
            return Err(ConnectionError::MissingCredentials("identity"));
        }

        let mut url = Url::parse(base).map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair(&self.config.identity_param, identity.as_str());

        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|e| {
            error!("WebSocket handshake failed: {}", e);
            ConnectionError::Handshake(e.to_string())
        })?;

        let (sink, stream) = ws_stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let is_open = Arc::new(AtomicBool::new(true));
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(write_loop(sink, outbound_rx, Arc::clone(&is_open)));
        tokio::spawn(
            Reader {
                dispatcher: Arc::clone(&self.dispatcher),
                outbound: outbound.clone(),
                pending: Arc::clone(&pending),
                is_open: Arc::clone(&is_open),
                max_message_size: self.config.max_message_size,
            }
            .run(stream),
        );

        let handle = ConnectionHandle::new(identity.clone(), self.name());
        let conn = Arc::new(WebSocketConnection {
            handle: handle.clone(),
            outbound,
            is_open,
            pending,
        });
        if let Ok(mut slot) = self.connection.write() {
            *slot = Some(conn);
        }

        info!(url = %base, identity = %identity, "WebSocket connected");
        Ok(handle)
    }

    fn is_connected(&self) -> bool {
        self.active().is_some()
    }

    fn send_subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.send_frame(&ClientFrame::subscribe(topic))
    }

    fn send_unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.send_frame(&ClientFrame::unsubscribe(topic))
    }

    fn on_event(&self, handler: EventHandler) -> Result<(), TransportError> {
        self.dispatcher.register(handler)
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<PublishAck, PublishError> {
        let conn = self.active().ok_or(PublishError::NotConnected)?;

        let ack_timeout = self.config.publish_ack_timeout;
        let id = ack_timeout.map(|_| self.next_publish_id.fetch_add(1, Ordering::Relaxed));
        let frame = match id {
            Some(id) => ClientFrame::publish_with_ack(id, topic, payload),
            None => ClientFrame::publish(topic, payload),
        };
        let message = to_message(self.config.encoding.encode(&frame)?);

        let ack_rx = id.map(|id| {
            let (tx, rx) = oneshot::channel();
            if let Ok(mut pending) = conn.pending.lock() {
                pending.insert(id, tx);
            }
            (id, rx)
        });
        let forget = |id: u64| {
            if let Ok(mut pending) = conn.pending.lock() {
                pending.remove(&id);
            }
        };

        let (written_tx, written_rx) = oneshot::channel();
        let queued = conn.outbound.send(Outbound {
            message,
            written: Some(written_tx),
        });
        if queued.is_err() {
            if let Some((id, _)) = &ack_rx {
                forget(*id);
            }
            return Err(PublishError::NotConnected);
        }

        let written = written_rx
            .await
            .map_err(|_| PublishError::NotConnected)?
            .map_err(PublishError::Send);
        if let Err(e) = written {
            if let Some((id, _)) = &ack_rx {
                forget(*id);
            }
            return Err(e);
        }

        if let (Some((id, rx)), Some(timeout)) = (ack_rx, ack_timeout) {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(reason))) => return Err(PublishError::Rejected(reason)),
                Ok(Err(_)) => return Err(PublishError::NotConnected),
                Err(_) => {
                    forget(id);
                    warn!(topic = %topic, id, "Publish acknowledgment timed out");
                    return Err(PublishError::Timeout);
                }
            }
        }

        Ok(PublishAck::default())
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    is_open: Arc<AtomicBool>,
) {
    while let Some(Outbound { message, written }) = outbound.recv().await {
        let result = sink.send(message).await.map_err(|e| e.to_string());
        let failed = result.is_err();
        if let Err(e) = &result {
            warn!(error = %e, "WebSocket send failed");
        }
        if let Some(written) = written {
            let _ = written.send(result);
        }
        if failed {
            is_open.store(false, Ordering::SeqCst);
            break;
        }
    }

    if let Err(e) = sink.close().await {
        debug!(error = %e, "WebSocket close failed");
    }
}

/// Reads the socket and translates it into transport events.
struct Reader {
    dispatcher: Arc<EventDispatcher>,
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: PendingAcks,
    is_open: Arc<AtomicBool>,
    max_message_size: usize,
}

impl Reader {
    async fn run(self, mut stream: SplitStream<WsStream>) {
        let mut read_buffer = BytesMut::with_capacity(4096);

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if self.oversized(text.len()) {
                        continue;
                    }
                    match codec::decode_json::<ServerFrame>(&text) {
                        Ok(frame) => self.handle_frame(frame),
                        Err(e) => warn!(error = %e, "Ignoring malformed text frame"),
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if self.oversized(data.len()) {
                        continue;
                    }
                    read_buffer.extend_from_slice(&data);
                    loop {
                        match codec::decode_from::<ServerFrame>(&mut read_buffer) {
                            Ok(Some(frame)) => self.handle_frame(frame),
                            Ok(None) => break,
                            Err(e) => {
                                warn!(error = %e, "Discarding undecodable binary data");
                                read_buffer.clear();
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = self.outbound.send(Outbound::fire(Message::Pong(data)));
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    break;
                }
                Some(Err(WsError::ConnectionClosed)) | None => {
                    debug!("WebSocket stream ended");
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    self.dispatcher.emit(TransportEvent::Error(e.to_string()));
                    break;
                }
            }
        }

        self.is_open.store(false, Ordering::SeqCst);
        if let Ok(mut pending) = self.pending.lock() {
            for (_, waiter) in pending.drain() {
                let _ = waiter.send(Err("connection closed".to_string()));
            }
        }
        info!("WebSocket connection closed");
        self.dispatcher.emit(TransportEvent::Closed);
    }

    fn oversized(&self, len: usize) -> bool {
        if len > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                len, self.max_message_size
            );
            return true;
        }
        false
    }

    fn handle_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Event(envelope) => {
                self.dispatcher.emit(TransportEvent::Message(envelope.into()));
            }
            ServerFrame::Ack { ack } => {
                if let Some(waiter) = self.take_pending(ack) {
                    let _ = waiter.send(Ok(()));
                }
            }
            ServerFrame::Error { error, id } => {
                match id.and_then(|id| self.take_pending(id)) {
                    Some(waiter) => {
                        let _ = waiter.send(Err(error));
                    }
                    None => {
                        warn!(error = %error, "Server reported an error");
                        self.dispatcher.emit(TransportEvent::Error(error));
                    }
                }
            }
        }
    }

    fn take_pending(&self, id: u64) -> Option<oneshot::Sender<Result<(), String>>> {
        self.pending.lock().ok()?.remove(&id)
    }
}
