//! Server-Sent Events transport implementation.
//!
//! The server decides which topics a client receives, so subscribe and
//! unsubscribe requests put nothing on the wire. Every `message` event's data
//! is a JSON envelope naming its topic. Publishing goes through an optional
//! HTTP endpoint.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use fanout_protocol::{codec, ClientFrame, EventEnvelope};
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, Url};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::dispatcher::EventDispatcher;
use crate::traits::{
    ConnectionError, ConnectionHandle, EventHandler, Identity, PublishAck, PublishError, Transport,
    TransportError, TransportEvent,
};

/// SSE transport configuration.
#[derive(Debug, Clone)]
pub struct SseConfig {
    /// Event stream URL.
    pub url: Option<String>,
    /// Endpoint accepting `POST`ed publish frames.
    pub publish_url: Option<String>,
    /// Query parameter carrying the identity.
    pub identity_param: String,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            url: None,
            publish_url: None,
            identity_param: "uuid".to_string(),
        }
    }
}

impl SseConfig {
    /// Create a configuration for an event stream URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }
}

struct SseConnection {
    handle: ConnectionHandle,
    is_open: Arc<AtomicBool>,
}

/// Server-Sent Events client transport.
pub struct SseTransport {
    config: SseConfig,
    client: Client,
    dispatcher: Arc<EventDispatcher>,
    connect_lock: tokio::sync::Mutex<()>,
    connection: RwLock<Option<Arc<SseConnection>>>,
}

impl SseTransport {
    /// Create a new, unconnected SSE transport.
    #[must_use]
    pub fn new(config: SseConfig) -> Self {
        Self::with_client(config, Client::new())
    }

    /// Create a transport that uses an existing HTTP client.
    #[must_use]
    pub fn with_client(config: SseConfig, client: Client) -> Self {
        Self {
            config,
            client,
            dispatcher: Arc::new(EventDispatcher::new()),
            connect_lock: tokio::sync::Mutex::new(()),
            connection: RwLock::new(None),
        }
    }

    fn active(&self) -> Option<Arc<SseConnection>> {
        self.connection
            .read()
            .ok()?
            .as_ref()
            .filter(|conn| conn.is_open.load(Ordering::SeqCst))
            .cloned()
    }

    fn require_connection(&self, topic: &str, action: &'static str) -> Result<(), TransportError> {
        self.active().ok_or(TransportError::NotConnected)?;
        trace!(topic = %topic, action, "Topic membership is managed by the server");
        Ok(())
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn name(&self) -> &'static str {
        "sse"
    }

    async fn connect(&self, identity: &Identity) -> Result<ConnectionHandle, ConnectionError> {
        let _guard = self.connect_lock.lock().await;

        if let Some(conn) = self.active() {
            debug!("SSE already connected");
            return Ok(conn.handle.clone());
        }

        let base = self
            .config
            .url
            .as_deref()
            .ok_or(ConnectionError::MissingConfig("sse url"))?;
        if identity.is_empty() {
            return Err(ConnectionError::MissingCredentials("identity"));
        }

        let mut url = Url::parse(base).map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair(&self.config.identity_param, identity.as_str());

        let response = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| {
                error!("SSE handshake failed: {}", e);
                ConnectionError::Handshake(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(ConnectionError::Rejected(format!(
                "HTTP {}",
                response.status()
            )));
        }

        let is_open = Arc::new(AtomicBool::new(true));
        let dispatcher = Arc::clone(&self.dispatcher);
        let reader_open = Arc::clone(&is_open);

        tokio::spawn(async move {
            let mut events = Box::pin(response.bytes_stream().eventsource());

            while let Some(item) = events.next().await {
                match item {
                    Ok(event) if event.event == "message" => {
                        if event.data.is_empty() {
                            continue;
                        }
                        match codec::decode_json::<EventEnvelope>(&event.data) {
                            Ok(envelope) => {
                                dispatcher.emit(TransportEvent::Message(envelope.into()));
                            }
                            Err(e) => warn!(error = %e, "Ignoring malformed SSE event"),
                        }
                    }
                    Ok(event) => trace!(event = %event.event, "Ignoring named SSE event"),
                    Err(e) => {
                        error!("SSE error: {}", e);
                        dispatcher.emit(TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
            }

            reader_open.store(false, Ordering::SeqCst);
            info!("SSE stream closed");
            dispatcher.emit(TransportEvent::Closed);
        });

        let handle = ConnectionHandle::new(identity.clone(), self.name());
        if let Ok(mut slot) = self.connection.write() {
            *slot = Some(Arc::new(SseConnection {
                handle: handle.clone(),
                is_open,
            }));
        }

        info!(url = %base, identity = %identity, "SSE connected");
        Ok(handle)
    }

    fn is_connected(&self) -> bool {
        self.active().is_some()
    }

    fn send_subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.require_connection(topic, "subscribe")
    }

    fn send_unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.require_connection(topic, "unsubscribe")
    }

    fn on_event(&self, handler: EventHandler) -> Result<(), TransportError> {
        self.dispatcher.register(handler)
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<PublishAck, PublishError> {
        self.active().ok_or(PublishError::NotConnected)?;
        let publish_url = self
            .config
            .publish_url
            .as_deref()
            .ok_or(PublishError::Unsupported("sse transport has no publish endpoint"))?;

        let response = self
            .client
            .post(publish_url)
            .json(&ClientFrame::publish(topic, payload))
            .send()
            .await
            .map_err(|e| PublishError::Send(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PublishError::Rejected(format!("HTTP {}", status)));
        }

        debug!(topic = %topic, "Published over HTTP");
        Ok(PublishAck::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_requires_url() {
        let transport = SseTransport::new(SseConfig::default());
        assert!(matches!(
            transport.connect(&Identity::new("user-1")).await,
            Err(ConnectionError::MissingConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_membership_requires_connection() {
        let transport = SseTransport::new(SseConfig::new("http://127.0.0.1:9/events"));
        assert!(matches!(
            transport.send_subscribe("room.1"),
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            transport.send_unsubscribe("room.1"),
            Err(TransportError::NotConnected)
        ));
    }
}
