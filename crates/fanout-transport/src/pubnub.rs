//! PubNub transport over the REST API.
//!
//! One long-poll subscribe request covers every subscribed channel. Changing
//! the channel set aborts the request in flight and opens a new one with the
//! same timetoken cursor, so no message between the two polls is lost.

use async_trait::async_trait;
use fanout_core::InboundEvent;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::env;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::dispatcher::EventDispatcher;
use crate::traits::{
    ConnectionError, ConnectionHandle, EventHandler, Identity, PublishAck, PublishError, Transport,
    TransportError, TransportEvent,
};

/// Default PubNub origin.
pub const DEFAULT_ORIGIN: &str = "https://ps.pndsn.com";

/// PubNub transport configuration.
#[derive(Debug, Clone)]
pub struct PubNubConfig {
    /// REST origin.
    pub origin: String,
    /// Key used for publishing.
    pub publish_key: Option<String>,
    /// Key used for subscribing; required to connect.
    pub subscribe_key: Option<String>,
    /// Delay before a failed poll is retried.
    pub retry_delay: Duration,
}

impl Default for PubNubConfig {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            publish_key: None,
            subscribe_key: None,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl PubNubConfig {
    /// Read keys from `PUBNUB_PUBLISH_KEY` and `PUBNUB_SUBSCRIBE_KEY`.
    #[must_use]
    pub fn from_env() -> Self {
        let key = |name: &str| env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            publish_key: key("PUBNUB_PUBLISH_KEY"),
            subscribe_key: key("PUBNUB_SUBSCRIBE_KEY"),
            ..Default::default()
        }
    }
}

/// Subscribe cursor returned by each poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
struct Cursor {
    #[serde(rename = "t")]
    timetoken: String,
    #[serde(rename = "r", default)]
    region: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SubscribeResponse {
    t: Cursor,
    #[serde(default)]
    m: Vec<Envelope>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    c: String,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    i: Option<String>,
    #[serde(default)]
    p: Option<Cursor>,
}

impl From<Envelope> for InboundEvent {
    fn from(envelope: Envelope) -> Self {
        let mut event = InboundEvent::new(envelope.c, envelope.d);
        if let Some(publisher) = envelope.i {
            event = event.with_publisher(publisher);
        }
        if let Some(cursor) = envelope.p {
            event = event.with_timetoken(cursor.timetoken);
        }
        event
    }
}

/// State shared between the transport and its poll loop.
#[derive(Debug, Default)]
struct PollState {
    channels: Mutex<BTreeSet<String>>,
    changed: Notify,
}

impl PollState {
    fn channels(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> Vec<String> {
        self.channels().iter().cloned().collect()
    }
}

struct Session {
    handle: ConnectionHandle,
    state: Arc<PollState>,
    shutdown: CancellationToken,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// PubNub REST client transport.
pub struct PubNubTransport {
    config: PubNubConfig,
    client: Client,
    dispatcher: Arc<EventDispatcher>,
    connect_lock: tokio::sync::Mutex<()>,
    session: RwLock<Option<Arc<Session>>>,
}

impl PubNubTransport {
    /// Create a new, unconnected PubNub transport.
    #[must_use]
    pub fn new(config: PubNubConfig) -> Self {
        Self {
            config,
            client: Client::new(),
            dispatcher: Arc::new(EventDispatcher::new()),
            connect_lock: tokio::sync::Mutex::new(()),
            session: RwLock::new(None),
        }
    }

    fn active(&self) -> Option<Arc<Session>> {
        self.session.read().ok()?.clone()
    }

    fn spawn_leave(&self, session: &Session, channel: &str) {
        let Some(subscribe_key) = self.config.subscribe_key.as_deref() else {
            return;
        };
        let url = match leave_url(
            &self.config.origin,
            subscribe_key,
            channel,
            session.handle.identity(),
        ) {
            Ok(url) => url,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Cannot build presence leave URL");
                return;
            }
        };

        // Leave is best effort; without a runtime there is nothing to run it on.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(channel = %channel, "No runtime; skipping presence leave");
            return;
        };

        let client = self.client.clone();
        let channel = channel.to_string();
        runtime.spawn(async move {
            match client.get(url).send().await {
                Ok(response) => {
                    trace!(channel = %channel, status = %response.status(), "Presence leave sent");
                }
                Err(e) => warn!(channel = %channel, error = %e, "Presence leave failed"),
            }
        });
    }
}

fn base_url(origin: &str, segments: &[&str]) -> Result<Url, String> {
    let mut url = Url::parse(origin).map_err(|e| e.to_string())?;
    url.path_segments_mut()
        .map_err(|_| format!("origin cannot be a base: {}", origin))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn subscribe_url(
    origin: &str,
    subscribe_key: &str,
    channels: &[String],
    cursor: &Cursor,
    identity: &Identity,
) -> Result<Url, String> {
    let channels = channels.join(",");
    let mut url = base_url(origin, &["v2", "subscribe", subscribe_key, channels.as_str(), "0"])?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("tt", &cursor.timetoken);
        if let Some(region) = cursor.region {
            query.append_pair("tr", &region.to_string());
        }
        query.append_pair("uuid", identity.as_str());
    }
    Ok(url)
}

fn leave_url(
    origin: &str,
    subscribe_key: &str,
    channel: &str,
    identity: &Identity,
) -> Result<Url, String> {
    let mut url = base_url(
        origin,
        &["v2", "presence", "sub-key", subscribe_key, "channel", channel, "leave"],
    )?;
    url.query_pairs_mut().append_pair("uuid", identity.as_str());
    Ok(url)
}

fn publish_url(
    origin: &str,
    publish_key: &str,
    subscribe_key: &str,
    channel: &str,
    payload: &Value,
    identity: &Identity,
) -> Result<Url, String> {
    let message = serde_json::to_string(payload).map_err(|e| e.to_string())?;
    let mut url = base_url(
        origin,
        &["publish", publish_key, subscribe_key, "0", channel, "0", message.as_str()],
    )?;
    url.query_pairs_mut().append_pair("uuid", identity.as_str());
    Ok(url)
}

/// Parse a publish response of the form `[1, "Sent", "<timetoken>"]`.
fn parse_publish_response(body: &str) -> Result<PublishAck, PublishError> {
    let (status, description, timetoken): (i64, String, String) =
        serde_json::from_str(body).map_err(|e| PublishError::Rejected(e.to_string()))?;
    if status != 1 {
        return Err(PublishError::Rejected(description));
    }
    Ok(PublishAck {
        timetoken: Some(timetoken),
    })
}

async fn poll_once(client: &Client, url: Url) -> Result<SubscribeResponse, reqwest::Error> {
    client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json::<SubscribeResponse>()
        .await
}

struct PollLoop {
    client: Client,
    origin: String,
    subscribe_key: String,
    identity: Identity,
    retry_delay: Duration,
    state: Arc<PollState>,
    dispatcher: Arc<EventDispatcher>,
    shutdown: CancellationToken,
}

impl PollLoop {
    async fn run(self) {
        let mut cursor = Cursor {
            timetoken: "0".to_string(),
            region: None,
        };

        loop {
            let channels = self.state.snapshot();
            if channels.is_empty() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.state.changed.notified() => continue,
                }
            }

            let url = match subscribe_url(
                &self.origin,
                &self.subscribe_key,
                &channels,
                &cursor,
                &self.identity,
            ) {
                Ok(url) => url,
                Err(e) => {
                    error!(error = %e, "Cannot build subscribe URL");
                    self.dispatcher.emit(TransportEvent::Error(e));
                    break;
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.state.changed.notified() => {
                    debug!("Channel set changed; restarting long-poll");
                }
                result = poll_once(&self.client, url) => match result {
                    Ok(response) => {
                        trace!(messages = response.m.len(), "Poll returned");
                        cursor = response.t;
                        for envelope in response.m {
                            self.dispatcher
                                .emit(TransportEvent::Message(envelope.into()));
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Subscribe poll failed; retrying");
                        self.dispatcher.emit(TransportEvent::Error(e.to_string()));
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(self.retry_delay) => {}
                        }
                    }
                },
            }
        }

        debug!("PubNub poll loop stopped");
    }
}

#[async_trait]
impl Transport for PubNubTransport {
    fn name(&self) -> &'static str {
        "pubnub"
    }

    async fn connect(&self, identity: &Identity) -> Result<ConnectionHandle, ConnectionError> {
        let _guard = self.connect_lock.lock().await;

        if let Some(session) = self.active() {
            debug!("PubNub already connected");
            return Ok(session.handle.clone());
        }

        let subscribe_key = self
            .config
            .subscribe_key
            .clone()
            .ok_or(ConnectionError::MissingCredentials("subscribe_key"))?;
        if identity.is_empty() {
            return Err(ConnectionError::MissingCredentials("identity"));
        }
        Url::parse(&self.config.origin).map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;

        let state = Arc::new(PollState::default());
        let shutdown = CancellationToken::new();

        tokio::spawn(
            PollLoop {
                client: self.client.clone(),
                origin: self.config.origin.clone(),
                subscribe_key,
                identity: identity.clone(),
                retry_delay: self.config.retry_delay,
                state: Arc::clone(&state),
                dispatcher: Arc::clone(&self.dispatcher),
                shutdown: shutdown.clone(),
            }
            .run(),
        );

        let handle = ConnectionHandle::new(identity.clone(), self.name());
        if let Ok(mut slot) = self.session.write() {
            *slot = Some(Arc::new(Session {
                handle: handle.clone(),
                state,
                shutdown,
            }));
        }

        info!(origin = %self.config.origin, identity = %identity, "PubNub connected");
        Ok(handle)
    }

    fn is_connected(&self) -> bool {
        self.active().is_some()
    }

    fn send_subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let session = self.active().ok_or(TransportError::NotConnected)?;
        if session.state.channels().insert(topic.to_string()) {
            session.state.changed.notify_one();
        }
        Ok(())
    }

    fn send_unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let session = self.active().ok_or(TransportError::NotConnected)?;
        if session.state.channels().remove(topic) {
            session.state.changed.notify_one();
        }
        self.spawn_leave(&session, topic);
        Ok(())
    }

    fn on_event(&self, handler: EventHandler) -> Result<(), TransportError> {
        self.dispatcher.register(handler)
    }

    async fn publish(&self, topic: &str, payload: Value) -> Result<PublishAck, PublishError> {
        let session = self.active().ok_or(PublishError::NotConnected)?;
        let publish_key = self
            .config
            .publish_key
            .as_deref()
            .ok_or(PublishError::NotConfigured("publish_key"))?;
        let subscribe_key = self
            .config
            .subscribe_key
            .as_deref()
            .ok_or(PublishError::NotConfigured("subscribe_key"))?;

        let url = publish_url(
            &self.config.origin,
            publish_key,
            subscribe_key,
            topic,
            &payload,
            session.handle.identity(),
        )
        .map_err(PublishError::Send)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PublishError::Send(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PublishError::Send(e.to_string()))?;

        match parse_publish_response(&body) {
            Ok(ack) => {
                debug!(topic = %topic, timetoken = ?ack.timetoken, "Published");
                Ok(ack)
            }
            Err(_) if !status.is_success() => {
                Err(PublishError::Rejected(format!("HTTP {}", status)))
            }
            Err(e) => Err(e),
        }
    }
}
