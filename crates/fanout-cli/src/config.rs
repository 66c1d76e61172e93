//! Client configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file given with `--config`
//! - `fanout.toml`, `/etc/fanout/fanout.toml` or `~/.config/fanout/fanout.toml`
//! - Environment variables (`FANOUT_*`, `PUBNUB_*`) as defaults

use anyhow::{bail, Context, Result};
use fanout_mux::MuxConfig;
use fanout_protocol::Encoding;
use fanout_transport::{
    Identity, PubNubConfig, PubNubTransport, SseConfig, SseTransport, Transport, WebSocketConfig,
    WebSocketTransport,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Identity presented when connecting.
    #[serde(default = "default_identity")]
    pub identity: Option<String>,

    /// Topics to subscribe to at startup.
    #[serde(default)]
    pub topics: Vec<String>,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Registry configuration.
    #[serde(default)]
    pub registry: MuxConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Status endpoint configuration.
    #[serde(default)]
    pub status: StatusConfig,
}

/// Which adapter carries the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Raw WebSocket.
    #[default]
    WebSocket,
    /// Server-Sent Events.
    Sse,
    /// PubNub REST API.
    PubNub,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::WebSocket),
            "sse" => Ok(Self::Sse),
            "pubnub" => Ok(Self::PubNub),
            other => bail!("Unknown transport: {}", other),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::WebSocket => "websocket",
            Self::Sse => "sse",
            Self::PubNub => "pubnub",
        };
        f.write_str(name)
    }
}

/// Transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Adapter to use.
    #[serde(default = "default_transport_kind")]
    pub kind: TransportKind,

    /// WebSocket or event stream URL.
    #[serde(default)]
    pub url: Option<String>,

    /// SSE publish endpoint.
    #[serde(default)]
    pub publish_url: Option<String>,

    /// WebSocket frame encoding.
    #[serde(default)]
    pub encoding: Encoding,

    /// Maximum inbound WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Wait this long for WebSocket publish acknowledgments.
    #[serde(default)]
    pub publish_ack_timeout_ms: Option<u64>,

    /// PubNub settings.
    #[serde(default)]
    pub pubnub: PubNubSettings,
}

/// PubNub settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PubNubSettings {
    /// REST origin.
    #[serde(default = "default_pubnub_origin")]
    pub origin: String,

    /// Publish key.
    #[serde(default = "default_publish_key")]
    pub publish_key: Option<String>,

    /// Subscribe key.
    #[serde(default = "default_subscribe_key")]
    pub subscribe_key: Option<String>,

    /// Delay before a failed poll is retried, in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Exporter port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Status endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    /// Serve `/health` and `/topics`.
    #[serde(default)]
    pub enabled: bool,

    /// Host to bind to.
    #[serde(default = "default_status_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_status_port")]
    pub port: u16,
}

// Default value functions
fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn default_identity() -> Option<String> {
    env_var("FANOUT_IDENTITY")
}

fn default_transport_kind() -> TransportKind {
    env_var("FANOUT_TRANSPORT")
        .and_then(|kind| kind.parse().ok())
        .unwrap_or_default()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_pubnub_origin() -> String {
    fanout_transport::pubnub::DEFAULT_ORIGIN.to_string()
}

fn default_publish_key() -> Option<String> {
    env_var("PUBNUB_PUBLISH_KEY")
}

fn default_subscribe_key() -> Option<String> {
    env_var("PUBNUB_SUBSCRIBE_KEY")
}

fn default_retry_delay() -> u64 {
    1_000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_status_host() -> String {
    "127.0.0.1".to_string()
}

fn default_status_port() -> u16 {
    8080
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: default_transport_kind(),
            url: None,
            publish_url: None,
            encoding: Encoding::default(),
            max_message_size: default_max_message_size(),
            publish_ack_timeout_ms: None,
            pubnub: PubNubSettings::default(),
        }
    }
}

impl Default for PubNubSettings {
    fn default() -> Self {
        Self {
            origin: default_pubnub_origin(),
            publish_key: default_publish_key(),
            subscribe_key: default_subscribe_key(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_status_host(),
            port: default_status_port(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, the default paths, or
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let config_paths = [
            "fanout.toml",
            "/etc/fanout/fanout.toml",
            "~/.config/fanout/fanout.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self {
            identity: default_identity(),
            ..Self::default()
        })
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// The identity to connect with, generated when not configured.
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.identity
            .as_deref()
            .map(Identity::from)
            .unwrap_or_else(Identity::generate)
    }

    /// Get the status endpoint address.
    ///
    /// # Errors
    ///
    /// Returns an error if the host and port do not form an address.
    pub fn status_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.status.host, self.status.port)
            .parse()
            .with_context(|| {
                format!(
                    "Invalid status address: {}:{}",
                    self.status.host, self.status.port
                )
            })
    }
}

impl TransportConfig {
    /// Build the configured transport.
    ///
    /// Missing URLs and keys are reported by `connect`, not here.
    #[must_use]
    pub fn build(&self) -> Arc<dyn Transport> {
        match self.kind {
            TransportKind::WebSocket => Arc::new(WebSocketTransport::new(WebSocketConfig {
                url: self.url.clone(),
                encoding: self.encoding,
                max_message_size: self.max_message_size,
                publish_ack_timeout: self.publish_ack_timeout_ms.map(Duration::from_millis),
                ..WebSocketConfig::default()
            })),
            TransportKind::Sse => Arc::new(SseTransport::new(SseConfig {
                url: self.url.clone(),
                publish_url: self.publish_url.clone(),
                ..SseConfig::default()
            })),
            TransportKind::PubNub => Arc::new(PubNubTransport::new(PubNubConfig {
                origin: self.pubnub.origin.clone(),
                publish_key: self.pubnub.publish_key.clone(),
                subscribe_key: self.pubnub.subscribe_key.clone(),
                retry_delay: Duration::from_millis(self.pubnub.retry_delay_ms),
            })),
        }
    }
}
