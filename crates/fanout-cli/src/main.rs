//! # Fanout
//!
//! Command-line client for the Fanout channel multiplexer.
//!
//! ## Usage
//!
//! ```bash
//! # Subscribe to two topics over the configured transport
//! fanout room.1 room.2
//!
//! # Run with a custom config
//! fanout --config /path/to/fanout.toml
//!
//! # Publish by writing `<topic> <json>` lines to stdin
//! echo 'room.1 {"text":"hi"}' | FANOUT_TRANSPORT=sse fanout room.1
//! ```
//!
//! Every inbound event is printed to stdout as one JSON line. Logs go to
//! stderr.

mod config;
mod console;
mod metrics;
mod status;

use anyhow::{Context, Result};
use clap::Parser;
use fanout_mux::{DetachHandle, MultiplexerService};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fanout", version, about = "Subscribe and publish over one multiplexed connection")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, env = "FANOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Topics to subscribe to, in addition to the configured ones.
    topics: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; stdout is reserved for events
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fanout=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = config::Config::load(cli.config.as_deref())?;
    config.topics.extend(cli.topics);

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let service = Arc::new(
        MultiplexerService::new(
            config.transport.build(),
            config.identity(),
            config.registry.clone(),
        )
        .context("Invalid [registry] configuration")?,
    );

    info!(
        transport = %config.transport.kind,
        identity = %service.identity(),
        "Starting fanout"
    );
    service
        .start()
        .await
        .context("Failed to start multiplexer")?;

    if config.status.enabled {
        let addr = config.status_addr()?;
        let status_service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = status::serve(addr, status_service).await {
                error!("Status endpoint failed: {:#}", e);
            }
        });
    }

    let topics: BTreeSet<String> = config.topics.into_iter().collect();
    let mut bindings = Vec::with_capacity(topics.len());
    for topic in &topics {
        bindings.push(spawn_printer(&service, topic)?);
    }

    run_console(&service).await;

    // Release our own bindings first so each topic is unsubscribed once,
    // then drain anything left.
    for (handle, _) in &bindings {
        handle.detach();
    }
    service.stop();
    for (_, task) in bindings {
        let _ = task.await;
    }

    info!("Fanout stopped");
    Ok(())
}

/// Subscribe to a topic and print its events until the binding ends.
fn spawn_printer(
    service: &MultiplexerService,
    topic: &str,
) -> Result<(DetachHandle, JoinHandle<()>)> {
    let mut subscription = service
        .subscribe(topic)
        .with_context(|| format!("Failed to subscribe to {}", topic))?;
    let handle = subscription.detach_handle();

    let task = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            match console::render_event(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(topic = %event.topic, "Cannot render event: {:#}", e),
            }
        }
        debug!(topic = %subscription.topic(), "Binding ended");
    });

    Ok((handle, task))
}

/// Publish stdin lines until Ctrl-C.
async fn run_console(service: &MultiplexerService) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => publish_line(service, &line).await,
                Ok(None) => {
                    debug!("stdin closed");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }
}

async fn publish_line(service: &MultiplexerService, line: &str) {
    let (topic, payload) = match console::parse_publish_line(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("{:#}", e);
            return;
        }
    };

    match service.publish(&topic, payload).await {
        Ok(ack) => debug!(topic = %topic, timetoken = ?ack.timetoken, "Published"),
        Err(e) => error!(topic = %topic, error = %e, "Publish failed"),
    }
}
