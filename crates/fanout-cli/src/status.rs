//! Status endpoint.
//!
//! Serves `/health` and `/topics` for the running multiplexer.

use anyhow::Result;
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use fanout_mux::MultiplexerService;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Debug, Serialize)]
struct TopicStatus {
    topic: String,
    consumers: usize,
    transport_subscribed: bool,
}

#[derive(Debug, Serialize)]
struct TopicsResponse {
    topic_count: usize,
    consumer_count: usize,
    topics: Vec<TopicStatus>,
}

/// Build the status router.
pub fn router(service: Arc<MultiplexerService>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/topics", get(topics_handler))
        .with_state(service)
}

/// Serve the status router until the task is dropped.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn serve(addr: SocketAddr, service: Arc<MultiplexerService>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Status endpoint listening on {}", addr);
    axum::serve(listener, router(service)).await?;
    Ok(())
}

/// Health check handler.
async fn health_handler(State(service): State<Arc<MultiplexerService>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": if service.is_connected() { "ok" } else { "disconnected" },
        "transport": service.multiplexer().transport().name(),
        "identity": service.identity(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Registry snapshot handler.
async fn topics_handler(State(service): State<Arc<MultiplexerService>>) -> impl IntoResponse {
    let registry = service.multiplexer().registry();
    let mut topics: Vec<_> = registry
        .topics()
        .into_iter()
        .map(|topic| TopicStatus {
            consumers: registry.consumer_count(&topic),
            transport_subscribed: registry.is_transport_subscribed(&topic),
            topic,
        })
        .collect();
    topics.sort_by(|a, b| a.topic.cmp(&b.topic));

    let stats = service.stats();
    Json(TopicsResponse {
        topic_count: stats.topic_count,
        consumer_count: stats.consumer_count,
        topics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_mux::MuxConfig;
    use fanout_transport::{Identity, LoopbackTransport};
    use serde_json::Value;

    async fn get_json(addr: SocketAddr, path: &str) -> Value {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        serde_json::from_str(body).unwrap()
    }

    #[tokio::test]
    async fn test_status_routes() {
        let service = Arc::new(MultiplexerService::new(
            Arc::new(LoopbackTransport::new()),
            Identity::new("user-1"),
            MuxConfig::default(),
        )
        .unwrap());
        service.start().await.unwrap();
        let _a = service.subscribe("room.2").unwrap();
        let _b = service.subscribe("room.1").unwrap();
        let _c = service.subscribe("room.1").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&service));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let health = get_json(addr, "/health").await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["transport"], "loopback");
        assert_eq!(health["identity"], "user-1");

        let topics = get_json(addr, "/topics").await;
        assert_eq!(topics["topic_count"], 2);
        assert_eq!(topics["consumer_count"], 3);
        assert_eq!(topics["topics"][0]["topic"], "room.1");
        assert_eq!(topics["topics"][0]["consumers"], 2);
        assert_eq!(topics["topics"][0]["transport_subscribed"], true);
    }
}
