//! Reference counting and fan-out through the public API.

use fanout_core::InboundEvent;
use fanout_mux::{MultiplexerService, MuxConfig};
use fanout_transport::{Command, Identity, LoopbackTransport};
use serde_json::json;
use std::sync::Arc;

async fn started() -> (Arc<LoopbackTransport>, Arc<MultiplexerService>) {
    let transport = Arc::new(LoopbackTransport::new());
    let service = Arc::new(MultiplexerService::new(
        transport.clone(),
        Identity::new("user-1"),
        MuxConfig::default(),
    )
    .unwrap());
    service.start().await.unwrap();
    (transport, service)
}

/// Counts subscribe and unsubscribe commands for a topic and checks that
/// they alternate, starting with a subscribe.
fn assert_alternating(commands: &[Command], topic: &str) -> (usize, usize) {
    let mut subscribed = false;
    let (mut subs, mut unsubs) = (0, 0);
    for command in commands {
        match command {
            Command::Subscribe(t) if t == topic => {
                assert!(!subscribed, "second subscribe without unsubscribe");
                subscribed = true;
                subs += 1;
            }
            Command::Unsubscribe(t) if t == topic => {
                assert!(subscribed, "unsubscribe without subscribe");
                subscribed = false;
                unsubs += 1;
            }
            _ => {}
        }
    }
    (subs, unsubs)
}

#[tokio::test]
async fn test_fan_out_preserves_order() {
    let (transport, service) = started().await;

    let mut bindings: Vec<_> = (0..4)
        .map(|_| service.subscribe("room.1").unwrap())
        .collect();

    for n in 0..10 {
        transport.inject(InboundEvent::new("room.1", json!(n)));
    }

    for binding in &mut bindings {
        for n in 0..10 {
            assert_eq!(binding.recv().await.unwrap().payload, json!(n));
        }
    }
    assert_eq!(transport.subscribe_count("room.1"), 1);
}

#[tokio::test]
async fn test_latest_message_seen_by_both_bindings() {
    let (transport, service) = started().await;
    let mut a = service.subscribe("room.1").unwrap();
    let mut b = service.subscribe("room.1").unwrap();

    transport.inject(InboundEvent::new("room.1", json!({"text": "hi"})));

    assert_eq!(a.recv().await.unwrap().payload, json!({"text": "hi"}));
    assert_eq!(b.recv().await.unwrap().payload, json!({"text": "hi"}));
}

#[tokio::test]
async fn test_bindings_on_other_topics_are_unaffected() {
    let (transport, service) = started().await;
    let mut a = service.subscribe("room.1").unwrap();
    let b = service.subscribe("room.2").unwrap();

    drop(b);
    transport.inject(InboundEvent::new("room.2", json!("gone")));
    transport.inject(InboundEvent::new("room.1", json!("here")));

    assert_eq!(a.recv().await.unwrap().payload, json!("here"));
    assert!(!service.multiplexer().registry().contains("room.2"));
    assert_eq!(transport.unsubscribe_count("room.1"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_subscribe_and_release() {
    let (transport, service) = started().await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let service = Arc::clone(&service);
        tasks.push(tokio::spawn(async move {
            for _ in 0..200 {
                let binding = service.subscribe("room.1").unwrap();
                tokio::task::yield_now().await;
                drop(binding);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let (subs, unsubs) = assert_alternating(&transport.commands(), "room.1");
    assert!(subs >= 1);
    assert_eq!(subs, unsubs);
    assert!(!service.multiplexer().registry().contains("room.1"));
    assert!(!transport.is_delivering("room.1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_subscribers_issue_one_subscribe() {
    let (transport, service) = started().await;

    let barrier = Arc::new(tokio::sync::Barrier::new(8));
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let service = Arc::clone(&service);
        let barrier = Arc::clone(&barrier);
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            service.subscribe("room.1").unwrap()
        }));
    }

    let mut bindings = Vec::new();
    for task in tasks {
        bindings.push(task.await.unwrap());
    }

    assert_eq!(transport.subscribe_count("room.1"), 1);
    assert_eq!(service.stats().consumer_count, 8);

    bindings.clear();
    assert_eq!(transport.unsubscribe_count("room.1"), 1);
}
