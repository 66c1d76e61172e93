//! Line-oriented console I/O.
//!
//! Inbound events are printed as one JSON object per line. Each stdin line
//! of the form `<topic> <json>` is published.

use anyhow::{bail, Context, Result};
use fanout_core::InboundEvent;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
struct EventLine<'a> {
    topic: &'a str,
    payload: &'a Value,
    publisher: Option<&'a str>,
}

/// Render an inbound event as a JSON line.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn render_event(event: &InboundEvent) -> Result<String> {
    let line = EventLine {
        topic: &event.topic,
        payload: &event.payload,
        publisher: event.publisher.as_deref(),
    };
    Ok(serde_json::to_string(&line)?)
}

/// Parse a `<topic> <json>` publish line.
///
/// A payload that is not valid JSON is published as a string.
///
/// # Errors
///
/// Returns an error if the line has no topic or no payload.
pub fn parse_publish_line(line: &str) -> Result<(String, Value)> {
    let line = line.trim();
    let Some((topic, payload)) = line.split_once(char::is_whitespace) else {
        bail!("Expected `<topic> <json>`, got: {}", line);
    };

    let payload = payload.trim();
    if topic.is_empty() || payload.is_empty() {
        bail!("Expected `<topic> <json>`, got: {}", line);
    }

    let payload = serde_json::from_str(payload)
        .or_else(|_| serde_json::to_value(payload))
        .context("Failed to encode payload")?;
    Ok((topic.to_string(), payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_event() {
        let event = InboundEvent::new("room.1", json!({"text": "hi"})).with_publisher("user-2");
        let line: Value = serde_json::from_str(&render_event(&event).unwrap()).unwrap();
        assert_eq!(
            line,
            json!({"topic": "room.1", "payload": {"text": "hi"}, "publisher": "user-2"})
        );
    }

    #[test]
    fn test_parse_publish_line() {
        let (topic, payload) = parse_publish_line("room.1 {\"text\": \"hi\"}").unwrap();
        assert_eq!(topic, "room.1");
        assert_eq!(payload, json!({"text": "hi"}));

        let (_, payload) = parse_publish_line("room.1   hello there  ").unwrap();
        assert_eq!(payload, json!("hello there"));

        assert!(parse_publish_line("room.1").is_err());
        assert!(parse_publish_line("   ").is_err());
    }
}
