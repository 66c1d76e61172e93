//! Multiplexer instrumentation.
//!
//! Uses the `metrics` facade; the embedding binary decides whether and where
//! to export.

use fanout_core::RegistryStats;
use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const TRANSPORT_SUBSCRIBES_TOTAL: &str = "fanout_transport_subscribes_total";
    pub const TRANSPORT_UNSUBSCRIBES_TOTAL: &str = "fanout_transport_unsubscribes_total";
    pub const TOPICS_ACTIVE: &str = "fanout_topics_active";
    pub const CONSUMERS_ACTIVE: &str = "fanout_consumers_active";
    pub const EVENTS_DISPATCHED_TOTAL: &str = "fanout_events_dispatched_total";
    pub const EVENTS_DROPPED_TOTAL: &str = "fanout_events_dropped_total";
    pub const EVENTS_LAGGED_TOTAL: &str = "fanout_events_lagged_total";
    pub const PUBLISHES_TOTAL: &str = "fanout_publishes_total";
    pub const WARNINGS_TOTAL: &str = "fanout_warnings_total";
}

/// Register metric descriptions with the installed recorder.
pub fn describe() {
    metrics::describe_counter!(
        names::TRANSPORT_SUBSCRIBES_TOTAL,
        "Transport-level subscribe requests accepted"
    );
    metrics::describe_counter!(
        names::TRANSPORT_UNSUBSCRIBES_TOTAL,
        "Transport-level unsubscribe requests accepted"
    );
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Current number of live topics");
    metrics::describe_gauge!(
        names::CONSUMERS_ACTIVE,
        "Current number of attached consumers"
    );
    metrics::describe_counter!(
        names::EVENTS_DISPATCHED_TOTAL,
        "Inbound events delivered to a topic stream"
    );
    metrics::describe_counter!(
        names::EVENTS_DROPPED_TOTAL,
        "Inbound events for topics with no live entry"
    );
    metrics::describe_counter!(
        names::EVENTS_LAGGED_TOTAL,
        "Events skipped by consumers that fell behind"
    );
    metrics::describe_counter!(names::PUBLISHES_TOTAL, "Publish calls by result");
    metrics::describe_counter!(names::WARNINGS_TOTAL, "Subscription warnings by kind");
}

pub(crate) fn record_transport_subscribe() {
    counter!(names::TRANSPORT_SUBSCRIBES_TOTAL).increment(1);
}

pub(crate) fn record_transport_unsubscribe() {
    counter!(names::TRANSPORT_UNSUBSCRIBES_TOTAL).increment(1);
}

pub(crate) fn record_registry(stats: RegistryStats) {
    gauge!(names::TOPICS_ACTIVE).set(stats.topic_count as f64);
    gauge!(names::CONSUMERS_ACTIVE).set(stats.consumer_count as f64);
}

pub(crate) fn record_dispatched() {
    counter!(names::EVENTS_DISPATCHED_TOTAL).increment(1);
}

pub(crate) fn record_dropped() {
    counter!(names::EVENTS_DROPPED_TOTAL).increment(1);
}

pub(crate) fn record_lagged(skipped: u64) {
    counter!(names::EVENTS_LAGGED_TOTAL).increment(skipped);
}

pub(crate) fn record_publish(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!(names::PUBLISHES_TOTAL, "result" => result).increment(1);
}

pub(crate) fn record_warning(kind: &'static str) {
    counter!(names::WARNINGS_TOTAL, "kind" => kind).increment(1);
}
