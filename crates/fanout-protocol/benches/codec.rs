//! Codec benchmarks for fanout-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use fanout_protocol::{codec, ClientFrame, EventEnvelope, ServerFrame};
use serde_json::json;

fn payload(size: usize) -> serde_json::Value {
    json!({ "text": "x".repeat(size) })
}

fn bench_encode_json(c: &mut Criterion) {
    let frame = ClientFrame::publish("room.1", payload(64));

    let mut group = c.benchmark_group("encode_json");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("small_64B", |b| b.iter(|| codec::encode_json(black_box(&frame))));
    group.finish();
}

fn bench_decode_json(c: &mut Criterion) {
    let frame = ServerFrame::Event(EventEnvelope::new("room.1", payload(64)));
    let encoded = codec::encode_json(&frame).unwrap();

    let mut group = c.benchmark_group("decode_json");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("small_64B", |b| {
        b.iter(|| codec::decode_json::<ServerFrame>(black_box(&encoded)))
    });
    group.finish();
}

fn bench_msgpack_roundtrip(c: &mut Criterion) {
    let frame = ServerFrame::Event(EventEnvelope::new("room.1", payload(256)));

    c.bench_function("msgpack_roundtrip_256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode::<ServerFrame>(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_json,
    bench_decode_json,
    bench_msgpack_roundtrip
);
criterion_main!(benches);
