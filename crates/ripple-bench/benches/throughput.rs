//! Throughput benchmarks for Ripple.
//!
//! These benchmarks measure presence merging and envelope coding.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ripple_bench::presence_members;
use ripple_core::PresenceMap;
use ripple_protocol::{codec, Format, Message, ProtocolMessage};

/// Benchmark applying presence updates outside a sync.
fn bench_presence_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("presence_put");

    for count in [100, 1_000, 10_000] {
        let first = presence_members(count, 1);
        let newer = presence_members(count, 2);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let mut map = PresenceMap::new();
                for member in first.iter().chain(newer.iter()) {
                    let _ = map.put(black_box(member));
                }
                map
            });
        });
    }

    group.finish();
}

/// Benchmark a two-part sync that drops half the members.
fn bench_presence_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("presence_sync");

    for count in [100, 1_000, 10_000] {
        let initial = presence_members(count, 1);
        let resync = presence_members(count / 2, 2);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let mut map = PresenceMap::new();
                for member in &initial {
                    let _ = map.put(member);
                }
                map.start_sync(Some("bench"));
                for member in &resync {
                    let _ = map.sync_put(black_box(member));
                }
                map.end_sync(black_box(3))
            });
        });
    }

    group.finish();
}

/// Benchmark envelope encoding in both wire formats.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    let messages: Vec<Message> = (0..10)
        .map(|i| Message::new("event", serde_json::json!({ "seq": i, "body": "x".repeat(64) })))
        .collect();
    let envelope = ProtocolMessage::message("bench:channel", messages);

    for format in [Format::MsgPack, Format::Json] {
        group.bench_function(format.as_param(), |b| {
            b.iter(|| codec::encode(black_box(&envelope), format))
        });
    }

    group.finish();
}

/// Benchmark envelope decoding in both wire formats.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    let presence = ProtocolMessage::presence("bench:channel", presence_members(50, 1));
    for format in [Format::MsgPack, Format::Json] {
        let encoded = codec::encode(&presence, format).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_function(format.as_param(), |b| {
            b.iter(|| codec::decode(black_box(&encoded), format))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_presence_put,
    bench_presence_sync,
    bench_encode,
    bench_decode
);
criterion_main!(benches);
