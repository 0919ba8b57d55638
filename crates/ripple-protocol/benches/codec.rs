//! Codec benchmarks for ripple-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ripple_protocol::{codec, Format, Message, PresenceAction, PresenceMessage, ProtocolMessage};

fn publish_envelope(size: usize) -> ProtocolMessage {
    let payload = serde_json::Value::String("x".repeat(size));
    ProtocolMessage::message("test", vec![Message::new("event", payload)])
}

fn bench_encode_small(c: &mut Criterion) {
    let msg = publish_envelope(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("msgpack_64B", |b| {
        b.iter(|| codec::encode(black_box(&msg), Format::MsgPack))
    });
    group.bench_function("json_64B", |b| {
        b.iter(|| codec::encode(black_box(&msg), Format::Json))
    });
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let msg = publish_envelope(64);
    let encoded = codec::encode(&msg, Format::MsgPack).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("msgpack_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded), Format::MsgPack))
    });
    group.finish();
}

fn bench_presence_sync_page(c: &mut Criterion) {
    let members = (0..100)
        .map(|i| {
            PresenceMessage::new(PresenceAction::Present, format!("client-{i}"))
                .with_connection_id(format!("conn-{i}"))
                .with_id(format!("conn-{i}:0:0"))
        })
        .collect();
    let mut msg = ProtocolMessage::presence("test:channel:room", members);
    msg.action = ripple_protocol::Action::Sync;

    c.bench_function("roundtrip_sync_100_members", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&msg), Format::MsgPack).unwrap();
            codec::decode(black_box(&encoded), Format::MsgPack).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_small,
    bench_decode_small,
    bench_presence_sync_page
);
criterion_main!(benches);
