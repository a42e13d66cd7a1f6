use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use zastrow_collab::broadcast::BroadcastGroup;
use zastrow_collab::presence::{AwarenessUpdate, CursorColor, CursorTable, Vec2};
use zastrow_collab::protocol::RelayMessage;

fn bench_awareness_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let update = AwarenessUpdate::Cursor {
        peer_id: peer,
        position: Vec2::new(100.0, 200.0),
        color: CursorColor::from_peer(peer),
        seq: 1,
    };

    c.bench_function("awareness_encode", |b| {
        b.iter(|| {
            black_box(black_box(&update).encode().unwrap());
        })
    });
}

fn bench_awareness_decode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let update = AwarenessUpdate::Cursor {
        peer_id: peer,
        position: Vec2::new(100.0, 200.0),
        color: CursorColor::from_peer(peer),
        seq: 1,
    };
    let encoded = update.encode().unwrap();

    c.bench_function("awareness_decode", |b| {
        b.iter(|| {
            black_box(AwarenessUpdate::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_envelope_roundtrip(c: &mut Criterion) {
    let peer = Uuid::new_v4();

    c.bench_function("envelope_roundtrip", |b| {
        b.iter(|| {
            let msg = RelayMessage::awareness(
                black_box(peer),
                black_box("zastrow-homepage-cursors"),
                black_box(1),
                black_box(vec![0u8; 48]),
            );
            let encoded = msg.encode().unwrap();
            black_box(RelayMessage::decode(&encoded).unwrap());
        })
    });
}

fn bench_projection_100_peers(c: &mut Criterion) {
    let mut table = CursorTable::with_interval(Uuid::new_v4(), Duration::from_millis(0));
    for i in 0..100 {
        let peer = Uuid::new_v4();
        table.apply(&AwarenessUpdate::Cursor {
            peer_id: peer,
            position: Vec2::new(i as f32, i as f32 * 2.0),
            color: CursorColor::from_peer(peer),
            seq: 1,
        });
    }

    c.bench_function("projection_100_peers", |b| {
        b.iter(|| {
            black_box(table.remote_cursors());
        })
    });
}

fn bench_color_derivation(c: &mut Criterion) {
    let id = Uuid::new_v4();

    c.bench_function("color_from_peer", |b| {
        b.iter(|| {
            black_box(CursorColor::from_peer(black_box(id)));
        })
    });
}

fn bench_broadcast_100_peers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);

                let mut receivers = Vec::new();
                for _ in 0..100 {
                    receivers.push(group.add_peer(Uuid::new_v4()).await);
                }

                let frame = Arc::new(vec![0u8; 64]);
                let count = group.send_frame(frame);
                black_box(count);
            })
        })
    });
}

criterion_group!(
    benches,
    bench_awareness_encode,
    bench_awareness_decode,
    bench_envelope_roundtrip,
    bench_projection_100_peers,
    bench_color_derivation,
    bench_broadcast_100_peers,
);
criterion_main!(benches);
