use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;

use stemroom_collab::broadcast::{BroadcastGroup, Frame};
use stemroom_collab::presence::{Awareness, AwarenessMessage, PresenceView};
use stemroom_collab::protocol::SyncMessage;
use stemroom_collab::room::TrackRoom;
use stemroom_collab::storage::{DocumentStore, StoreConfig};
use stemroom_core::{Identity, Stem, TrackOp};
use uuid::Uuid;

fn bench_update_encode(c: &mut Criterion) {
    let sender = Uuid::new_v4();
    let update = vec![0u8; 64];

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::update(
                black_box(sender),
                black_box("track-42"),
                black_box(1),
                black_box(update.clone()),
            );
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let msg = SyncMessage::update(Uuid::new_v4(), "track-42", 1, vec![0u8; 64]);
    let encoded = msg.encode().unwrap();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| black_box(SyncMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_mutation_encode(c: &mut Criterion) {
    let op = TrackOp::AddStem {
        stem: Stem::new("Guitar", "https://cdn.example/stems/guitar.wav"),
    };

    c.bench_function("mutation_encode_add_stem", |b| {
        b.iter(|| {
            let msg = SyncMessage::mutation(Uuid::nil(), "track-42", 1, black_box(&op)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let identity = Identity::new(i.to_string(), format!("user{i}"));
                    receivers.push(group.add_peer(Uuid::new_v4(), identity).await);
                }

                for i in 0..1000u64 {
                    let frame = Arc::new(Frame {
                        origin: None,
                        bytes: vec![i as u8; 64],
                    });
                    group.broadcast_frame(black_box(frame));
                }
            });
        })
    });
}

fn bench_presence_snapshot_100(c: &mut Criterion) {
    let mut awareness = Awareness::new();
    for i in 0..100 {
        awareness.join(Uuid::new_v4(), &Identity::new(i.to_string(), format!("user{i}")));
    }
    let local = Uuid::new_v4();

    c.bench_function("presence_snapshot_100_peers", |b| {
        b.iter(|| {
            let snapshot = awareness.snapshot_for(black_box(local));
            let mut view = PresenceView::new();
            view.handle(&snapshot);
            black_box(view);
        })
    });

    let msg = awareness.snapshot_for(local);
    c.bench_function("presence_snapshot_encode_100", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
    let encoded = msg.encode().unwrap();
    c.bench_function("presence_snapshot_decode_100", |b| {
        b.iter(|| black_box(AwarenessMessage::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_room_apply_op(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let author = Identity::new("1", "alice");

    c.bench_function("room_initialize_and_50_stems", |b| {
        b.iter(|| {
            rt.block_on(async {
                let room = TrackRoom::open("bench", 64, None).unwrap();
                room.apply_op(&author, TrackOp::Initialize).await.unwrap();
                for i in 0..50 {
                    let stem = Stem::new(format!("stem-{i}"), "https://cdn/s.wav");
                    room.apply_op(&author, TrackOp::AddStem { stem }).await.unwrap();
                }
                black_box(room.clock());
            });
        })
    });
}

fn bench_store_append(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let update = vec![7u8; 256];

    c.bench_function("store_append_update_256B", |b| {
        b.iter(|| black_box(store.append_update("track-42", black_box(&update)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_mutation_encode,
    bench_broadcast_1000_messages,
    bench_presence_snapshot_100,
    bench_room_apply_op,
    bench_store_append,
);
criterion_main!(benches);
