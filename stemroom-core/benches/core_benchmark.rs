use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use stemroom_core::history::TrackHistory;
use stemroom_core::{
    ChangeOrigin, Identity, SessionClaims, SharedDocument, Stem, TokenCodec, TokenSecret,
};

fn bench_token_issue(c: &mut Criterion) {
    let codec = TokenCodec::new(TokenSecret::new("bench-secret"));
    let claims = SessionClaims::new("42", "alice", 1_700_000_000, 3600);

    c.bench_function("token_issue", |b| {
        b.iter(|| black_box(codec.issue(black_box(&claims)).unwrap()))
    });
}

fn bench_token_verify(c: &mut Criterion) {
    let codec = TokenCodec::new(TokenSecret::new("bench-secret"));
    let token = codec
        .issue(&SessionClaims::new("42", "alice", 1_700_000_000, 3600))
        .unwrap();

    c.bench_function("token_verify", |b| {
        b.iter(|| black_box(codec.verify_at(black_box(&token), 1_700_000_100).unwrap()))
    });
}

fn bench_add_stem_100(c: &mut Criterion) {
    c.bench_function("history_add_100_stems", |b| {
        b.iter(|| {
            let doc = SharedDocument::new();
            let history = TrackHistory::with_author(&doc, Identity::new("1", "alice"));
            history.initialize_if_empty().unwrap();
            for i in 0..100 {
                history.add_stem(Stem::new(format!("Stem {i}"), "u")).unwrap();
            }
            black_box(doc.encode_state());
        })
    });
}

fn bench_apply_remote_update(c: &mut Criterion) {
    let source = SharedDocument::new();
    let history = TrackHistory::new(&source);
    history.initialize_if_empty().unwrap();
    for i in 0..20 {
        history.add_stem(Stem::new(format!("Stem {i}"), "u")).unwrap();
    }
    let state = source.encode_state();

    c.bench_function("document_apply_full_state", |b| {
        b.iter(|| {
            let replica = SharedDocument::new();
            replica
                .apply_update(black_box(&state), ChangeOrigin::Remote(None))
                .unwrap();
            black_box(replica);
        })
    });
}

criterion_group!(
    benches,
    bench_token_issue,
    bench_token_verify,
    bench_add_stem_100,
    bench_apply_remote_update,
);
criterion_main!(benches);
