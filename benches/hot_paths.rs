//! Hot path benchmarks for profiling-driven optimization.
//!
//! Run with: `cargo bench --bench hot_paths`
//! Compare baselines: `cargo bench --bench hot_paths -- --baseline main`
//!
//! These cover the per-operation work of the transport: framing responses
//! off the read buffer, stamping requests, hashing keys to vbuckets, and
//! tracking operations in the in-flight set.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use kvlink::io::frame::{build_frame, stamp_request, FrameCodec, MAGIC_RESPONSE};
use kvlink::io::{InFlightConfig, InFlightOperationSet};
use kvlink::operation::Operation;
use kvlink::vbucket_for_key;
use std::time::Duration;

/// Benchmark FrameCodec::parse over a buffer of back-to-back responses
fn bench_frame_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_parse");

    for body_len in [0usize, 128, 4096] {
        let frame = build_frame(MAGIC_RESPONSE, 0x00, 1, &vec![b'x'; body_len]);
        let mut batch = BytesMut::new();
        for _ in 0..64 {
            batch.extend_from_slice(&frame);
        }
        let batch = batch.freeze();
        let codec = FrameCodec::default();

        group.throughput(Throughput::Elements(64));
        group.bench_function(format!("body_{}", body_len), |b| {
            b.iter(|| {
                let mut buf = BytesMut::from(&batch[..]);
                let mut frames = 0;
                while let Ok(Some(frame)) = codec.parse(&mut buf) {
                    black_box(frame);
                    frames += 1;
                }
                black_box(frames)
            })
        });
    }

    group.finish();
}

/// Benchmark stamp_request, run once per routed attempt
fn bench_stamp_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("stamp_request");
    group.throughput(Throughput::Elements(1));

    for body_len in [16usize, 1024] {
        let request = build_frame(0x80, 0x00, 0, &vec![b'v'; body_len]);
        group.bench_function(format!("body_{}", body_len), |b| {
            b.iter(|| stamp_request(black_box(&request), black_box(513), black_box(0xdead_beef)))
        });
    }

    group.finish();
}

/// Benchmark key to vbucket hashing
fn bench_vbucket_for_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("vbucket_for_key");
    group.throughput(Throughput::Elements(1));

    let keys = [
        "short",
        "user::1001::profile",
        "this_is_a_much_longer_key_that_represents_real_world_document_ids",
    ];

    for key in keys {
        group.bench_function(format!("len_{}", key.len()), |b| {
            b.iter(|| vbucket_for_key(black_box(key.as_bytes()), black_box(1024)))
        });
    }

    group.finish();
}

/// Benchmark in-flight add followed by response lookup
fn bench_in_flight(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_flight");
    group.throughput(Throughput::Elements(1));

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    for capacity in [32usize, 1024] {
        let set = rt.block_on(async {
            InFlightOperationSet::new(InFlightConfig {
                max_operations: capacity,
                timeout: Duration::from_secs(75),
                cleanup_interval: Duration::from_secs(30),
            })
        });
        let mut opaque = 0u32;

        group.bench_function(format!("add_remove_cap_{}", capacity), |b| {
            b.to_async(&rt).iter(|| {
                opaque = opaque.wrapping_add(1);
                let (op, _result) = Operation::new(opaque, Bytes::new(), true);
                let set = set.clone();
                async move {
                    set.add(op).await.unwrap();
                    let removed = set.try_remove(opaque).unwrap();
                    black_box(removed.complete(Bytes::new()))
                }
            })
        });

        rt.block_on(async { set.dispose() });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_parse,
    bench_stamp_request,
    bench_vbucket_for_key,
    bench_in_flight,
);
criterion_main!(benches);
