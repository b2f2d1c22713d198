//! Throughput Benchmark for pdnsgate
//!
//! This benchmark measures the wire codec and the in-memory backend
//! under various workloads.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use pdnsgate::protocol::{
    encode_message, encode_stream_entry, DecodeLimits, Decoder, Entry, InputRequest,
    ProtocolMessage, QueryRequest, ResponseFrame,
};
use pdnsgate::MemoryBackend;
use std::sync::Arc;
use std::time::Duration;

const SCRATCH: usize = 64 * 1024;

fn observation(i: u64) -> Entry {
    Entry::new(
        "sensor-1",
        format!("host{}.example.com", i),
        "A",
        format!("192.0.2.{}", i % 256),
        1,
        1_600_000_000 + i,
        1_600_000_000 + i,
    )
}

/// Benchmark frame encoding
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));

    group.bench_function("input_request", |b| {
        let msg = ProtocolMessage::Input(InputRequest {
            entry: observation(1),
        });
        let mut buf = BytesMut::with_capacity(SCRATCH);
        b.iter(|| {
            black_box(encode_message(&msg, &mut buf, SCRATCH).unwrap());
        });
    });

    group.bench_function("stream_entry_large_rdata", |b| {
        let mut entry = observation(1);
        entry.rdata = Bytes::from("x".repeat(4096)); // 4KB TXT-style rdata
        let mut buf = BytesMut::with_capacity(SCRATCH);
        b.iter(|| {
            black_box(encode_stream_entry(&entry, &mut buf, SCRATCH).unwrap());
        });
    });

    group.finish();
}

/// Benchmark bounded decoding
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));

    let mut input = BytesMut::new();
    encode_message(
        &ProtocolMessage::Input(InputRequest {
            entry: observation(7),
        }),
        &mut input,
        SCRATCH,
    )
    .unwrap();

    group.bench_function("input_request", |b| {
        let mut decoder = Decoder::new(DecodeLimits::default());
        b.iter(|| {
            let (value, _) = decoder.parse(&input).unwrap().unwrap();
            black_box(ProtocolMessage::from_value(&value).unwrap());
        });
    });

    let mut entry = BytesMut::new();
    encode_stream_entry(&observation(9), &mut entry, SCRATCH).unwrap();

    group.bench_function("stream_entry", |b| {
        let mut decoder = Decoder::new(DecodeLimits::default());
        b.iter(|| {
            let (value, _) = decoder.parse(&entry).unwrap().unwrap();
            black_box(ResponseFrame::from_value(&value).unwrap());
        });
    });

    group.finish();
}

/// Benchmark backend ingestion
fn bench_insert(c: &mut Criterion) {
    let backend = Arc::new(MemoryBackend::new());

    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(1));

    group.bench_function("insert_new", |b| {
        let mut i = 0u64;
        b.iter(|| {
            backend.insert(observation(i));
            i += 1;
        });
    });

    group.bench_function("insert_merge", |b| {
        let mut i = 0u64;
        b.iter(|| {
            backend.insert(observation(i % 1_000));
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark backend queries
fn bench_find(c: &mut Criterion) {
    let backend = Arc::new(MemoryBackend::new());

    // Pre-populate with data
    for i in 0..100_000 {
        backend.insert(observation(i));
    }

    let mut group = c.benchmark_group("find");

    group.bench_function("by_rrname", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let query = QueryRequest::by_rrname(format!("host{}.example.com", i % 100_000));
            black_box(backend.find(&query));
            i += 1;
        });
    });

    group.bench_function("full_scan_limited", |b| {
        let query = QueryRequest {
            rrtype: Some(Bytes::from("A")),
            ..Default::default()
        }
        .with_limit(100);
        b.iter(|| {
            black_box(backend.find(&query));
        });
    });

    group.finish();
}

/// Benchmark concurrent ingestion
fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_insert", |b| {
        b.iter(|| {
            let backend = Arc::new(MemoryBackend::new());
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let backend = Arc::clone(&backend);
                    thread::spawn(move || {
                        for i in 0..10_000 {
                            backend.insert(observation(t * 10_000 + i));
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(backend.len());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_insert,
    bench_find,
    bench_concurrent,
);

criterion_main!(benches);
