use criterion::{black_box, BenchmarkId, Criterion, Throughput};
use criterion::{criterion_group, criterion_main};

use seqlink::ring::{Ring, RingConfig, Topology, WaitStrategy};

const MSGS_PER_ITER: u64 = 10_000;

fn ring(mirror: bool) -> Ring {
    Ring::open(RingConfig {
        name: None,
        size: 1 << 20,
        topology: Topology::Spsc,
        mirror,
        wait: WaitStrategy::BusySpin,
        ..RingConfig::default()
    })
    .expect("open ring")
}

fn bench_spsc_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring/spsc_round_trip");
    for &size in &[64_usize, 256, 1024] {
        group.throughput(Throughput::Bytes(size as u64 * MSGS_PER_ITER));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let ring = ring(true);
            let mut writer = ring.writer().expect("writer");
            let mut reader = ring.attach().expect("reader");
            let payload = vec![0u8; size];
            b.iter(|| {
                // Alternate push/shift so the ring never fills.
                for _ in 0..MSGS_PER_ITER {
                    writer.try_push_bytes(black_box(&payload)).expect("push");
                    reader
                        .recv(None, |bytes| {
                            black_box(bytes.len());
                        })
                        .expect("recv");
                }
            });
        });
    }
    group.finish();
}

fn bench_wrap_records_vs_mirror(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring/wrap_handling");
    for &(label, mirror) in &[("mirror", true), ("wrap_records", false)] {
        group.bench_with_input(BenchmarkId::from_parameter(label), &mirror, |b, &mirror| {
            let ring = ring(mirror);
            let mut writer = ring.writer().expect("writer");
            let mut reader = ring.attach().expect("reader");
            // Frame size chosen to wrap often.
            let payload = vec![0u8; 1000];
            b.iter(|| {
                for _ in 0..MSGS_PER_ITER {
                    writer.try_push_bytes(black_box(&payload)).expect("push");
                    reader
                        .recv(None, |bytes| {
                            black_box(bytes.len());
                        })
                        .expect("recv");
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_spsc_round_trip, bench_wrap_records_vs_mirror);
criterion_main!(benches);
