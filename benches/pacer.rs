use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pelt::pacer::Pacer;

const RATES: [u64; 4] = [10, 1_000, 100_000, 1_000_000];

fn benchmark(c: &mut Criterion) {
    for rate in RATES {
        c.bench_with_input(
            BenchmarkId::new("usec_to_next_send", rate),
            black_box(&rate),
            |b, &rate| {
                b.iter(|| {
                    let mut pacer = Pacer::new(rate as f64 / 1_000_000.0);
                    pacer.thread_start = 1;
                    let mut total = 0u64;
                    for now in (1..100_000u64).step_by(1000) {
                        total += pacer.usec_to_next_send(now);
                        pacer.complete += 1;
                    }
                    total
                })
            },
        );
    }
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
