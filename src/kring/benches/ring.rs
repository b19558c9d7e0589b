use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kring::{sim::SimKernel, Builder, SubmissionEntry};

fn submit_reap(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_reap");

    for batch in [1u32, 16, 256] {
        let mut ring = Builder::new(256).build_with(SimKernel::new()).unwrap();
        group.throughput(Throughput::Elements(batch as u64));

        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                let sq = ring.submission();
                for tag in 0..batch {
                    sq.push(SubmissionEntry::nop().user_data(tag as u64)).unwrap();
                }
                ring.flush().unwrap();

                let sum: u64 = ring.reap().map(|cqe| cqe.user_data()).sum();
                black_box(sum)
            })
        });
    }

    group.finish();
}

fn push_only(c: &mut Criterion) {
    let mut ring = Builder::new(4096).build_with(SimKernel::new()).unwrap();

    c.bench_function("push_sync", |b| {
        b.iter(|| {
            let sq = ring.submission();
            if sq.is_full() {
                ring.flush().unwrap();
                ring.reap().for_each(drop);
            }
            black_box(ring.submit(SubmissionEntry::nop()).unwrap())
        })
    });
}

criterion_group!(benches, submit_reap, push_only);
criterion_main!(benches);
