use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use jobq_core::{Job, WorkerId};
use jobq_store::{FileJobStore, InMemoryJobStore, JobStore};

fn seeded<S: JobStore>(store: &S, jobs: usize) {
    for i in 0..jobs {
        store
            .add_job(&Job::new(format!("echo {i}")).with_priority((i % 5) as i64))
            .unwrap();
    }
}

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue");
    for size in [10usize, 100] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("file", size), &size, |b, &size| {
            b.iter_batched(
                || tempfile::tempdir().unwrap(),
                |dir| {
                    let store = FileJobStore::open(dir.path()).unwrap();
                    seeded(&store, size);
                    black_box(dir)
                },
                BatchSize::PerIteration,
            );
        });
        group.bench_with_input(BenchmarkId::new("memory", size), &size, |b, &size| {
            b.iter(|| {
                let store = InMemoryJobStore::new();
                seeded(&store, size);
                black_box(store)
            });
        });
    }
    group.finish();
}

fn bench_acquire(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquire_next_job");
    for size in [10usize, 100] {
        group.bench_with_input(BenchmarkId::new("file", size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let dir = tempfile::tempdir().unwrap();
                    let store = FileJobStore::open(dir.path()).unwrap();
                    seeded(&store, size);
                    (dir, store)
                },
                |(dir, store)| {
                    let worker = WorkerId::new("bench");
                    while store.acquire_next_job(&worker).unwrap().is_some() {}
                    black_box(dir)
                },
                BatchSize::PerIteration,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_acquire);
criterion_main!(benches);
