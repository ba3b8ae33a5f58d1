use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use pgas_mem::{LocalTeam, OpenFlags, PersistentPool, PoolConfig, SharedMemoryPool, TeamAlloc, TeamId, UnitId};

const BATCH_SIZE: usize = 1000;

fn bench_shmem_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("SharedMemoryPool 1000");

    group.bench_function("alloc", |b| {
        b.iter_batched(
            || SharedMemoryPool::new(BATCH_SIZE * 64).unwrap(),
            |mut pool| {
                for _ in 0..BATCH_SIZE {
                    black_box(pool.alloc(64).unwrap());
                }
                pool
            },
            BatchSize::SmallInput,
        )
    });

    group.bench_function("alloc + free interleaved", |b| {
        b.iter_batched(
            || SharedMemoryPool::new(BATCH_SIZE * 64).unwrap(),
            |mut pool| {
                let extents: Vec<_> = (0..BATCH_SIZE).map(|i| pool.alloc(16 + (i % 48)).unwrap()).collect();
                for extent in extents.iter().step_by(2) {
                    pool.free(extent).unwrap();
                }
                for _ in 0..BATCH_SIZE / 2 {
                    black_box(pool.alloc(16).unwrap());
                }
                pool
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_pmem_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("Persistent vs shared 100 allocs");
    group.sample_size(20);

    let team = LocalTeam::new(TeamId::ALL, UnitId(0));
    for (label, sync) in [("alloc 64B synced", true), ("alloc 64B unsynced", false)] {
        group.bench_function(label, |b| {
            b.iter_batched(
                || {
                    let dir = tempfile::tempdir().unwrap();
                    let config = PoolConfig::default().with_directory(dir.path()).with_sync(sync);
                    let pool = PersistentPool::open_with(&team, "bench", OpenFlags::CREATE, 0o600, &config).unwrap();
                    (dir, pool)
                },
                |(dir, mut pool)| {
                    for _ in 0..100 {
                        black_box(pool.alloc_local(&team, 64).unwrap());
                    }
                    (dir, pool)
                },
                BatchSize::PerIteration,
            )
        });
    }

    group.bench_function("alloc_global 64B (shmem)", |b| {
        b.iter_batched(
            || {
                let team = LocalTeam::new(TeamId::ALL, UnitId(0));
                (team, SharedMemoryPool::new(BATCH_SIZE * 64).unwrap())
            },
            |(team, mut pool)| {
                for _ in 0..100 {
                    black_box(pool.alloc_global(&team, 64).unwrap());
                }
                (team, pool)
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_shmem_batch, bench_pmem_alloc);
criterion_main!(benches);
