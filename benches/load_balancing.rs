use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pasarela::core::{BackendAlgo, BackendSet, BackendState, BackendType};

fn selection_set(replicas: usize) -> BackendSet {
    let set = BackendSet::new();
    set.add("10.0.0.1:3306@g1", BackendType::ReadWrite, BackendState::Up, None).unwrap();
    for i in 0..replicas {
        let state = if i % 3 == 2 {
            BackendState::Down
        } else {
            BackendState::Up
        };
        let address = format!("10.0.1.{}:3306@g1", i + 1);
        set.add(&address, BackendType::ReadOnly, state, None).unwrap();
    }
    set
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("selection");

    for replicas in [4, 64].iter() {
        let set = selection_set(*replicas);

        group.bench_with_input(BenchmarkId::new("get_rw_ndx", replicas), replicas, |b, _| {
            b.iter(|| black_box(set.get_rw_ndx()))
        });

        for algo in [BackendAlgo::RoundRobin, BackendAlgo::Random, BackendAlgo::First] {
            group.bench_with_input(
                BenchmarkId::new(format!("get_ro_ndx_{:?}", algo), replicas),
                replicas,
                |b, _| b.iter(|| black_box(set.get_ro_ndx(algo))),
            );
        }

        group.bench_with_input(
            BenchmarkId::new("group_pick_slave_backend", replicas),
            replicas,
            |b, _| b.iter(|| black_box(set.group_pick_slave_backend("g1"))),
        );
    }

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
