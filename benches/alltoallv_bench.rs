use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use locality_coll::algs::communicator::{Communicator, LocalComm};
use locality_coll::collective::{Datatype, alltoallv_init, alltoallv_with_config};
use locality_coll::config::LocalityConfig;

struct Layout {
    counts: Vec<usize>,
    displs: Vec<usize>,
    len: usize,
}

fn uniform(size: usize, block: usize) -> Layout {
    Layout {
        counts: vec![block; size],
        displs: (0..size).map(|d| d * block).collect(),
        len: size * block,
    }
}

/// Run `iters` rounds of `f` on every simulated rank; the slowest rank's
/// wall time is the sample.
fn time_ranks<F>(comms: &[LocalComm], iters: u64, f: F) -> Duration
where
    F: Fn(&LocalComm, u64) + Sync,
{
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .iter()
            .map(|c| {
                s.spawn(move || {
                    let t0 = Instant::now();
                    f(c, iters);
                    t0.elapsed()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .max()
            .unwrap_or_default()
    })
}

fn bench_alltoallv(c: &mut Criterion) {
    let mut group = c.benchmark_group("alltoallv");
    group.sample_size(10);
    let cfg = LocalityConfig::default();

    for &(nodes, ppn) in &[(2usize, 2usize), (4, 2), (4, 4)] {
        let size = nodes * ppn;
        let layout = uniform(size, 64);
        let label = format!("{nodes}x{ppn}");

        group.bench_with_input(BenchmarkId::new("one_shot", &label), &size, |b, _| {
            let comms = LocalComm::cluster(nodes, ppn);
            b.iter_custom(|iters| {
                time_ranks(&comms, iters, |comm, iters| {
                    let send = vec![comm.rank() as u64; layout.len];
                    let mut recv = vec![0u64; layout.len];
                    for _ in 0..iters {
                        alltoallv_with_config(
                            &send,
                            &layout.counts,
                            &layout.displs,
                            &mut recv,
                            &layout.counts,
                            &layout.displs,
                            comm,
                            &cfg,
                        )
                        .unwrap();
                        black_box(&recv);
                    }
                })
            });
        });

        group.bench_with_input(BenchmarkId::new("persistent", &label), &size, |b, _| {
            let comms = LocalComm::cluster(nodes, ppn);
            b.iter_custom(|iters| {
                time_ranks(&comms, iters, |comm, iters| {
                    let dt = Datatype::of::<u64>();
                    let mut req = alltoallv_init(
                        comm,
                        &layout.counts,
                        &layout.displs,
                        dt,
                        &layout.counts,
                        &layout.displs,
                        dt,
                        &cfg,
                    )
                    .unwrap();
                    let send = vec![comm.rank() as u64; layout.len];
                    let mut recv = vec![0u64; layout.len];
                    for _ in 0..iters {
                        req.start(&send).unwrap();
                        req.wait(&mut recv).unwrap();
                        black_box(&recv);
                    }
                    req.free().unwrap();
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_alltoallv);
criterion_main!(benches);
