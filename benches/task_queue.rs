// Task queue throughput under contention: single-threaded add/get, and
// the cross-lane pressure the internal lane is meant to relieve.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nebula_runtime::stop_token::StopToken;
use nebula_runtime::task_queue::TaskQueue;
use std::sync::Arc;
use std::thread;

fn bench_single_threaded_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_queue_round_trip");

    for capacity in [64usize, 1024, 8192] {
        group.bench_with_input(BenchmarkId::new("admission_lane", capacity), &capacity, |b, &capacity| {
            let queue: TaskQueue<u64> = TaskQueue::new(capacity);
            let stop = StopToken::new();
            b.iter(|| {
                queue.add_admission_task_blocking(&stop, black_box(42));
                black_box(queue.get_next_task_non_blocking());
            });
        });
    }

    group.finish();
}

fn bench_internal_lane_priority(c: &mut Criterion) {
    c.bench_function("internal_lane_drained_first", |b| {
        let queue: TaskQueue<u64> = TaskQueue::new(256);
        let stop = StopToken::new();
        for i in 0..64 {
            queue.add_admission_task_blocking(&stop, i);
        }
        b.iter(|| {
            queue.add_internal_task_non_blocking(black_box(1));
            black_box(queue.get_next_task_non_blocking());
        });
    });
}

fn bench_concurrent_producers_consumers(c: &mut Criterion) {
    c.bench_function("four_producers_four_consumers", |b| {
        b.iter(|| {
            let queue = Arc::new(TaskQueue::<u64>::new(1024));
            let stop = StopToken::new();

            let producers: Vec<_> = (0..4)
                .map(|_| {
                    let queue = queue.clone();
                    let stop = stop.clone();
                    thread::spawn(move || {
                        for i in 0..256u64 {
                            queue.add_admission_task_blocking(&stop, i);
                        }
                    })
                })
                .collect();

            let consumers: Vec<_> = (0..4)
                .map(|_| {
                    let queue = queue.clone();
                    let stop = stop.clone();
                    thread::spawn(move || {
                        let mut seen = 0u64;
                        while seen < 256 {
                            if queue.get_next_task_blocking(&stop).is_some() {
                                seen += 1;
                            }
                        }
                    })
                })
                .collect();

            for p in producers {
                p.join().unwrap();
            }
            for c in consumers {
                c.join().unwrap();
            }
        });
    });
}

criterion_group!(
    benches,
    bench_single_threaded_round_trip,
    bench_internal_lane_priority,
    bench_concurrent_producers_consumers
);
criterion_main!(benches);
