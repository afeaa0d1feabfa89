//! Criterion benchmarks for the queue layer

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use maelstrom::queue::{AdaptiveBlockingQueue, ArrayMpmcQueue, BlockingQueue, ListMpmcQueue};

fn bench_array_queue(c: &mut Criterion) {
    let queue = ArrayMpmcQueue::new(1024);
    c.bench_function("array_mpmc_push_pop", |b| {
        b.iter(|| {
            queue.try_push(black_box(1u64)).unwrap();
            black_box(queue.try_pop().unwrap());
        })
    });
}

fn bench_list_queue(c: &mut Criterion) {
    let queue = ListMpmcQueue::new();
    c.bench_function("list_mpmc_push_pop", |b| {
        b.iter(|| {
            queue.try_push(black_box(1u64)).unwrap();
            black_box(queue.try_pop().unwrap());
        })
    });
}

fn bench_blocking_adapter(c: &mut Criterion) {
    let queue = BlockingQueue::new(ArrayMpmcQueue::new(1024));
    c.bench_function("blocking_push_pop", |b| {
        b.iter(|| {
            queue.push(black_box(1u64));
            black_box(queue.pop());
        })
    });
}

fn bench_adaptive_adapter(c: &mut Criterion) {
    let queue = AdaptiveBlockingQueue::new(ArrayMpmcQueue::new(1024));
    c.bench_function("adaptive_push_pop", |b| {
        b.iter(|| {
            queue.push(black_box(1u64));
            black_box(queue.pop().unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_array_queue,
    bench_list_queue,
    bench_blocking_adapter,
    bench_adaptive_adapter
);
criterion_main!(benches);
