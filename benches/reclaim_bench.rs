//! Criterion benchmark untuk reclamation list dan buffer pool
//!
//! Run dengan: cargo bench

use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use netlayer::core::{BufferPool, ReclaimList};
use netlayer::BufferPolicy;

fn bench_push_take(c: &mut Criterion) {
    let mut group = c.benchmark_group("reclaim_list");
    group.throughput(Throughput::Elements(1));

    // Push lalu drain satu per satu
    group.bench_function("push_take_single", |b| {
        let list = ReclaimList::new();
        let mut i = 0u64;
        b.iter(|| {
            list.push(black_box(i));
            black_box(list.take_all());
            i = i.wrapping_add(1);
        });
    });

    // Drain kosong: yang terjadi di setiap cycle tanpa close
    group.bench_function("take_empty", |b| {
        let list: ReclaimList<u64> = ReclaimList::new();
        b.iter(|| black_box(list.take_all()));
    });

    group.finish();
}

fn bench_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch");

    for batch_size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_function(format!("push_drain_{}", batch_size), |b| {
            let list = ReclaimList::new();
            b.iter(|| {
                for i in 0..*batch_size {
                    list.push(black_box(i as u64));
                }
                let batch = list.take_all();
                black_box(batch.iter().sum::<u64>())
            });
        });
    }

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended");
    const PER_THREAD: u64 = 1000;

    for threads in [2u64, 4].iter() {
        group.throughput(Throughput::Elements(threads * PER_THREAD));
        group.bench_function(format!("push_{}_threads", threads), |b| {
            b.iter(|| {
                let list = Arc::new(ReclaimList::new());
                let handles: Vec<_> = (0..*threads)
                    .map(|t| {
                        let list = Arc::clone(&list);
                        thread::spawn(move || {
                            for i in 0..PER_THREAD {
                                list.push(t * PER_THREAD + i);
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().ok();
                }
                black_box(list.take_all().len())
            });
        });
    }

    group.finish();
}

fn bench_buffer_policy(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool");
    group.throughput(Throughput::Elements(1));

    for (name, policy) in [("reuse", BufferPolicy::Reuse), ("per_call", BufferPolicy::PerCall)] {
        group.bench_function(format!("acquire_release_{}", name), |b| {
            let pool = BufferPool::new(policy);
            b.iter(|| {
                if let Ok(buf) = pool.acquire(black_box(65535)) {
                    pool.release(buf);
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_push_take,
    bench_batches,
    bench_contended,
    bench_buffer_policy
);
criterion_main!(benches);
