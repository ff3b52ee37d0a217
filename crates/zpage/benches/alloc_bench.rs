//! zpage Benchmarks
//!
//! Page allocation from the cache and from fresh capacity, object
//! allocation per page type.
//! Run with: `cargo bench --package zpage`

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::time::Duration;
use zpage::util::constants::MB;
use zpage::{AllocationFlags, AllocatorConfig, Heap, PageAge, PageType};

const GRANULE: usize = 2 * MB;

fn create_heap(max_capacity: usize) -> Heap {
    let config = AllocatorConfig {
        max_capacity,
        soft_max_capacity: max_capacity,
        min_capacity: 0,
        initial_capacity: 0,
        numa_partitions: Some(1),
        uncommit: false,
        uncommit_delay: Duration::from_secs(3600),
        ..Default::default()
    };
    Heap::new(config).unwrap()
}

fn non_blocking() -> AllocationFlags {
    let mut flags = AllocationFlags::new();
    flags.set_non_blocking();
    flags
}

fn bench_page_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_alloc_free");
    let heap = create_heap(256 * MB);

    for (name, page_type, size) in [
        ("small", PageType::Small, GRANULE),
        ("medium", PageType::Medium, 16 * GRANULE),
        ("large", PageType::Large, 8 * GRANULE),
    ] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                let page = heap
                    .alloc_page(page_type, black_box(size), non_blocking(), PageAge::EDEN)
                    .unwrap();
                heap.free_page(page);
            })
        });
    }

    group.finish();
}

fn bench_page_harvest(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_harvest");

    // Every other granule cached: a 4-granule page is assembled from fragments
    group.bench_function("fragmented_cache", |b| {
        b.iter_batched(
            || {
                let heap = create_heap(16 * GRANULE);
                let mut pages: Vec<_> = (0..16)
                    .map(|_| {
                        heap.alloc_page(PageType::Small, GRANULE, non_blocking(), PageAge::EDEN)
                            .unwrap()
                    })
                    .collect();
                let odd: Vec<_> = (0..8).map(|i| pages.remove(i)).collect();
                for page in odd {
                    heap.free_page(page);
                }
                (heap, pages)
            },
            |(heap, pages)| {
                let page = heap
                    .alloc_page(PageType::Large, 4 * GRANULE, non_blocking(), PageAge::EDEN)
                    .unwrap();
                black_box(&page);
                (heap, pages, page)
            },
            BatchSize::PerIteration,
        )
    });

    group.finish();
}

fn bench_object_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("object_alloc");

    for &size in &[16usize, 64, 256, 4096] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("small_{}", size), |b| {
            b.iter_batched(
                || create_heap(64 * MB),
                |heap| {
                    for _ in 0..1000 {
                        black_box(heap.alloc_object(size).unwrap());
                    }
                    heap
                },
                BatchSize::PerIteration,
            )
        });
    }

    group.finish();
}

fn bench_heap_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_creation");
    group.bench_function("1g_reservation", |b| {
        b.iter(|| black_box(create_heap(1024 * MB)))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_page_cycle,
    bench_page_harvest,
    bench_object_allocation,
    bench_heap_creation
);
criterion_main!(benches);
