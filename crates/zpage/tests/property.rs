//! Randomized Workload Tests - Accounting Under Arbitrary Sequences
//!
//! Seeded random mixes of allocation, free, undo and uncommit. After every
//! step the allocator's own invariant check must pass and the bytes the
//! test holds must equal the allocator's `used`.
//!
//! Seeds are fixed so a failure reproduces.

mod common;

use common::{non_blocking, HeapFixture, G};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use zpage::{AllocatorConfig, LimitedBacking, Page, PageType, PhysicalBacking};

fn random_request(rng: &mut StdRng) -> (PageType, usize) {
    match rng.gen_range(0..3) {
        0 => (PageType::Small, 1),
        1 => (PageType::Medium, rng.gen_range(2..=4)),
        _ => (PageType::Large, rng.gen_range(1..=10)),
    }
}

fn assert_disjoint(pages: &[Page]) {
    let mut ranges: Vec<(usize, usize)> = pages.iter().map(|p| (p.start(), p.end())).collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "pages {:?} and {:?} overlap", pair[0], pair[1]);
    }
}

fn run_workload(partitions: usize, seed: u64, steps: usize) {
    run_workload_with(partitions, seed, steps, None);
}

fn run_workload_with(partitions: usize, seed: u64, steps: usize, commit_limit: Option<usize>) {
    // Arrange
    let backing = commit_limit.map(|limit| Arc::new(LimitedBacking::new(limit)) as Arc<dyn PhysicalBacking>);
    let fixture = HeapFixture::with_config(
        AllocatorConfig {
            uncommit_delay: Duration::ZERO,
            ..HeapFixture::config(partitions, 16)
        },
        backing,
    );
    let mut rng = StdRng::seed_from_u64(seed);
    let mut live: Vec<Page> = Vec::new();
    let mut ceiling = fixture.allocator().current_max_capacity();

    // Act & Assert
    for step in 0..steps {
        match rng.gen_range(0..10) {
            0..=4 => {
                let (page_type, granules) = random_request(&mut rng);
                if let Some(page) = fixture.alloc(page_type, granules, non_blocking()) {
                    assert_eq!(page.size(), granules * G);
                    live.push(page);
                }
            }
            5..=7 if !live.is_empty() => {
                let page = live.swap_remove(rng.gen_range(0..live.len()));
                fixture.allocator().free_page(page);
            }
            8 if !live.is_empty() => {
                let page = live.swap_remove(rng.gen_range(0..live.len()));
                fixture.allocator().undo_alloc_page(page);
            }
            _ => {
                fixture.allocator().uncommit(rng.gen_range(0..partitions));
            }
        }

        let held: usize = live.iter().map(|p| p.size()).sum();
        assert_eq!(fixture.allocator().used(), held, "used drifted at step {}", step);

        let current_max = fixture.allocator().current_max_capacity();
        assert!(current_max <= ceiling, "ceiling rose at step {}", step);
        ceiling = current_max;
        if let Err(e) = fixture.allocator().verify() {
            panic!("seed {} step {}: {}", seed, step, e);
        }
    }

    assert_disjoint(&live);

    for page in live.drain(..) {
        fixture.allocator().free_page(page);
    }
    assert_eq!(fixture.allocator().used(), 0);
    fixture.verify();
}

/// **Bug this finds:** Any accounting drift on one partition
#[test]
fn test_random_workload_single_partition() {
    for seed in 0..4 {
        run_workload(1, seed, 1_000);
    }
}

/// **Bug this finds:** Drift when pages span partitions, lost remaps
#[test]
fn test_random_workload_multi_partition() {
    for seed in 0..4 {
        run_workload(2, seed, 1_000);
    }
}

/// **Bug this finds:** Drift with odd partition counts and uneven splits
#[test]
fn test_random_workload_three_partitions() {
    run_workload(3, 42, 2_000);
}

/// **Bug this finds:** Leaks or drift on the commit failure paths
#[test]
fn test_random_workload_with_commit_failures() {
    for seed in 0..4 {
        run_workload_with(1, seed, 1_000, Some(10 * G));
        run_workload_with(2, seed, 1_000, Some(10 * G));
    }
}

/// Concurrent random workload, checked once everything is freed
///
/// **Bug this finds:** Races between claims, frees and stall hand-offs
#[test]
fn test_concurrent_random_workload() {
    let fixture = HeapFixture::new(2, 32);
    let threads = 4;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let heap = Arc::clone(&fixture.heap);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(t);
                let mut live = Vec::new();

                for _ in 0..500 {
                    if live.is_empty() || rng.gen_bool(0.55) {
                        let (page_type, granules) = random_request(&mut rng);
                        if let Some(page) =
                            heap.alloc_page(page_type, granules * G, non_blocking(), zpage::PageAge::EDEN)
                        {
                            live.push(page);
                        }
                    } else {
                        let page = live.swap_remove(rng.gen_range(0..live.len()));
                        heap.free_page(page);
                    }
                }

                live
            })
        })
        .collect();

    let mut survivors = Vec::new();
    for handle in handles {
        survivors.extend(handle.join().unwrap());
    }

    let held: usize = survivors.iter().map(|p| p.size()).sum();
    assert_eq!(fixture.allocator().used(), held);
    assert_disjoint(&survivors);
    fixture.verify();

    fixture.heap.free_pages(zpage::GenerationId::Young, survivors);
    assert_eq!(fixture.allocator().used(), 0);
    fixture.verify();
}
