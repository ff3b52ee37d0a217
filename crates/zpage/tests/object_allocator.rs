//! Object Allocator Tests - Shared Pages and Generations
//!
//! These tests verify that objects land in the right pages:
//! - small objects share a page per CPU slot
//! - medium objects share one medium page
//! - large objects get a page of their own
//! - relocation never stalls, mutator allocation fails only after an old cycle

mod common;

use common::{wait_until, HeapFixture, G};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use zpage::util::constants::MB;
use zpage::{AllocEvent, GenerationId, PageAge, ZError};

/// ============================================================================
/// PAGE SELECTION
/// ============================================================================

/// Consecutive small objects from one thread are bump allocated
///
/// **Bug this finds:** A page per object, misaligned bumps
#[test]
fn test_small_objects_share_page() {
    // Arrange
    let fixture = HeapFixture::new(1, 16);

    // Act
    let first = fixture.heap.alloc_object(64).unwrap();
    let second = fixture.heap.alloc_object(64).unwrap();

    // Assert
    assert_eq!(second, first + 64);
    assert_eq!(fixture.heap.young().used(), G);

    let eden = fixture.heap.young().eden().unwrap();
    assert_eq!(eden.objects().page_count(), 1);
    assert_eq!(eden.remaining(), G - 128);
    fixture.verify();
}

/// Medium objects go into a maximum-size medium page
///
/// **Bug this finds:** Medium objects routed to small or large pages
#[test]
fn test_medium_object_page() {
    let fixture = HeapFixture::new(1, 16);

    let first = fixture.heap.alloc_object(512 * 1024).unwrap();
    let second = fixture.heap.alloc_object(512 * 1024).unwrap();

    assert_eq!(second, first + 512 * 1024);
    assert_eq!(fixture.heap.young().used(), 4 * G);
    assert_eq!(fixture.allocator().alloc_stats().summary().medium_pages, 1);
    fixture.verify();
}

/// Large objects get a dedicated page rounded up to granules
///
/// **Bug this finds:** Large objects sharing pages, wrong rounding
#[test]
fn test_large_object_dedicated_page() {
    let fixture = HeapFixture::new(1, 16);

    let a = fixture.heap.alloc_object(3 * MB).unwrap();
    let b = fixture.heap.alloc_object(3 * MB).unwrap();

    assert_eq!(a % G, 0);
    assert_eq!(b % G, 0);
    assert_ne!(a, b);
    assert_eq!(fixture.heap.young().used(), 4 * G);
    assert_eq!(fixture.allocator().alloc_stats().summary().large_pages, 2);
    fixture.verify();
}

/// Objects from many threads never overlap
///
/// **Bug this finds:** Lost CAS races, double-installed pages
#[test]
fn test_concurrent_small_allocation_unique() {
    // Arrange
    let fixture = HeapFixture::new(1, 32);
    let threads = 4;
    let per_thread = 500;

    // Act
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let heap = Arc::clone(&fixture.heap);
            thread::spawn(move || {
                (0..per_thread)
                    .map(|_| heap.alloc_object(64).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for addr in handle.join().unwrap() {
            assert!(seen.insert(addr), "object {:#x} handed out twice", addr);
        }
    }

    // Assert
    assert_eq!(seen.len(), threads * per_thread);
    fixture.verify();
}

/// Threads racing to install the first shared page waste at most one
/// page per loser
///
/// **Bug this finds:** Installed pages leaked, losers' pages never undone
#[test]
fn test_install_race_waste_bounded() {
    let fixture = HeapFixture::new(1, 64);
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let heap = Arc::clone(&fixture.heap);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                heap.alloc_object(64).unwrap()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let objects = fixture.heap.young().eden().unwrap().objects();
    assert!(objects.undone_pages() <= (threads - 1) as u64);
    // Every page still held is tracked, nothing leaked
    assert_eq!(objects.used(), objects.page_count() * G);
    assert_eq!(fixture.heap.young().used(), objects.used());
    fixture.verify();
}

/// Zero-sized requests are rejected
#[test]
fn test_zero_size_rejected() {
    let fixture = HeapFixture::new(1, 4);

    assert!(matches!(fixture.heap.alloc_object(0), Err(ZError::InvalidArgument(_))));
    assert!(matches!(fixture.heap.alloc_tlab(0), Err(ZError::InvalidArgument(_))));
}

/// A TLAB is carved out of an eden page
#[test]
fn test_alloc_tlab() {
    let fixture = HeapFixture::new(1, 4);

    let tlab = fixture.heap.alloc_tlab(64 * 1024).unwrap();
    let object = fixture.heap.alloc_object(64).unwrap();

    assert_eq!(tlab % 8, 0);
    assert_eq!(object, tlab + 64 * 1024);
    assert_eq!(fixture.heap.young().used(), G);

    let eden = fixture.heap.young().eden().unwrap();
    assert_eq!(eden.tlab_bytes(), 64 * 1024);
}

/// ============================================================================
/// RETIRE AND FREE
/// ============================================================================

/// Pages taken from a generation can be freed back
///
/// **Bug this finds:** Pages kept alive by retired slots
#[test]
fn test_take_and_free_pages() {
    let fixture = HeapFixture::new(1, 16);
    fixture.heap.alloc_object(64).unwrap();
    fixture.heap.alloc_object(512 * 1024).unwrap();
    fixture.heap.alloc_object(3 * MB).unwrap();

    let pages = fixture.heap.young().take_pages();
    assert_eq!(pages.len(), 3);
    assert_eq!(fixture.heap.young().eden().unwrap().objects().page_count(), 0);

    fixture.heap.young().free_pages(pages);

    assert_eq!(fixture.heap.young().used(), 0);
    assert_eq!(fixture.allocator().used(), 0);
    assert_eq!(fixture.heap.stats(GenerationId::Young).freed, 7 * G);
    fixture.verify();
}

/// A new cycle retires shared pages, so the next object opens a new page
#[test]
fn test_begin_cycle_retires_pages() {
    let fixture = HeapFixture::new(1, 16);
    fixture.heap.alloc_object(64).unwrap();

    fixture.heap.begin_cycle(GenerationId::Young);
    fixture.heap.alloc_object(64).unwrap();

    assert_eq!(fixture.heap.young().eden().unwrap().objects().page_count(), 2);
    assert_eq!(fixture.heap.young().used(), 2 * G);
}

/// ============================================================================
/// RELOCATION
/// ============================================================================

/// Relocation targets survivor and old pages
///
/// **Bug this finds:** Relocated objects accounted to the wrong generation
#[test]
fn test_relocation_targets() {
    let fixture = HeapFixture::new(1, 16);

    assert!(fixture.heap.alloc_for_relocation(64, PageAge::survivor(1)).is_some());
    assert!(fixture.heap.alloc_for_relocation(64, PageAge::OLD).is_some());

    assert_eq!(fixture.heap.young().used(), G);
    assert_eq!(fixture.heap.old().used(), G);
    // Eden is not a relocation target
    assert!(fixture.heap.alloc_for_relocation(64, PageAge::EDEN).is_none());
}

/// Relocation fails fast instead of stalling
///
/// **Bug this finds:** Collector threads deadlocked in the stall queue
#[test]
fn test_relocation_never_stalls() {
    let fixture = HeapFixture::new(1, 4);
    let _pages = fixture.fill();

    assert!(fixture.heap.alloc_for_relocation(64, PageAge::OLD).is_none());
    assert!(!fixture.heap.is_alloc_stalling());
    assert_eq!(fixture.driver.minor(), 0);
}

/// A whole relocation page for a survivor age
#[test]
fn test_alloc_page_for_relocation() {
    let fixture = HeapFixture::new(1, 16);
    let target = fixture
        .heap
        .young()
        .relocation_allocator(PageAge::survivor(3))
        .unwrap();

    let page = target.alloc_page_for_relocation(zpage::PageType::Medium, 2 * G).unwrap();

    assert_eq!(page.age(), PageAge::survivor(3));
    assert_eq!(page.size(), 2 * G);
    fixture.heap.free_page(page);
    fixture.verify();
}

/// ============================================================================
/// OUT OF MEMORY
/// ============================================================================

/// A stalled mutator gets an error once an old cycle could not help
///
/// **Bug this finds:** Mutators stalled forever, errors without an event
#[test]
fn test_alloc_object_out_of_memory() {
    // Arrange
    let fixture = HeapFixture::new(1, 4);
    let _pages = fixture.fill();

    let heap = Arc::clone(&fixture.heap);
    let stalled = thread::spawn(move || heap.alloc_object(64));
    assert!(wait_until(|| fixture.heap.is_alloc_stalling()));

    // Act
    fixture.heap.begin_cycle(GenerationId::Old);
    fixture.heap.handle_alloc_stalling_for_old(true);
    let result = stalled.join().unwrap();

    // Assert
    assert!(matches!(result, Err(ZError::OutOfMemory { requested: 64, .. })));
    assert_eq!(
        fixture
            .heap
            .events()
            .find(|e| matches!(e, AllocEvent::OutOfMemory { .. }))
            .len(),
        1
    );
    fixture.verify();
}
