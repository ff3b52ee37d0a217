//! NUMA (Non-Uniform Memory Access) Topology
//!
//! Module ini menentukan jumlah NUMA node dan node "lokal" untuk setiap
//! thread. Page allocator membuat satu partition per node; alokasi dimulai
//! dari partition milik node lokal thread (initiating NUMA id) lalu
//! berputar round-robin ke node lain.
//!
//! NUMA Architecture:
//! ```text
//! ┌─────────────┐     ┌─────────────┐
//! │  CPU Node 0 │     │  CPU Node 1 │
//! │  ┌───────┐  │     │  ┌───────┐  │
//! │  │ Cores │  │     │  │ Cores │  │
//! │  └───┬───┘  │     │  └───┬───┘  │
//! │  ┌───▼───┐  │     │  ┌───▼───┐  │
//! │  │ Local │  │     │  │ Local │  │
//! │  │ Memory│  │     │  │ Memory│  │
//! │  └───────┘  │     │  └───────┘  │
//! └─────────────┘     └─────────────┘
//!        └────────┬──────────┘
//!         Interconnect (slower access)
//! ```
//!
//! Thread yang belum di-bind mendapat node secara round-robin saat pertama
//! kali bertanya, sehingga thread tersebar merata antar partition.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counter untuk round-robin assignment thread ke node
static NEXT_NODE: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Node yang di-bind ke thread ini (None = belum ditentukan)
    static CURRENT_NODE: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Jumlah NUMA node di sistem
///
/// Linux: baca `/sys/devices/system/node/online` (format "0-1,3").
/// Platform lain atau jika gagal: 1.
pub fn node_count() -> usize {
    #[cfg(target_os = "linux")]
    {
        if let Ok(online) = std::fs::read_to_string("/sys/devices/system/node/online") {
            if let Some(count) = parse_node_list(online.trim()) {
                return count.max(1);
            }
        }
    }

    1
}

/// Parse node list seperti "0", "0-3" atau "0-1,4"
fn parse_node_list(list: &str) -> Option<usize> {
    let mut count = 0;

    for part in list.split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().ok()?;
                let hi: usize = hi.trim().parse().ok()?;
                count += hi.checked_sub(lo)? + 1;
            }
            None => {
                part.trim().parse::<usize>().ok()?;
                count += 1;
            }
        }
    }

    Some(count)
}

/// Node lokal thread ini, dipetakan ke `[0, partitions)`
pub fn current_id(partitions: usize) -> usize {
    debug_assert!(partitions > 0);

    let node = CURRENT_NODE.with(|current| match current.get() {
        Some(node) => node,
        None => {
            let node = NEXT_NODE.fetch_add(1, Ordering::Relaxed);
            current.set(Some(node));
            node
        }
    });

    node % partitions
}

/// Bind thread ini ke node tertentu
///
/// Dipakai oleh worker yang tahu node-nya dan oleh test yang butuh
/// initiating NUMA id yang deterministik.
pub fn bind_current_thread(node: usize) {
    CURRENT_NODE.with(|current| current.set(Some(node)));
}
