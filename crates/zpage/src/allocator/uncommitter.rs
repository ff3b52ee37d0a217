//! Uncommitter - background return of idle memory
//!
//! One thread per partition. It wakes every `uncommit_delay`, asks the page
//! allocator to uncommit what stayed in the partition's cache since the
//! last round, and goes back to sleep. The thread holds only a weak
//! reference, so it never keeps the allocator alive.

use super::page_allocator::PageAllocator;
use crate::error::{Result, ZError};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct Signal {
    stop: Mutex<bool>,
    condvar: Condvar,
}

/// Uncommitter - handle to one partition's uncommit thread
pub struct Uncommitter {
    numa_id: usize,
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl Uncommitter {
    pub fn start(page_allocator: Weak<PageAllocator>, numa_id: usize, delay: Duration) -> Result<Self> {
        let signal = Arc::new(Signal {
            stop: Mutex::new(false),
            condvar: Condvar::new(),
        });
        let thread_signal = signal.clone();
        let name = format!("zpage-uncommitter-{}", numa_id);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(page_allocator, numa_id, delay, &thread_signal))
            .map_err(|source| ZError::ThreadSpawn { name, source })?;

        log::debug!("Uncommitter for partition {} started", numa_id);

        Ok(Self {
            numa_id,
            signal,
            handle: Some(handle),
        })
    }

    pub fn numa_id(&self) -> usize {
        self.numa_id
    }

    /// Wake the thread and wait for it to exit
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        *self.signal.stop.lock() = true;
        self.signal.condvar.notify_all();

        if handle.join().is_err() {
            log::error!("Uncommitter for partition {} panicked", self.numa_id);
        }
    }
}

impl Drop for Uncommitter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(page_allocator: Weak<PageAllocator>, numa_id: usize, delay: Duration, signal: &Signal) {
    crate::numa::bind_current_thread(numa_id);

    loop {
        {
            let mut stop = signal.stop.lock();
            if !*stop {
                signal.condvar.wait_for(&mut stop, delay);
            }
            if *stop {
                return;
            }
        }

        let Some(page_allocator) = page_allocator.upgrade() else {
            return;
        };

        let uncommitted = page_allocator.uncommit(numa_id);
        log::trace!("Partition {} uncommit round: {} bytes", numa_id, uncommitted);
    }
}
