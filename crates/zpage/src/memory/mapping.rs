//! Heap Mapping - Reserved Address Space via memmap2
//!
//! The whole heap address space (every partition's reservation plus the
//! multi-partition range) is reserved up front as one anonymous mapping.
//! Pages are handed out as offsets into it.
//!
//! Anonymous memory is backed lazily by the OS, so mapping a range needs no
//! system call. Unmapping discards the range's contents so the OS can
//! reclaim the pages:
//! - Unix: `madvise(MADV_DONTNEED)`
//! - Other platforms: contents are kept until the mapping is dropped
//!
//! Pre-touching writes one byte per OS page, in parallel on a rayon pool.

use super::range::VirtualMemory;
use crate::error::{Result, ZError};
use crate::util::Alignment;
use memmap2::{MmapMut, MmapOptions};
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// HeapMapping - owner of the reserved heap address range
pub struct HeapMapping {
    /// Keeps the reservation alive
    _mmap: MmapMut,

    /// Base address of the reservation
    base: usize,

    /// Size of the reservation in bytes
    size: usize,

    /// Bytes currently mapped
    mapped: AtomicUsize,
}

impl HeapMapping {
    /// Reserve `size` bytes of address space starting at an `alignment`
    /// boundary
    pub fn reserve(size: usize, alignment: usize) -> Result<Self> {
        let len = size + alignment;
        let mut mmap = MmapOptions::new().len(len).map_anon().map_err(|e| {
            ZError::VirtualMemory(format!("Failed to reserve {} bytes of address space: {}", len, e))
        })?;

        let base = Alignment::align_up(mmap.as_mut_ptr() as usize, alignment);

        log::debug!("Reserved heap address space [{:#x}, {:#x})", base, base + size);

        Ok(Self {
            _mmap: mmap,
            base,
            size,
            mapped: AtomicUsize::new(0),
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Address of heap offset `offset`
    pub fn address(&self, offset: usize) -> usize {
        debug_assert!(offset <= self.size);
        self.base + offset
    }

    /// Bytes currently mapped
    pub fn mapped(&self) -> usize {
        self.mapped.load(Ordering::Relaxed)
    }

    /// Make `vmem` usable
    pub fn map(&self, vmem: VirtualMemory) {
        debug_assert!(vmem.end() <= self.size);
        self.mapped.fetch_add(vmem.size(), Ordering::Relaxed);
    }

    /// Discard the contents of `vmem`
    pub fn unmap(&self, vmem: VirtualMemory) {
        debug_assert!(vmem.end() <= self.size);

        #[cfg(unix)]
        {
            // SAFETY: the range lies inside our own reservation, is page
            // aligned, and no page or cache entry refers to it any more.
            let ret = unsafe {
                libc::madvise(
                    self.address(vmem.start()) as *mut libc::c_void,
                    vmem.size(),
                    libc::MADV_DONTNEED,
                )
            };
            if ret != 0 {
                log::warn!(
                    "madvise(MADV_DONTNEED) failed for {:?}: {}",
                    vmem,
                    std::io::Error::last_os_error()
                );
            }
        }

        self.mapped.fetch_sub(vmem.size(), Ordering::Relaxed);
    }

    /// Fault in every OS page of `vmem` using `workers` threads
    pub fn pretouch(&self, vmem: VirtualMemory, workers: usize) {
        let stride = page_size::get();
        let start = self.address(vmem.start());
        let end = start + vmem.size();

        let touch = |from: usize, to: usize| {
            let mut addr = from;
            while addr < to {
                // SAFETY: inside the reservation and not yet handed out, so
                // nobody else reads or writes it.
                unsafe { std::ptr::write_volatile(addr as *mut u8, 0) };
                addr += stride;
            }
        };

        if workers <= 1 {
            touch(start, end);
            return;
        }

        let chunk = (vmem.size() / workers).max(stride);
        let chunk = Alignment::align_up(chunk, stride);

        match rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("zpage-pretouch-{}", i))
            .build()
        {
            Ok(pool) => pool.install(|| {
                (start..end)
                    .step_by(chunk)
                    .collect::<Vec<_>>()
                    .into_par_iter()
                    .for_each(|from| touch(from, (from + chunk).min(end)));
            }),
            Err(e) => {
                log::warn!("Pre-touch pool unavailable ({}), touching serially", e);
                touch(start, end);
            }
        }
    }
}
