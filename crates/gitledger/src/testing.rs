//! Allocator probes shared by the unit tests.

use core::alloc::Layout;
use core::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gitledger_core::{Allocator, RawAllocator, SystemAllocator};

/// Counts allocations and frees.
#[derive(Default)]
pub(crate) struct CountingAllocator {
    allocs: AtomicUsize,
    frees: AtomicUsize,
}

impl CountingAllocator {
    pub(crate) fn shared() -> (Arc<CountingAllocator>, Allocator) {
        let probe = Arc::new(CountingAllocator::default());
        (probe.clone(), Allocator::from_arc(probe))
    }

    pub(crate) fn allocs(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }

    pub(crate) fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    pub(crate) fn balanced(&self) -> bool {
        self.allocs() == self.frees()
    }
}

impl RawAllocator for CountingAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        let ptr = SystemAllocator.allocate(layout)?;
        self.allocs.fetch_add(1, Ordering::SeqCst);
        Some(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        SystemAllocator.free(ptr, layout)
    }
}

/// Fails exactly the `fail_at`-th allocation request (1-based).
pub(crate) struct FailingAllocator {
    calls: AtomicUsize,
    fail_at: usize,
    counts: CountingAllocator,
}

impl FailingAllocator {
    pub(crate) fn shared(fail_at: usize) -> (Arc<FailingAllocator>, Allocator) {
        let probe = Arc::new(FailingAllocator {
            calls: AtomicUsize::new(0),
            fail_at,
            counts: CountingAllocator::default(),
        });
        (probe.clone(), Allocator::from_arc(probe))
    }

    pub(crate) fn balanced(&self) -> bool {
        self.counts.balanced()
    }
}

impl RawAllocator for FailingAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_at {
            return None;
        }
        self.counts.allocate(layout)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        self.counts.free(ptr, layout)
    }
}

/// Scribbles over every block before freeing it, so a use after free reads
/// garbage instead of the old contents.
#[derive(Default)]
pub(crate) struct PoisoningAllocator {
    counts: CountingAllocator,
}

impl PoisoningAllocator {
    pub(crate) const POISON: u8 = 0xAB;

    pub(crate) fn shared() -> (Arc<PoisoningAllocator>, Allocator) {
        let probe = Arc::new(PoisoningAllocator::default());
        (probe.clone(), Allocator::from_arc(probe))
    }

    pub(crate) fn balanced(&self) -> bool {
        self.counts.balanced()
    }
}

impl RawAllocator for PoisoningAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.counts.allocate(layout)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        ptr.as_ptr().write_bytes(Self::POISON, layout.size());
        self.counts.free(ptr, layout)
    }
}

pub(crate) fn count_occurrences(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
}
