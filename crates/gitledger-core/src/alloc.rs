//! Allocator capability
//!
//! Every block the diagnostic subsystem owns (context blocks, error blocks,
//! messages, registry nodes, JSON caches and caller copies) is obtained from
//! an [`Allocator`]. Callers may supply their own backend through
//! [`RawAllocator`]; the implementor's fields play the role of opaque user
//! state. Cloning an `Allocator` is cheap and yields a snapshot that keeps the
//! backend reachable for as long as the clone lives.

use core::alloc::Layout;
use core::fmt;
use core::mem;
use core::ptr::{self, NonNull};
use std::sync::Arc;

/// Backend allocate/free pair.
///
/// The subsystem never requests zero-sized layouts.
pub trait RawAllocator: Send + Sync {
    /// Allocate a block for `layout`. `None` signals allocation failure.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Free a block previously returned by [`RawAllocator::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this backend with the
    /// same `layout`, and must not be freed twice.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Backend over the process global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl RawAllocator for SystemAllocator {
    #[inline]
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0, "zero-sized allocation request");
        // Safety: layout is non-zero sized
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    #[inline]
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// Shared handle to an allocation backend.
#[derive(Clone)]
pub struct Allocator {
    backend: Arc<dyn RawAllocator>,
}

impl Allocator {
    /// Wrap a backend.
    pub fn new<A: RawAllocator + 'static>(backend: A) -> Self {
        Self { backend: Arc::new(backend) }
    }

    /// Wrap an already shared backend (lets callers keep a handle to
    /// inspect its state, e.g. allocation counters).
    pub fn from_arc(backend: Arc<dyn RawAllocator>) -> Self {
        Self { backend }
    }

    /// The process global allocator.
    pub fn system() -> Self {
        Self::new(SystemAllocator)
    }

    /// True if both handles drive the same backend instance.
    pub fn same_backend(&self, other: &Allocator) -> bool {
        ptr::eq(
            Arc::as_ptr(&self.backend) as *const u8,
            Arc::as_ptr(&other.backend) as *const u8,
        )
    }

    /// Allocate raw memory through the backend.
    #[inline]
    pub fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        self.backend.allocate(layout)
    }

    /// Free raw memory through the backend.
    ///
    /// # Safety
    ///
    /// Same contract as [`RawAllocator::free`].
    #[inline]
    pub unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        self.backend.free(ptr, layout);
    }

    /// Allocate an uninitialised block sized for `T`.
    pub fn alloc_block<T>(&self) -> Option<NonNull<T>> {
        debug_assert!(mem::size_of::<T>() > 0);
        self.allocate(Layout::new::<T>()).map(NonNull::cast)
    }

    /// Allocate a block and move `value` into it.
    pub fn alloc_value<T>(&self, value: T) -> Option<NonNull<T>> {
        let block = self.alloc_block::<T>()?;
        // Safety: fresh block sized and aligned for T
        unsafe { block.as_ptr().write(value) };
        Some(block)
    }

    /// Free a block from [`Allocator::alloc_block`] without running `T`'s
    /// destructor.
    ///
    /// # Safety
    ///
    /// `block` must come from this allocator's `alloc_block::<T>` or
    /// `alloc_value::<T>` and must not be used afterwards.
    pub unsafe fn free_block<T>(&self, block: NonNull<T>) {
        self.free(block.cast(), Layout::new::<T>());
    }

    /// Drop the value in `block` and free the block.
    ///
    /// # Safety
    ///
    /// As for [`Allocator::free_block`]; the block must hold an initialised `T`.
    pub unsafe fn free_value<T>(&self, block: NonNull<T>) {
        ptr::drop_in_place(block.as_ptr());
        self.free_block(block);
    }

    /// Allocate a zeroed byte buffer holding `len` bytes plus a terminator.
    pub fn alloc_buf(&self, len: usize) -> Option<RawBuf> {
        let cap = len.checked_add(1)?;
        let layout = Layout::array::<u8>(cap).ok()?;
        let ptr = self.allocate(layout)?;
        // Safety: ptr is valid for cap bytes
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, cap) };
        Some(RawBuf { ptr, len, cap })
    }

    /// Allocate a buffer holding a copy of `bytes`.
    pub fn alloc_copy(&self, bytes: &[u8]) -> Option<RawBuf> {
        let mut buf = self.alloc_buf(bytes.len())?;
        buf.as_mut_bytes().copy_from_slice(bytes);
        Some(buf)
    }

    /// Free a buffer from [`Allocator::alloc_buf`].
    ///
    /// # Safety
    ///
    /// `buf` must have been allocated through this allocator's backend.
    pub unsafe fn free_buf(&self, buf: RawBuf) {
        // Layout was validated at allocation time
        let layout = Layout::from_size_align_unchecked(buf.cap, 1);
        self.free(buf.ptr, layout);
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("backend", &(Arc::as_ptr(&self.backend) as *const u8))
            .finish()
    }
}

/// NUL-terminated byte buffer owned through an [`Allocator`].
///
/// A `RawBuf` does not free itself; the owner returns it through
/// [`Allocator::free_buf`] on the allocator it came from.
pub struct RawBuf {
    ptr: NonNull<u8>,
    len: usize,
    cap: usize,
}

// Safety: RawBuf is a uniquely owned heap block; shared access is read-only
unsafe impl Send for RawBuf {}
unsafe impl Sync for RawBuf {}

impl RawBuf {
    /// Content length, excluding the terminator.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated size, including the terminator.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Content bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        // Safety: the first len bytes are initialised and owned by self
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Content bytes, mutable.
    #[inline]
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        // Safety: as above, and &mut self gives exclusive access
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// The whole allocation, terminator slot included.
    #[inline]
    pub fn as_mut_capacity(&mut self) -> &mut [u8] {
        // Safety: all cap bytes were zeroed at allocation
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.cap) }
    }

    /// Shrink the content length and re-terminate. Capacity is unchanged so
    /// the buffer frees with its original layout.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
            self.as_mut_capacity()[len] = 0;
        }
    }
}

impl fmt::Debug for RawBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBuf")
            .field("len", &self.len)
            .field("cap", &self.cap)
            .finish()
    }
}
