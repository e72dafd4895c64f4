//! Registry spinlock
//!
//! Test-and-set lock for critical sections that only splice or count list
//! nodes. A waiter issues a pause hint on every failed attempt and hands the
//! CPU back to the OS scheduler after `yield_after` consecutive failures, so
//! an oversubscribed machine never burns a full quantum on a preempted holder.
//!
//! NOT intended for sections that do I/O or call user code.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::constants::SPIN_YIELD_THRESHOLD;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Give up the rest of this thread's time slice.
        #[inline]
        pub fn os_yield() {
            // Safety: sched_yield has no preconditions
            unsafe {
                libc::sched_yield();
            }
        }
    } else {
        /// Give up the rest of this thread's time slice.
        #[inline]
        pub fn os_yield() {
            std::thread::yield_now();
        }
    }
}

/// A test-and-set spinlock with OS-yield escalation
pub struct SpinLock<T> {
    locked: AtomicBool,
    yield_after: u32,
    data: UnsafeCell<T>,
}

// Safety: SpinLock provides exclusive access to T
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a lock that yields after [`SPIN_YIELD_THRESHOLD`] failed attempts
    #[inline]
    pub const fn new(value: T) -> Self {
        Self::with_yield_threshold(value, SPIN_YIELD_THRESHOLD)
    }

    /// Create a lock with a custom yield threshold (clamped to at least 1)
    #[inline]
    pub const fn with_yield_threshold(value: T, yield_after: u32) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            yield_after: if yield_after == 0 { 1 } else { yield_after },
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning (and periodically yielding) until available
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let mut spins = 0u32;
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
            spins += 1;
            if spins >= self.yield_after {
                os_yield();
                spins = 0;
            }
        }
        SpinLockGuard { lock: self }
    }

    /// Try to acquire the lock without spinning
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(SpinLockGuard { lock: self })
        }
    }

    /// Check if the lock is currently held
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Failed attempts tolerated before yielding to the OS
    #[inline]
    pub fn yield_threshold(&self) -> u32 {
        self.yield_after
    }

    /// Exclusive access through `&mut self`; no locking needed
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

/// Guard that releases the spinlock when dropped
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: We hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: We hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
