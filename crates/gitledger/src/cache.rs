//! Lazily published JSON and caller-owned copies
//!
//! The first [`LedgerError::json`] call renders the chain into a buffer from
//! the context's allocator and publishes it with a compare-and-swap; racing
//! builders free their own buffer and return the winner's. Each cache is
//! stamped with the context generation it was built under. A stale one is
//! taken out with a compare-and-swap, so exactly one caller retires it, and
//! parked on a retired list until the error itself is torn down, so a `&str`
//! handed out earlier never dangles.

use core::fmt;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering;

use gitledger_core::{AllocError, Allocator, CoreError, CoreResult, RawBuf};

use crate::context::{Context, ContextBlock};
use crate::error::{ErrorBlock, LedgerError};

const EMPTY_OBJECT: &str = "{}";

pub(crate) struct JsonCache {
    /// Context generation this rendering belongs to.
    generation: u32,
    /// Always valid UTF-8; checked before publication.
    text: RawBuf,
    next: *mut JsonCache,
}

impl JsonCache {
    #[inline]
    fn as_str(&self) -> &str {
        // Safety: only UTF-8 text is ever published
        unsafe { core::str::from_utf8_unchecked(self.text.as_bytes()) }
    }
}

/// Move `node` onto the error's retired list.
fn retire(block: &ErrorBlock, node: *mut JsonCache) {
    let mut head = block.retired.load(Ordering::Relaxed);
    loop {
        // Safety: node was swapped out of json_cache, so this thread owns its
        // link field; readers only touch the text
        unsafe { ptr::addr_of_mut!((*node).next).write(head) };
        match block
            .retired
            .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
        {
            Ok(_) => return,
            Err(current) => head = current,
        }
    }
}

/// Take `stale` out of the cache slot. Only the caller whose swap lands
/// retires it; everyone else finds the slot already cleared or refilled.
fn evict(block: &ErrorBlock, stale: *mut JsonCache) {
    if block
        .json_cache
        .compare_exchange(stale, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        retire(block, stale);
    }
}

/// Free one cache node.
///
/// # Safety
///
/// `node` is null or an unpublished/unreachable node from `allocator`.
unsafe fn free_node(allocator: &Allocator, node: *mut JsonCache) {
    if let Some(node) = NonNull::new(node) {
        allocator.free_buf(ptr::read(&(*node.as_ptr()).text));
        allocator.free_block(node);
    }
}

/// Free the live cache and every retired one.
///
/// # Safety
///
/// Only called from error teardown, when no reader can remain.
pub(crate) unsafe fn dispose(block: &ErrorBlock, allocator: &Allocator) {
    free_node(allocator, block.json_cache.swap(ptr::null_mut(), Ordering::AcqRel));
    let mut node = block.retired.swap(ptr::null_mut(), Ordering::AcqRel);
    while !node.is_null() {
        let next = (*node).next;
        free_node(allocator, node);
        node = next;
    }
}

impl LedgerError {
    /// JSON for this chain, built on first use and cached on the error.
    ///
    /// A cache built under an older context generation is replaced on the
    /// next call. The replaced buffer is kept until the error is torn down,
    /// since earlier callers may still hold the returned `&str`, so every
    /// refused teardown followed by a `json()` call grows the error by one
    /// rendering.
    ///
    /// Returns the last cache when the error has been detached from its
    /// context, and `{}` when there is none or it cannot be built.
    pub fn json(&self) -> &str {
        let block = self.block();
        let cached = block.json_cache.load(Ordering::Acquire);
        let ctx = match block.context() {
            Some(ctx) => ctx,
            // Safety: published caches live until the error is torn down
            None => return unsafe { cached.as_ref() }.map_or(EMPTY_OBJECT, JsonCache::as_str),
        };
        let current = ctx.generation_snapshot();

        // Safety: as above
        if let Some(node) = unsafe { cached.as_ref() } {
            if node.generation == current {
                return node.as_str();
            }
            evict(block, cached);
        }
        self.build_cache(ctx, current).unwrap_or(EMPTY_OBJECT)
    }

    fn build_cache(&self, ctx: &ContextBlock, generation: u32) -> Option<&str> {
        let required = self.render_json(&mut []);
        if required == usize::MAX {
            return None;
        }
        let allocator = ctx.allocator();

        let node = allocator.alloc_block::<JsonCache>()?;
        let mut text = match allocator.alloc_buf(required - 1) {
            Some(text) => text,
            None => {
                // Safety: node is fresh and uninitialised
                unsafe { allocator.free_block(node) };
                return None;
            }
        };
        self.render_json(text.as_mut_capacity());
        if core::str::from_utf8(text.as_bytes()).is_err() {
            // Safety: neither allocation has been shared
            unsafe {
                allocator.free_buf(text);
                allocator.free_block(node);
            }
            return None;
        }
        // Safety: node is sized and aligned for JsonCache
        unsafe {
            node.as_ptr().write(JsonCache {
                generation,
                text,
                next: ptr::null_mut(),
            })
        };

        let block = self.block();
        match block.json_cache.compare_exchange(
            ptr::null_mut(),
            node.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // Safety: published; lives until error teardown
            Ok(_) => Some(unsafe { (*node.as_ptr()).as_str() }),
            Err(winner) => {
                // Safety: our node never became visible; the winner's did
                unsafe {
                    free_node(allocator, node.as_ptr());
                    winner.as_ref().map(JsonCache::as_str)
                }
            }
        }
    }
}

// ── Caller-owned copies ───────────────────────────────────────────

/// Text allocated through a context's allocator and owned by the caller.
///
/// Frees itself through an allocator snapshot, so it may outlive both the
/// error and the context it was copied from.
pub struct LedgerString {
    buf: RawBuf,
    allocator: Allocator,
}

impl LedgerString {
    fn copy_in(allocator: &Allocator, text: &str) -> CoreResult<LedgerString> {
        let buf = allocator.alloc_copy(text.as_bytes()).ok_or(AllocError::Copy)?;
        Ok(LedgerString { buf, allocator: allocator.clone() })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        // Safety: built from a &str in copy_in
        unsafe { core::str::from_utf8_unchecked(self.buf.as_bytes()) }
    }

    /// Content followed by its NUL terminator.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        // Safety: the terminator slot sits right after the content
        unsafe { core::slice::from_raw_parts(self.buf.as_ptr(), self.buf.len() + 1) }
    }
}

impl Drop for LedgerString {
    fn drop(&mut self) {
        // Safety: buf came from this allocator and is read out exactly once
        unsafe { self.allocator.free_buf(ptr::read(&self.buf)) }
    }
}

impl Deref for LedgerString {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for LedgerString {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<str> for LedgerString {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for LedgerString {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl fmt::Display for LedgerString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for LedgerString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

/// Copy of `err`'s JSON, allocated through `ctx`'s allocator.
pub fn json_copy(ctx: &Context, err: &LedgerError) -> CoreResult<LedgerString> {
    if !ctx.is_valid() {
        return Err(CoreError::InvalidContext);
    }
    LedgerString::copy_in(ctx.allocator(), err.json())
}

/// Copy of `err`'s message, allocated through `ctx`'s allocator.
pub fn message_copy(ctx: &Context, err: &LedgerError) -> CoreResult<LedgerString> {
    if !ctx.is_valid() {
        return Err(CoreError::InvalidContext);
    }
    LedgerString::copy_in(ctx.allocator(), err.message())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingAllocator;
    use crate::{Code, Domain, Release};

    #[test]
    fn json_is_cached_and_stable() {
        let ctx = Context::new().unwrap();
        let err = crate::ledger_error!(&ctx, Domain::Git, Code::Conflict, "stale ref").unwrap();
        let first = err.json();
        let second = err.json();
        assert_eq!(first.as_ptr(), second.as_ptr());
        assert_eq!(first, err.to_json_string());
    }

    #[test]
    fn policy_blocking_missing_object() {
        let ctx = Context::new().unwrap();
        let l = crate::ledger_error!(
            &ctx,
            Domain::Git,
            Code::NotFound,
            "Object {} not found",
            "abc123",
        )
        .unwrap();
        let r = crate::ledger_error_with_cause!(
            &ctx,
            Domain::Policy,
            Code::PolicyViolation,
            &l,
            "Policy blocked update for {}",
            "refs/main"
        )
        .unwrap();

        assert!(LedgerError::ptr_eq(r.cause().unwrap(), &l));
        assert!(r.flags().contains(crate::Flags::PERMANENT));
        let mut visited = 0;
        r.walk(|_| {
            visited += 1;
            true
        });
        assert_eq!(visited, 2);

        let json = r.json();
        assert!(json.starts_with('{'));
        assert!(json.contains(r#""domain":"POLICY""#));
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["cause"]["domain"], "GIT");
        assert_eq!(value["cause"]["message"], "Object abc123 not found");
    }

    #[test]
    fn cache_comes_from_context_allocator() {
        let (tally, allocator) = CountingAllocator::shared();
        let ctx = Context::with_allocator(allocator).unwrap();
        let err = crate::ledger_error!(&ctx, Domain::Git, Code::Conflict, "x").unwrap();
        let before = tally.allocs();
        err.json();
        assert_eq!(tally.allocs(), before + 2);
        err.json();
        assert_eq!(tally.allocs(), before + 2);
        drop(err);
        drop(ctx);
        assert!(tally.balanced());
    }

    #[test]
    fn generation_change_rebuilds_cache() {
        let (tally, allocator) = CountingAllocator::shared();
        let ctx = Context::with_allocator(allocator).unwrap();
        let err =
            crate::ledger_error!(&ctx, Domain::Policy, Code::PolicyViolation, "deny").unwrap();
        let old = err.json();
        let old_ptr = old.as_ptr();

        let ctx = match ctx.try_release_with(false) {
            Release::Refused(ctx) => ctx,
            other => panic!("expected refusal, got {:?}", other),
        };
        let fresh = err.json();
        assert_ne!(fresh.as_ptr(), old_ptr);
        assert_eq!(fresh, old);
        assert_eq!(err.json().as_ptr(), fresh.as_ptr());

        drop(err);
        assert!(matches!(ctx.try_release_with(false), Release::Destroyed));
        assert!(tally.balanced());
    }

    #[test]
    fn cache_survives_context_teardown() {
        let (tally, allocator) = CountingAllocator::shared();
        let ctx = Context::with_allocator(allocator).unwrap();
        let err = crate::ledger_error!(&ctx, Domain::Io, Code::IoError, "late reader").unwrap();
        let cached = err.json().as_ptr();

        ctx.block().detach_registry();
        assert!(matches!(ctx.try_release(), Release::Destroyed));
        assert_eq!(err.json().as_ptr(), cached);
        assert!(err.json().contains("late reader"));
        drop(err);
        assert!(tally.balanced());
    }

    #[test]
    fn detached_without_cache_renders_empty_object() {
        let ctx = Context::new().unwrap();
        let err = crate::ledger_error!(&ctx, Domain::Io, Code::IoError, "gone").unwrap();
        ctx.block().detach_registry();
        assert_eq!(err.json(), "{}");
    }

    #[test]
    fn concurrent_readers_see_one_cache() {
        let (tally, allocator) = CountingAllocator::shared();
        let ctx = Context::with_allocator(allocator).unwrap();
        let leaf = crate::ledger_error!(&ctx, Domain::Io, Code::IoError, "read").unwrap();
        let top = crate::ledger_error_with_cause!(&ctx, Domain::Git, Code::Conflict, &leaf, "merge")
            .unwrap();

        let seen: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| top.json().as_ptr() as usize))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let winner = top.json().as_ptr() as usize;
        assert!(seen.iter().all(|&p| p == winner));

        drop(top);
        drop(leaf);
        drop(ctx);
        assert!(tally.balanced());
    }

    #[test]
    fn concurrent_readers_agree_after_generation_bump() {
        let (tally, allocator) = CountingAllocator::shared();
        let ctx = Context::with_allocator(allocator).unwrap();
        let err = crate::ledger_error!(&ctx, Domain::Git, Code::Conflict, "diverged").unwrap();
        let old_ptr = err.json().as_ptr() as usize;

        let ctx = match ctx.try_release_with(false) {
            Release::Refused(ctx) => ctx,
            other => panic!("expected refusal, got {:?}", other),
        };
        let barrier = std::sync::Barrier::new(8);
        let seen: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        err.json().as_ptr() as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let fresh = err.json().as_ptr() as usize;
        assert_ne!(fresh, old_ptr);
        assert!(seen.iter().all(|&p| p == fresh));

        drop(err);
        assert!(matches!(ctx.try_release_with(false), Release::Destroyed));
        assert!(tally.balanced());
    }

    #[test]
    fn copies_are_independent() {
        let (tally, allocator) = CountingAllocator::shared();
        let ctx = Context::with_allocator(allocator).unwrap();
        let err =
            crate::ledger_error!(&ctx, Domain::Trust, Code::TrustViolation, "bad sig").unwrap();

        let json = json_copy(&ctx, &err).unwrap();
        let msg = message_copy(&ctx, &err).unwrap();
        assert_eq!(json.as_str(), err.json());
        assert_ne!(json.as_ptr(), err.json().as_ptr());
        assert_eq!(msg, "bad sig");
        assert_eq!(msg.as_bytes_with_nul(), b"bad sig\0");

        // Copies outlive both the error and the context
        drop(err);
        drop(ctx);
        assert_eq!(&*msg, "bad sig");
        drop(json);
        drop(msg);
        assert!(tally.balanced());
    }
}
