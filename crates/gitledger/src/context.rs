//! Diagnostic context
//!
//! A [`Context`] owns the allocator every error built against it uses, a
//! registry of the errors currently alive, and a generation counter that
//! invalidates their cached JSON.
//!
//! ```text
//!  Context (handle) ──► ContextBlock
//!                       ├─ tag         validity stamp, cleared at destruction
//!                       ├─ refcount    one per handle
//!                       ├─ generation  bumped on every teardown attempt
//!                       ├─ allocator   shared backend
//!                       └─ registry ─► node ─► node ─► ...   (SpinLock)
//!                                      │        │
//!                                      ▼        ▼
//!                                   ErrorBlock ErrorBlock   (weak links)
//! ```
//!
//! Errors point back at the block without holding a reference. That link is
//! only dereferenced while the error sits in the registry, and a context is
//! only destroyed once the registry is empty.

use core::alloc::Layout;
use core::fmt;
use core::mem::{self, ManuallyDrop};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use gitledger_core::constants::{CONTEXT_TAG, INITIAL_GENERATION};
use gitledger_core::{gl_debug, gl_error, gl_warn};
use gitledger_core::{AllocError, Allocator, ContextConfig, CoreResult, SpinLock};
#[cfg(test)]
use gitledger_core::CoreError;

use crate::error::ErrorBlock;
use crate::policy::{teardown_verdict, Verdict, DIAGNOSTICS_BUILD};

// ── Registry ──────────────────────────────────────────────────────

struct RegistryNode {
    error: NonNull<ErrorBlock>,
    next: Option<NonNull<RegistryNode>>,
}

#[derive(Default)]
struct Registry {
    head: Option<NonNull<RegistryNode>>,
}

// Safety: nodes are only reached through the registry lock
unsafe impl Send for Registry {}

// ── Block ─────────────────────────────────────────────────────────

pub(crate) struct ContextBlock {
    tag: AtomicU32,
    refcount: AtomicU32,
    generation: AtomicU32,
    allocator: Allocator,
    registry: SpinLock<Registry>,
}

impl ContextBlock {
    #[inline]
    pub(crate) fn is_valid(&self) -> bool {
        self.tag.load(Ordering::Acquire) == CONTEXT_TAG
    }

    #[inline]
    pub(crate) fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Current generation, or 0 for an invalid block.
    #[inline]
    pub(crate) fn generation_snapshot(&self) -> u32 {
        if !self.is_valid() {
            return 0;
        }
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Link `error` into the registry. Returns false if the node could not
    /// be allocated; the error is then not tracked.
    pub(crate) fn track_error(&self, error: NonNull<ErrorBlock>) -> bool {
        if !self.is_valid() {
            return false;
        }
        let node = match self.allocator.alloc_value(RegistryNode { error, next: None }) {
            Some(node) => node,
            None => return false,
        };
        let mut registry = self.registry.lock();
        // Safety: node is fresh and not yet shared
        unsafe { (*node.as_ptr()).next = registry.head };
        registry.head = Some(node);
        true
    }

    /// Unlink `error` if present and free its node.
    ///
    /// The node is freed before the lock is released. Once the guard drops,
    /// a concurrent teardown may see an empty registry and free `self`.
    pub(crate) fn untrack_error(&self, error: NonNull<ErrorBlock>) {
        let mut registry = self.registry.lock();
        let mut link: *mut Option<NonNull<RegistryNode>> = &mut registry.head;
        loop {
            // Safety: link points at the head slot or at a node's next slot,
            // both owned by the locked registry
            match unsafe { *link } {
                None => return,
                Some(node) => {
                    let node_ptr = node.as_ptr();
                    if unsafe { (*node_ptr).error } == error {
                        unsafe {
                            *link = (*node_ptr).next;
                            // Safety: node came from track_error and is now
                            // unlinked
                            self.allocator.free_block(node);
                        }
                        return;
                    }
                    link = unsafe { &mut (*node_ptr).next };
                }
            }
        }
    }

    pub(crate) fn live_count(&self) -> usize {
        let registry = self.registry.lock();
        let mut count = 0usize;
        let mut cursor = registry.head;
        while let Some(node) = cursor {
            count += 1;
            // Safety: nodes stay alive while the lock is held
            cursor = unsafe { node.as_ref().next };
        }
        count
    }

    /// Empty the registry, detaching every listed error from this context.
    pub(crate) fn detach_registry(&self) -> usize {
        let mut cursor = self.registry.lock().head.take();
        let mut detached = 0usize;
        while let Some(node) = cursor {
            // Safety: the list was taken out of the registry, so these nodes
            // are exclusively ours. Listed errors are still alive, since a
            // dying error unlinks itself before its block is freed.
            unsafe {
                cursor = node.as_ref().next;
                node.as_ref().error.as_ref().detach_context();
                self.allocator.free_block(node);
            }
            detached += 1;
        }
        detached
    }

    /// Drop one reference.
    ///
    /// # Safety
    ///
    /// `block` must point at a block that this call holds a reference on.
    unsafe fn release(block: NonNull<ContextBlock>, diagnostics: bool) -> Release {
        let this = block.as_ref();
        if !this.is_valid() {
            return Release::Invalid;
        }
        if this.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return Release::Retained;
        }
        Self::destroy(block, diagnostics)
    }

    unsafe fn destroy(block: NonNull<ContextBlock>, diagnostics: bool) -> Release {
        let this = block.as_ref();
        let live = this.live_count();
        this.bump_generation();

        match teardown_verdict(diagnostics, live) {
            Verdict::Proceed => {}
            Verdict::Abort => {
                gl_error!("{} live error(s) at context teardown, aborting", live);
                std::process::abort();
            }
            Verdict::Refuse => {
                gl_error!("{} live error(s) at context teardown", live);
                gl_warn!("context teardown refused, reference restored");
                this.refcount.fetch_add(1, Ordering::AcqRel);
                return Release::Refused(Context { block });
            }
        }

        let detached = this.detach_registry();
        if detached > 0 {
            gl_warn!("detached {} error(s) registered during teardown", detached);
        }
        this.tag.store(0, Ordering::Release);

        let allocator = this.allocator.clone();
        allocator.free_value(block);
        gl_debug!("context destroyed");
        Release::Destroyed
    }
}

// ── Handle ────────────────────────────────────────────────────────

/// Owning handle on a diagnostic context. Each handle is one reference.
///
/// Dropping the last handle tears the context down. With errors still
/// alive, a diagnostics build aborts the process; a release build logs the
/// violation and leaks the context rather than free memory errors still
/// point at. Use [`Context::try_release`] to observe the outcome instead.
pub struct Context {
    block: NonNull<ContextBlock>,
}

// Safety: all shared state in the block is atomic or behind the spinlock
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

/// Outcome of [`Context::try_release`].
#[derive(Debug)]
pub enum Release {
    /// That was the last reference and the context is gone.
    Destroyed,
    /// Other references remain.
    Retained,
    /// Last reference, but errors were still alive. The reference is
    /// restored and handed back.
    Refused(Context),
    /// The handle failed its validity check; nothing was done.
    Invalid,
}

impl Context {
    /// Context over the system allocator.
    pub fn new() -> CoreResult<Context> {
        Self::with_config(ContextConfig::default())
    }

    /// Context over a caller-supplied allocator.
    pub fn with_allocator(allocator: Allocator) -> CoreResult<Context> {
        Self::with_config(ContextConfig::new().allocator(allocator))
    }

    pub fn with_config(config: ContextConfig) -> CoreResult<Context> {
        config.validate()?;
        let ContextConfig { allocator, spin_yield_threshold } = config;

        let block = ContextBlock {
            tag: AtomicU32::new(CONTEXT_TAG),
            refcount: AtomicU32::new(1),
            generation: AtomicU32::new(INITIAL_GENERATION),
            allocator: allocator.clone(),
            registry: SpinLock::with_yield_threshold(Registry::default(), spin_yield_threshold),
        };
        let block = allocator.alloc_value(block).ok_or(AllocError::ContextBlock)?;
        gl_debug!("context created");
        Ok(Context { block })
    }

    #[inline]
    pub(crate) fn block(&self) -> &ContextBlock {
        // Safety: this handle holds a reference, so the block is alive
        unsafe { self.block.as_ref() }
    }

    #[inline]
    pub(crate) fn raw(&self) -> NonNull<ContextBlock> {
        self.block
    }

    /// True while the context has not been destroyed.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.block().is_valid()
    }

    /// Take another reference. A no-op on the count if the handle is invalid.
    pub fn retain(&self) -> Context {
        let block = self.block();
        if block.is_valid() {
            block.refcount.fetch_add(1, Ordering::Relaxed);
        }
        Context { block: self.block }
    }

    /// Give up this handle's reference and report what happened.
    pub fn try_release(self) -> Release {
        self.try_release_with(DIAGNOSTICS_BUILD)
    }

    pub(crate) fn try_release_with(self, diagnostics: bool) -> Release {
        let this = ManuallyDrop::new(self);
        // Safety: the handle's reference is consumed here and never again
        unsafe { ContextBlock::release(this.block, diagnostics) }
    }

    #[inline]
    pub fn allocator(&self) -> &Allocator {
        self.block().allocator()
    }

    /// Allocate through the bound allocator. `None` on an invalid context.
    pub fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if !self.is_valid() {
            return None;
        }
        self.allocator().allocate(layout)
    }

    /// Free memory obtained from [`Context::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this context with the same `layout`.
    pub unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        if self.is_valid() {
            self.allocator().free(ptr, layout);
        }
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.block().generation_snapshot()
    }

    /// Number of errors currently registered.
    pub fn live_errors(&self) -> usize {
        self.block().live_count()
    }

    pub fn ref_count(&self) -> u32 {
        self.block().refcount.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn ptr_eq(a: &Context, b: &Context) -> bool {
        a.block == b.block
    }
}

impl Clone for Context {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Safety: drop consumes this handle's reference
        let released = unsafe { ContextBlock::release(self.block, DIAGNOSTICS_BUILD) };
        if let Release::Refused(ctx) = released {
            gl_warn!("context dropped with live errors, leaking it");
            mem::forget(ctx);
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("valid", &self.is_valid())
            .field("refcount", &self.ref_count())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingAllocator, FailingAllocator, PoisoningAllocator};
    use crate::{Code, Domain};
    use std::process::{Command, Stdio};
    use std::sync::Barrier;

    #[test]
    fn fresh_context_state() {
        let ctx = Context::new().unwrap();
        assert!(ctx.is_valid());
        assert_eq!(ctx.generation(), INITIAL_GENERATION);
        assert_eq!(ctx.live_errors(), 0);
        assert_eq!(ctx.ref_count(), 1);
        assert!(matches!(ctx.try_release(), Release::Destroyed));
    }

    #[test]
    fn retain_and_release_are_counted() {
        let ctx = Context::new().unwrap();
        let other = ctx.retain();
        let third = ctx.clone();
        assert!(Context::ptr_eq(&ctx, &other));
        assert_eq!(ctx.ref_count(), 3);
        assert!(matches!(other.try_release(), Release::Retained));
        assert!(matches!(third.try_release(), Release::Retained));
        assert!(matches!(ctx.try_release(), Release::Destroyed));
    }

    #[test]
    fn context_block_comes_from_bound_allocator() {
        let (tally, allocator) = CountingAllocator::shared();
        let ctx = Context::with_allocator(allocator).unwrap();
        assert_eq!(tally.allocs(), 1);
        assert!(matches!(ctx.try_release(), Release::Destroyed));
        assert_eq!(tally.frees(), 1);
        assert!(tally.balanced());
    }

    #[test]
    fn allocate_and_free_route_through_backend() {
        let (tally, allocator) = CountingAllocator::shared();
        let ctx = Context::with_allocator(allocator).unwrap();
        let layout = Layout::from_size_align(32, 8).unwrap();
        let p = ctx.allocate(layout).unwrap();
        unsafe { ctx.free(p, layout) };
        drop(ctx);
        assert_eq!(tally.allocs(), 2);
        assert!(tally.balanced());
    }

    #[test]
    fn context_allocation_failure_is_reported() {
        let (_probe, allocator) = FailingAllocator::shared(1);
        let err = Context::with_allocator(allocator).unwrap_err();
        assert_eq!(err, CoreError::Alloc(AllocError::ContextBlock));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ContextConfig::new().spin_yield_threshold(0);
        assert!(Context::with_config(config).is_err());
    }

    #[test]
    fn registry_tracks_live_errors() {
        let ctx = Context::new().unwrap();
        let a = crate::ledger_error!(&ctx, Domain::Git, Code::NotFound, "a").unwrap();
        let b = crate::ledger_error!(&ctx, Domain::Git, Code::NotFound, "b").unwrap();
        let c = crate::ledger_error!(&ctx, Domain::Git, Code::NotFound, "c").unwrap();
        assert_eq!(ctx.live_errors(), 3);
        // Unlink from the middle, then head, then tail
        drop(b);
        assert_eq!(ctx.live_errors(), 2);
        drop(c);
        drop(a);
        assert_eq!(ctx.live_errors(), 0);
    }

    #[test]
    fn refused_teardown_restores_reference_and_bumps_generation() {
        let ctx = Context::new().unwrap();
        let err =
            crate::ledger_error!(&ctx, Domain::Policy, Code::PolicyViolation, "held").unwrap();
        let before = ctx.generation();

        let ctx = match ctx.try_release_with(false) {
            Release::Refused(ctx) => ctx,
            other => panic!("expected refusal, got {:?}", other),
        };
        assert!(ctx.is_valid());
        assert_eq!(ctx.ref_count(), 1);
        assert_eq!(ctx.generation(), before + 1);
        assert!(err.is_attached());
        assert_eq!(ctx.live_errors(), 1);

        drop(err);
        assert!(matches!(ctx.try_release_with(false), Release::Destroyed));
    }

    #[test]
    fn refused_teardown_is_logged() {
        let ctx = Context::new().unwrap();
        let err = crate::ledger_error!(&ctx, Domain::Git, Code::Conflict, "held").unwrap();

        gitledger_core::log::capture_begin();
        let ctx = match ctx.try_release_with(false) {
            Release::Refused(ctx) => ctx,
            other => panic!("expected refusal, got {:?}", other),
        };
        let lines = gitledger_core::log::capture_take();
        let reported = "1 live error(s) at context teardown";
        assert!(lines.iter().any(|l| l.starts_with("[ERROR]") && l.contains(reported)));
        assert!(lines.iter().any(|l| l.starts_with("[WARN ]") && l.contains("teardown refused")));

        drop(err);
        assert!(matches!(ctx.try_release_with(false), Release::Destroyed));
    }

    #[cfg(not(debug_assertions))]
    #[test]
    fn release_build_refuses_through_public_api() {
        let ctx = Context::new().unwrap();
        let err = crate::ledger_error!(&ctx, Domain::Io, Code::IoError, "pending").unwrap();
        let ctx = match ctx.try_release() {
            Release::Refused(ctx) => ctx,
            other => panic!("expected refusal, got {:?}", other),
        };
        drop(err);
        assert!(matches!(ctx.try_release(), Release::Destroyed));
    }

    #[test]
    fn detached_registry_lets_teardown_proceed() {
        let (tally, allocator) = CountingAllocator::shared();
        let ctx = Context::with_allocator(allocator).unwrap();
        let err =
            crate::ledger_error!(&ctx, Domain::Trust, Code::TrustViolation, "orphan").unwrap();

        assert_eq!(ctx.block().detach_registry(), 1);
        assert!(!err.is_attached());
        assert!(matches!(ctx.try_release(), Release::Destroyed));

        // The error still reads and frees through its allocator snapshot
        assert_eq!(err.message(), "orphan");
        drop(err);
        assert!(tally.balanced());
    }

    #[test]
    fn concurrent_create_and_release_keeps_registry_consistent() {
        let (tally, allocator) = CountingAllocator::shared();
        let config = ContextConfig::new().allocator(allocator).spin_yield_threshold(1);
        let ctx = Context::with_config(config).unwrap();

        std::thread::scope(|s| {
            for t in 0..8 {
                let ctx = &ctx;
                s.spawn(move || {
                    let mut held = Vec::new();
                    for i in 0..200 {
                        let e = crate::ledger_error!(
                            ctx,
                            Domain::Io,
                            Code::IoError,
                            "t{} #{}",
                            t,
                            i,
                        )
                        .unwrap();
                        if i % 3 == 0 {
                            held.push(e);
                        }
                    }
                });
            }
        });

        assert_eq!(ctx.live_errors(), 0);
        assert!(matches!(ctx.try_release(), Release::Destroyed));
        assert!(tally.balanced());
    }

    #[test]
    fn error_drop_races_context_teardown() {
        let (tally, allocator) = PoisoningAllocator::shared();
        for i in 0..500 {
            let ctx = Context::with_allocator(allocator.clone()).unwrap();
            let err =
                crate::ledger_error!(&ctx, Domain::Git, Code::NotFound, "race {}", i).unwrap();
            let barrier = Barrier::new(2);

            std::thread::scope(|s| {
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    drop(err);
                });
                s.spawn(move || {
                    barrier.wait();
                    let mut ctx = ctx;
                    loop {
                        match ctx.try_release_with(false) {
                            Release::Refused(back) => {
                                ctx = back;
                                std::thread::yield_now();
                            }
                            Release::Destroyed => break,
                            other => panic!("unexpected release outcome {:?}", other),
                        }
                    }
                });
            });
        }
        assert!(tally.balanced());
    }

    #[test]
    #[ignore = "spawned by teardown_with_live_errors_aborts_in_diagnostics_build"]
    fn abort_child() {
        if std::env::var_os("GL_ABORT_CHILD").is_none() {
            return;
        }
        let ctx = Context::new().unwrap();
        let _live = crate::ledger_error!(&ctx, Domain::Generic, Code::Unknown, "live").unwrap();
        let _ = ctx.try_release_with(true);
    }

    #[test]
    fn teardown_with_live_errors_aborts_in_diagnostics_build() {
        let exe = std::env::current_exe().unwrap();
        let status = Command::new(exe)
            .args(["--ignored", "--exact", "context::tests::abort_child", "--test-threads=1"])
            .env("GL_ABORT_CHILD", "1")
            .env("GL_LOG_LEVEL", "off")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(!status.success());
    }
}
