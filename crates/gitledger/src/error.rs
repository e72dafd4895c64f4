//! Causal-chain errors
//!
//! A [`LedgerError`] is an owning handle on a refcounted block allocated
//! through its context's allocator. The block keeps an allocator snapshot so
//! it can free itself after the context is gone, a weak link back to the
//! context for registry bookkeeping, and a strong reference on its cause.
//!
//! Releasing the last reference walks the cause chain iteratively, so
//! arbitrarily deep chains never grow the native stack.

use core::fmt::{self, Write as _};
use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use gitledger_core::gl_warn;
use gitledger_core::{AllocError, Allocator, CoreError, CoreResult, RawBuf};

use crate::cache::{self, JsonCache};
use crate::codes::{Code, Domain, Flags};
use crate::context::{Context, ContextBlock};
use crate::location::SourceLocation;

// ── Block ─────────────────────────────────────────────────────────

pub(crate) struct ErrorBlock {
    /// Weak link; null once detached.
    pub(crate) ctx: AtomicPtr<ContextBlock>,
    refcount: AtomicU32,
    allocator: Allocator,
    domain: Domain,
    code: Code,
    flags: Flags,
    message: RawBuf,
    cause: Option<LedgerError>,
    location: Option<SourceLocation>,
    pub(crate) json_cache: AtomicPtr<JsonCache>,
    /// Caches swapped out by generation changes, kept until teardown so
    /// previously returned `&str`s stay valid.
    pub(crate) retired: AtomicPtr<JsonCache>,
}

impl ErrorBlock {
    /// Sever the link to the owning context.
    pub(crate) fn detach_context(&self) {
        self.ctx.store(ptr::null_mut(), Ordering::Release);
    }

    /// The owning context while attached.
    #[inline]
    pub(crate) fn context(&self) -> Option<&ContextBlock> {
        // Safety: an attached error is registered, and a registered error
        // keeps its context from being destroyed
        unsafe { self.ctx.load(Ordering::Acquire).as_ref() }
    }

    /// Free everything the block owns, then the block itself.
    ///
    /// # Safety
    ///
    /// Caller holds the last reference; the block is already unregistered
    /// and its cause has been taken.
    unsafe fn destroy(block: NonNull<ErrorBlock>) {
        let this = &*block.as_ptr();
        let allocator = this.allocator.clone();
        this.detach_context();
        cache::dispose(this, &allocator);
        allocator.free_buf(ptr::read(&this.message));
        allocator.free_value(block);
    }
}

// ── Message formatting ────────────────────────────────────────────

struct Measure(usize);

impl fmt::Write for Measure {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0 = self.0.saturating_add(s.len());
        Ok(())
    }
}

struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl fmt::Write for SliceWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.pos;
        if s.len() <= room {
            self.buf[self.pos..self.pos + s.len()].copy_from_slice(s.as_bytes());
            self.pos += s.len();
            return Ok(());
        }
        // Output grew between passes; keep a valid UTF-8 prefix
        let mut cut = room;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        self.buf[self.pos..self.pos + cut].copy_from_slice(&s.as_bytes()[..cut]);
        self.pos += cut;
        Err(fmt::Error)
    }
}

/// Measure, allocate, then write the formatted message.
fn format_message(allocator: &Allocator, args: fmt::Arguments<'_>) -> CoreResult<RawBuf> {
    let mut measure = Measure(0);
    measure.write_fmt(args).map_err(|_| CoreError::Format)?;

    let mut buf = allocator.alloc_buf(measure.0).ok_or(AllocError::Message)?;
    let mut writer = SliceWriter { buf: buf.as_mut_bytes(), pos: 0 };
    let _ = writer.write_fmt(args);
    let written = writer.pos;
    buf.truncate(written);
    Ok(buf)
}

// ── Handle ────────────────────────────────────────────────────────

/// Owning handle on an immutable diagnostic error. Each handle is one
/// reference; clone to share, drop to release.
pub struct LedgerError {
    ptr: NonNull<ErrorBlock>,
}

// Safety: content is immutable after construction; the refcount, cache
// and context link are atomics
unsafe impl Send for LedgerError {}
unsafe impl Sync for LedgerError {}

impl LedgerError {
    /// Build an error without a cause. See [`LedgerError::create_with_cause`].
    pub fn create(
        ctx: &Context,
        domain: Domain,
        code: Code,
        location: Option<SourceLocation>,
        args: fmt::Arguments<'_>,
    ) -> CoreResult<LedgerError> {
        Self::build(ctx, domain, code, None, location, args)
    }

    /// Build an error that retains `cause`.
    ///
    /// Allocation order is error block, message, registry node. If the
    /// registry node cannot be allocated the error is still returned,
    /// detached from `ctx`; it renders as `{}` and frees through its own
    /// allocator snapshot.
    pub fn create_with_cause<'c>(
        ctx: &Context,
        domain: Domain,
        code: Code,
        cause: impl Into<Option<&'c LedgerError>>,
        location: Option<SourceLocation>,
        args: fmt::Arguments<'_>,
    ) -> CoreResult<LedgerError> {
        Self::build(ctx, domain, code, cause.into(), location, args)
    }

    fn build(
        ctx: &Context,
        domain: Domain,
        code: Code,
        cause: Option<&LedgerError>,
        location: Option<SourceLocation>,
        args: fmt::Arguments<'_>,
    ) -> CoreResult<LedgerError> {
        if !ctx.is_valid() {
            return Err(CoreError::InvalidContext);
        }
        let owner = ctx.block();
        let allocator = owner.allocator().clone();

        let slot = allocator.alloc_block::<ErrorBlock>().ok_or(AllocError::ErrorBlock)?;
        let message = match format_message(&allocator, args) {
            Ok(message) => message,
            Err(e) => {
                // Safety: slot is fresh and uninitialised
                unsafe { allocator.free_block(slot) };
                return Err(e);
            }
        };

        let block = ErrorBlock {
            ctx: AtomicPtr::new(ctx.raw().as_ptr()),
            refcount: AtomicU32::new(1),
            allocator,
            domain,
            code,
            flags: Flags::default_for(domain, code),
            message,
            cause: cause.map(LedgerError::retain),
            location,
            json_cache: AtomicPtr::new(ptr::null_mut()),
            retired: AtomicPtr::new(ptr::null_mut()),
        };
        // Safety: slot is sized and aligned for ErrorBlock
        unsafe { slot.as_ptr().write(block) };
        let err = LedgerError { ptr: slot };

        if !owner.track_error(slot) {
            gl_warn!(
                "registry node allocation failed, {}/{} error left detached",
                domain,
                code
            );
            err.block().detach_context();
        }
        Ok(err)
    }

    #[inline]
    pub(crate) fn block(&self) -> &ErrorBlock {
        // Safety: this handle holds a reference
        unsafe { self.ptr.as_ref() }
    }

    fn into_raw(self) -> NonNull<ErrorBlock> {
        let ptr = self.ptr;
        mem::forget(self);
        ptr
    }

    /// Take another reference.
    #[inline]
    pub fn retain(&self) -> LedgerError {
        self.block().refcount.fetch_add(1, Ordering::Relaxed);
        LedgerError { ptr: self.ptr }
    }

    /// Give up this reference. Same as dropping the handle.
    #[inline]
    pub fn release(self) {
        drop(self)
    }

    pub fn ref_count(&self) -> u32 {
        self.block().refcount.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn ptr_eq(a: &LedgerError, b: &LedgerError) -> bool {
        a.ptr == b.ptr
    }

    // ── Accessors ─────────────────────────────────────────────────

    #[inline]
    pub fn domain(&self) -> Domain {
        self.block().domain
    }

    #[inline]
    pub fn code(&self) -> Code {
        self.block().code
    }

    #[inline]
    pub fn flags(&self) -> Flags {
        self.block().flags
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.flags().contains(Flags::RETRYABLE)
    }

    #[inline]
    pub fn is_permanent(&self) -> bool {
        self.flags().contains(Flags::PERMANENT)
    }

    /// The formatted message. Empty if it was built empty.
    pub fn message(&self) -> &str {
        core::str::from_utf8(self.block().message.as_bytes()).unwrap_or("")
    }

    #[inline]
    pub fn cause(&self) -> Option<&LedgerError> {
        self.block().cause.as_ref()
    }

    #[inline]
    pub fn location(&self) -> Option<SourceLocation> {
        self.block().location
    }

    pub fn file(&self) -> Option<&'static str> {
        self.location().map(|loc| loc.file)
    }

    /// Source line, 0 when no location was captured.
    pub fn line(&self) -> u32 {
        self.location().map_or(0, |loc| loc.line)
    }

    pub fn func(&self) -> Option<&'static str> {
        self.location().and_then(|loc| loc.func)
    }

    /// True while the error is linked into a live context's registry.
    pub fn is_attached(&self) -> bool {
        !self.block().ctx.load(Ordering::Acquire).is_null()
    }
}

/// Release one reference on `start`, continuing down the cause chain for
/// every block whose count reaches zero.
///
/// # Safety
///
/// The caller gives up one reference on `start`.
unsafe fn release_chain(start: NonNull<ErrorBlock>) {
    let mut current = start;
    loop {
        let block = current.as_ptr();
        if (*block).refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if let Some(ctx) = (*block).context() {
            ctx.untrack_error(current);
        }
        let next = (*block).cause.take().map(LedgerError::into_raw);
        ErrorBlock::destroy(current);
        match next {
            Some(next) => current = next,
            None => return,
        }
    }
}

impl Clone for LedgerError {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl Drop for LedgerError {
    fn drop(&mut self) {
        // Safety: drop gives up this handle's reference
        unsafe { release_chain(self.ptr) }
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {}", self.domain(), self.code(), self.message())?;
        if f.alternate() {
            if let Some(loc) = self.location() {
                write!(f, " at {}", loc)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("LedgerError");
        s.field("domain", &self.domain())
            .field("code", &self.code())
            .field("flags", &self.flags())
            .field("message", &self.message());
        if let Some(loc) = self.location() {
            s.field("location", &format_args!("{}", loc));
        }
        // Immediate cause only; chains can be deep
        if let Some(cause) = self.cause() {
            s.field("cause", &format_args!("{}", cause));
        }
        s.finish()
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause().map(|c| c as &(dyn std::error::Error + 'static))
    }
}
