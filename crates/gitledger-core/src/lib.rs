//! # gitledger-core
//!
//! Platform-agnostic primitives underneath the gitledger diagnostic subsystem.
//!
//! Nothing in this crate knows what a context or an error chain is. It
//! provides the pieces those types are assembled from:
//!
//! ## Modules
//!
//! - `alloc` - Allocator capability and the byte buffers allocated through it
//! - `spinlock` - Test-and-set lock with OS-yield escalation
//! - `log` - Leveled stderr diagnostics (with a capture sink for tests)
//! - `config` - Context configuration and environment helpers
//! - `error` - Structural failure types

pub mod alloc;
pub mod spinlock;
pub mod log;
pub mod config;
pub mod error;

// Re-exports for convenience
pub use alloc::{Allocator, RawAllocator, RawBuf, SystemAllocator};
pub use spinlock::{SpinLock, SpinLockGuard};
pub use log::{set_log_level, Level};
pub use config::{env_get, env_get_bool, env_get_opt, ContextConfig};
pub use error::{AllocError, CoreError, CoreResult};

/// Layout and behaviour constants shared by the subsystem.
pub mod constants {
    /// Maximum causal depth visited by walks and rendered into JSON before
    /// a `truncated` marker is emitted.
    ///
    /// Changing this changes rendered output; downstream consumers may
    /// depend on the current value.
    pub const MAX_DEPTH: usize = 64;

    /// Frames held on the native stack by the JSON renderer before it
    /// reaches for a heap-allocated frame stack.
    pub const JSON_STATIC_STACK_DEPTH: usize = 16;

    /// Failed lock attempts before a spinning thread yields to the OS.
    pub const SPIN_YIELD_THRESHOLD: u32 = 64;

    /// Validity tag stamped on a live context block; cleared at destruction.
    pub const CONTEXT_TAG: u32 = 0xC0FF_EE01;

    /// Initial value of a context's generation counter.
    pub const INITIAL_GENERATION: u32 = 1;
}
