//! # gitledger
//!
//! Diagnostic core for the ledger tooling: refcounted contexts, immutable
//! causal-chain errors, and bounded JSON rendering.
//!
//! ## Design
//!
//! - **[`Context`]**: owns an [`Allocator`], a registry of live errors and a
//!   generation counter. Releasing the last handle with errors still alive
//!   aborts in diagnostics builds and is refused in release builds.
//!
//! - **[`LedgerError`]**: domain, code, flags, message, optional call site
//!   and an optional retained cause. Allocated through the context's
//!   allocator, freed through a snapshot of it, so errors may outlive their
//!   context once detached.
//!
//! - **JSON**: [`render_json`] measures or writes into a caller buffer with
//!   an explicit frame stack; [`LedgerError::json`] caches the result on the
//!   error and rebuilds it when the context generation moves.
//!
//! ## Quick Start
//!
//! ```rust
//! use gitledger::{ledger_error, ledger_error_with_cause, Code, Context, Domain};
//!
//! let ctx = Context::new()?;
//! let leaf = ledger_error!(&ctx, Domain::Git, Code::Conflict, "Ref update conflict")?;
//! let top = ledger_error_with_cause!(
//!     &ctx, Domain::Policy, Code::PolicyViolation, &leaf,
//!     "Policy blocked update for {}", "refs/main"
//! )?;
//!
//! assert!(top.is_permanent());
//! assert!(top.json().starts_with(r#"{"domain":"POLICY""#));
//!
//! // Errors go before the context
//! drop(top);
//! drop(leaf);
//! drop(ctx);
//! # Ok::<(), gitledger::CoreError>(())
//! ```
//!
//! ## Environment
//!
//! | Variable                  | Effect |
//! |---------------------------|--------|
//! | `GL_LOG_LEVEL`            | Diagnostic verbosity (default `warn`) |
//! | `GL_FLUSH_EPRINT`         | Flush stderr after every diagnostic line |
//! | `GL_SPIN_YIELD_THRESHOLD` | Registry lock spins before yielding ([`ContextConfig::from_env`]) |

mod cache;
mod codes;
mod context;
mod error;
mod json;
mod location;
mod macros;
mod policy;
mod walk;

#[cfg(test)]
mod testing;

// ── Public API ────────────────────────────────────────────────────

pub use cache::{json_copy, message_copy, LedgerString};
pub use codes::{Code, Domain, Flags};
pub use context::{Context, Release};
pub use error::LedgerError;
pub use json::render_json;
pub use location::SourceLocation;
pub use policy::{teardown_verdict, Verdict, DIAGNOSTICS_BUILD};
pub use walk::{walk, Chain};

pub use gitledger_core::constants::MAX_DEPTH;
pub use gitledger_core::{
    set_log_level, AllocError, Allocator, ContextConfig, CoreError, CoreResult, Level,
    RawAllocator, SystemAllocator,
};
