//! Context configuration
//!
//! Build a [`ContextConfig`] explicitly, or start from
//! [`ContextConfig::from_env`] and override what you need:
//!
//! ```ignore
//! let config = ContextConfig::from_env()
//!     .allocator(Allocator::new(MyArena::default()))
//!     .spin_yield_threshold(16);
//! config.validate()?;
//! ```
//!
//! # Environment Variables
//!
//! - `GL_SPIN_YIELD_THRESHOLD=<n>` - failed registry lock attempts before yielding (default: 64)
//!
//! The teardown policy for contexts with live errors is fixed at build time
//! (`debug_assertions`) and deliberately has no knob here.

use std::str::FromStr;

use crate::alloc::Allocator;
use crate::constants::SPIN_YIELD_THRESHOLD;
use crate::error::{CoreError, CoreResult};

/// Get environment variable parsed as `T`, or `default` if unset or unparsable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as `Some(T)` if set and parsable
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get environment variable as a boolean.
///
/// "1", "true", "yes", "on" (case-insensitive) are true, anything else set
/// is false, unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Configuration consumed by context creation
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Allocator bound to the context and snapshotted by its errors
    pub allocator: Allocator,

    /// Failed registry lock attempts before yielding to the OS
    pub spin_yield_threshold: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            allocator: Allocator::system(),
            spin_yield_threshold: SPIN_YIELD_THRESHOLD,
        }
    }
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `GL_*` environment variables
    pub fn from_env() -> Self {
        Self {
            spin_yield_threshold: env_get("GL_SPIN_YIELD_THRESHOLD", SPIN_YIELD_THRESHOLD),
            ..Self::default()
        }
    }

    /// Bind a custom allocator
    pub fn allocator(mut self, allocator: Allocator) -> Self {
        self.allocator = allocator;
        self
    }

    /// Set the registry lock's yield threshold
    pub fn spin_yield_threshold(mut self, n: u32) -> Self {
        self.spin_yield_threshold = n;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> CoreResult<()> {
        if self.spin_yield_threshold == 0 {
            return Err(CoreError::InvalidConfig("spin_yield_threshold must be at least 1"));
        }
        Ok(())
    }
}
