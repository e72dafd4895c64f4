//! Leveled diagnostics
//!
//! Thread-safe, line-atomic stderr output tagged with a level and the
//! emitting module. Diagnostics are best effort: a failed write is dropped,
//! never reported to the caller.
//!
//! # Environment Variables
//!
//! - `GL_LOG_LEVEL=<level>` - off|error|warn|info|debug|trace or 0-5 (default: warn)
//! - `GL_FLUSH_EPRINT=1` - Flush stderr after each line (useful when chasing an abort)
//!
//! # Usage
//!
//! ```ignore
//! use gitledger_core::{gl_debug, gl_error};
//!
//! gl_debug!("context created (generation {})", generation);
//! gl_error!("{} live error(s) at context teardown", live);
//! ```
//!
//! Tests can redirect output into memory with [`capture_begin`] and collect
//! it with [`capture_take`].

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::config::{env_get_bool, env_get_opt};

/// Log levels, most severe first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Level::Off,
            1 => Level::Error,
            2 => Level::Warn,
            3 => Level::Info,
            4 => Level::Debug,
            _ => Level::Trace,
        }
    }

    /// Parse a level name or digit. Unknown input yields `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Some(Level::Off),
            "error" | "1" => Some(Level::Error),
            "warn" | "2" => Some(Level::Warn),
            "info" | "3" => Some(Level::Info),
            "debug" | "4" => Some(Level::Debug),
            "trace" | "5" => Some(Level::Trace),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Level::Off => "",
            Level::Error => "[ERROR]",
            Level::Warn => "[WARN ]",
            Level::Info => "[INFO ]",
            Level::Debug => "[DEBUG]",
            Level::Trace => "[TRACE]",
        }
    }

    /// True if a message at `msg` passes a filter set to `self`.
    #[inline]
    pub fn allows(self, msg: Level) -> bool {
        msg != Level::Off && msg <= self
    }
}

impl std::str::FromStr for Level {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        Level::parse(s).ok_or(())
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static CAPTURE: Mutex<Option<Vec<String>>> = Mutex::new(None);

/// Initialize from `GL_LOG_LEVEL` / `GL_FLUSH_EPRINT`.
///
/// Runs once; called lazily by the first log line.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    FLUSH_ENABLED.store(env_get_bool("GL_FLUSH_EPRINT", false), Ordering::Relaxed);
    if let Some(level) = env_get_opt::<Level>("GL_LOG_LEVEL") {
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
pub fn log_level() -> Level {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    Level::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Set log level programmatically (overrides the environment)
pub fn set_log_level(level: Level) {
    init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    init();
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: Level) -> bool {
    log_level().allows(level)
}

/// Start capturing diagnostics in memory instead of writing to stderr.
pub fn capture_begin() {
    if let Ok(mut slot) = CAPTURE.lock() {
        *slot = Some(Vec::new());
    }
}

/// Stop capturing and return the captured lines.
pub fn capture_take() -> Vec<String> {
    CAPTURE
        .lock()
        .ok()
        .and_then(|mut slot| slot.take())
        .unwrap_or_default()
}

#[doc(hidden)]
pub fn _log_impl(level: Level, target: &str, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let line = format!("{} {}: {}", level.tag(), target, args);

    if let Ok(mut slot) = CAPTURE.lock() {
        if let Some(lines) = slot.as_mut() {
            lines.push(line);
            return;
        }
    }

    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_all(line.as_bytes());
    let _ = handle.write_all(b"\n");
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Contract violations and failures the caller must hear about
#[macro_export]
macro_rules! gl_error {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl(
            $crate::log::Level::Error,
            module_path!(),
            format_args!($($arg)*),
        );
    }};
}

/// Degraded but recoverable conditions
#[macro_export]
macro_rules! gl_warn {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl(
            $crate::log::Level::Warn,
            module_path!(),
            format_args!($($arg)*),
        );
    }};
}

#[macro_export]
macro_rules! gl_info {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl(
            $crate::log::Level::Info,
            module_path!(),
            format_args!($($arg)*),
        );
    }};
}

/// Lifecycle events
#[macro_export]
macro_rules! gl_debug {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl(
            $crate::log::Level::Debug,
            module_path!(),
            format_args!($($arg)*),
        );
    }};
}

#[macro_export]
macro_rules! gl_trace {
    ($($arg:tt)*) => {{
        $crate::log::_log_impl(
            $crate::log::Level::Trace,
            module_path!(),
            format_args!($($arg)*),
        );
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_order() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Warn < Level::Info);
        assert!(Level::Info < Level::Debug);
        assert!(Level::Debug < Level::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(Level::parse("WARN"), Some(Level::Warn));
        assert_eq!(Level::parse(" debug "), Some(Level::Debug));
        assert_eq!(Level::parse("0"), Some(Level::Off));
        assert_eq!(Level::parse("loud"), None);
        assert_eq!("trace".parse::<Level>(), Ok(Level::Trace));
        assert_eq!(Level::from_u8(99), Level::Trace);
    }

    #[test]
    fn test_filter() {
        assert!(Level::Warn.allows(Level::Error));
        assert!(Level::Warn.allows(Level::Warn));
        assert!(!Level::Warn.allows(Level::Debug));
        assert!(!Level::Off.allows(Level::Error));
        assert!(!Level::Trace.allows(Level::Off));
    }

    #[test]
    fn test_macros_compile() {
        // Debug/trace lines sit below the default filter and go nowhere
        gl_debug!("debug {}", 1);
        gl_trace!("trace");
    }
}
