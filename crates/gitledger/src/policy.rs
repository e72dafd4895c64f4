//! Teardown policy for contexts that still have live errors.
//!
//! Diagnostics builds (`debug_assertions`) treat a context released while
//! errors are still registered as a fatal contract violation. Release builds
//! refuse the teardown and leave the context usable, so a leak in production
//! degrades instead of crashing.

cfg_if::cfg_if! {
    if #[cfg(debug_assertions)] {
        /// True in builds compiled with `debug_assertions`.
        pub const DIAGNOSTICS_BUILD: bool = true;
    } else {
        /// True in builds compiled with `debug_assertions`.
        pub const DIAGNOSTICS_BUILD: bool = false;
    }
}

/// Outcome of a final-release attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No live errors; destroy the context.
    Proceed,
    /// Live errors in a diagnostics build; abort the process.
    Abort,
    /// Live errors in a release build; restore one reference and keep the
    /// context alive.
    Refuse,
}

/// Decide what a final release does given the build kind and the number of
/// errors still registered.
#[inline]
pub const fn teardown_verdict(diagnostics_build: bool, live: usize) -> Verdict {
    if live == 0 {
        Verdict::Proceed
    } else if diagnostics_build {
        Verdict::Abort
    } else {
        Verdict::Refuse
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_always_proceeds() {
        assert_eq!(teardown_verdict(true, 0), Verdict::Proceed);
        assert_eq!(teardown_verdict(false, 0), Verdict::Proceed);
    }

    #[test]
    fn live_errors_split_by_build() {
        assert_eq!(teardown_verdict(true, 1), Verdict::Abort);
        assert_eq!(teardown_verdict(false, 3), Verdict::Refuse);
    }

    #[test]
    fn build_flag_tracks_debug_assertions() {
        assert_eq!(DIAGNOSTICS_BUILD, cfg!(debug_assertions));
    }
}
