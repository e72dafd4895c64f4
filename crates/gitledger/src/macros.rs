//! Construction macros.
//!
//! Both capture the call site with [`location!`](crate::location) and take
//! `format!`-style message arguments.
//!
//! ```ignore
//! let leaf = ledger_error!(&ctx, Domain::Git, Code::Conflict, "Ref update conflict")?;
//! let top = ledger_error_with_cause!(
//!     &ctx, Domain::Policy, Code::PolicyViolation, &leaf,
//!     "Policy blocked update for {}", refname,
//! )?;
//! ```

/// Build a [`LedgerError`](crate::LedgerError) without a cause.
#[macro_export]
macro_rules! ledger_error {
    ($ctx:expr, $domain:expr, $code:expr, $($fmt:tt)+) => {
        $crate::LedgerError::create(
            $ctx,
            $domain,
            $code,
            ::core::option::Option::Some($crate::location!()),
            format_args!($($fmt)+),
        )
    };
}

/// Build a [`LedgerError`](crate::LedgerError) that retains `$cause`
/// (a `&LedgerError` or an `Option<&LedgerError>`).
#[macro_export]
macro_rules! ledger_error_with_cause {
    ($ctx:expr, $domain:expr, $code:expr, $cause:expr, $($fmt:tt)+) => {
        $crate::LedgerError::create_with_cause(
            $ctx,
            $domain,
            $code,
            $cause,
            ::core::option::Option::Some($crate::location!()),
            format_args!($($fmt)+),
        )
    };
}
