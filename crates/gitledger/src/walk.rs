//! Bounded traversal of cause chains.

use gitledger_core::constants::MAX_DEPTH;

use crate::error::LedgerError;

/// Visit `top` and its causes, outermost first.
///
/// Stops when the visitor returns `false`, the chain ends, or
/// [`MAX_DEPTH`] errors have been visited. State lives in the closure.
pub fn walk<F>(top: Option<&LedgerError>, mut visitor: F)
where
    F: FnMut(&LedgerError) -> bool,
{
    let mut cursor = top;
    let mut depth = 0;
    while let Some(err) = cursor {
        if depth == MAX_DEPTH || !visitor(err) {
            return;
        }
        depth += 1;
        cursor = err.cause();
    }
}

/// Iterator over a cause chain, bounded like [`walk`].
#[derive(Clone)]
pub struct Chain<'a> {
    next: Option<&'a LedgerError>,
    remaining: usize,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a LedgerError;

    fn next(&mut self) -> Option<&'a LedgerError> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next?;
        self.remaining -= 1;
        self.next = current.cause();
        Some(current)
    }
}

impl LedgerError {
    /// See [`walk`].
    pub fn walk<F>(&self, visitor: F)
    where
        F: FnMut(&LedgerError) -> bool,
    {
        walk(Some(self), visitor)
    }

    pub fn chain(&self) -> Chain<'_> {
        Chain { next: Some(self), remaining: MAX_DEPTH }
    }

    /// Innermost cause within the walk bound.
    pub fn root_cause(&self) -> &LedgerError {
        self.chain().last().unwrap_or(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Code, Context, Domain};

    fn chain_of(ctx: &Context, len: usize) -> LedgerError {
        let mut top = crate::ledger_error!(ctx, Domain::Git, Code::NotFound, "0").unwrap();
        for i in 1..len {
            top = crate::ledger_error_with_cause!(ctx, Domain::Git, Code::NotFound, &top, "{}", i)
                .unwrap();
        }
        top
    }

    #[test]
    fn visits_outermost_first() {
        let ctx = Context::new().unwrap();
        let top = chain_of(&ctx, 4);
        let mut seen = Vec::new();
        top.walk(|e| {
            seen.push(e.message().to_string());
            true
        });
        assert_eq!(seen, ["3", "2", "1", "0"]);
    }

    #[test]
    fn visitor_can_stop_early() {
        let ctx = Context::new().unwrap();
        let top = chain_of(&ctx, 10);
        let mut visits = 0;
        walk(Some(&top), |_| {
            visits += 1;
            visits < 3
        });
        assert_eq!(visits, 3);
    }

    #[test]
    fn null_top_visits_nothing() {
        let mut visits = 0;
        walk(None, |_| {
            visits += 1;
            true
        });
        assert_eq!(visits, 0);
    }

    #[test]
    fn walk_is_bounded() {
        let ctx = Context::new().unwrap();
        let top = chain_of(&ctx, MAX_DEPTH + 10);
        let mut visits = 0;
        top.walk(|_| {
            visits += 1;
            true
        });
        assert_eq!(visits, MAX_DEPTH);
        assert_eq!(top.chain().count(), MAX_DEPTH);
    }

    #[test]
    fn root_cause_is_innermost() {
        let ctx = Context::new().unwrap();
        let top = chain_of(&ctx, 5);
        assert_eq!(top.root_cause().message(), "0");
        let single = chain_of(&ctx, 1);
        assert!(LedgerError::ptr_eq(single.root_cause(), &single));
    }
}
