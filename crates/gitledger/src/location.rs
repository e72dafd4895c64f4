//! Call-site capture.

use core::fmt;

/// Where an error was raised.
///
/// Only `'static` strings are stored, so a location never owns memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub file: &'static str,
    pub line: u32,
    pub func: Option<&'static str>,
}

impl SourceLocation {
    #[inline]
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line, func: None }
    }

    #[inline]
    pub const fn with_func(mut self, func: &'static str) -> Self {
        self.func = Some(func);
        self
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)?;
        if let Some(func) = self.func {
            write!(f, " ({})", func)?;
        }
        Ok(())
    }
}

/// Capture the current file, line and enclosing function path.
#[macro_export]
macro_rules! location {
    () => {
        $crate::SourceLocation::new(file!(), line!()).with_func($crate::__function_path!())
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __function_path {
    () => {{
        fn __here() {}
        fn __type_name_of<T>(_: T) -> &'static str {
            ::core::any::type_name::<T>()
        }
        let name = __type_name_of(__here);
        match name.strip_suffix("::__here") {
            Some(outer) => outer,
            None => name,
        }
    }};
}
