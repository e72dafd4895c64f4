//! Structural failure types
//!
//! These describe why a factory could not produce an object at all. They
//! are distinct from the diagnostic errors the subsystem builds for callers.

use core::fmt;

/// Result type for structural operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Why a context or error could not be produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The context handle failed its validity check
    InvalidContext,

    /// Configuration rejected by `ContextConfig::validate`
    InvalidConfig(&'static str),

    /// A message argument's formatting implementation reported an error
    Format,

    /// The bound allocator returned nothing
    Alloc(AllocError),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::InvalidContext => write!(f, "invalid context"),
            CoreError::InvalidConfig(why) => write!(f, "invalid config: {}", why),
            CoreError::Format => write!(f, "message formatting failed"),
            CoreError::Alloc(e) => write!(f, "allocation failed: {}", e),
        }
    }
}

impl std::error::Error for CoreError {}

/// The allocation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    ContextBlock,
    ErrorBlock,
    Message,
    Copy,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::ContextBlock => write!(f, "context block"),
            AllocError::ErrorBlock => write!(f, "error block"),
            AllocError::Message => write!(f, "message buffer"),
            AllocError::Copy => write!(f, "copy buffer"),
        }
    }
}

impl From<AllocError> for CoreError {
    fn from(e: AllocError) -> Self {
        CoreError::Alloc(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(CoreError::InvalidContext.to_string(), "invalid context");
        assert_eq!(
            CoreError::Alloc(AllocError::Message).to_string(),
            "allocation failed: message buffer"
        );
    }

    #[test]
    fn test_error_conversion() {
        let err: CoreError = AllocError::Copy.into();
        assert!(matches!(err, CoreError::Alloc(AllocError::Copy)));
    }
}
