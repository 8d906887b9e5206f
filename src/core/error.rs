// This module defines the error taxonomy of the JIT using the thiserror crate. JitError
// has one variant per failure class a compilation can hit: unsupported tree shapes (no
// tile rule for an operator/child combination), structural inconsistencies (internal
// invariants broken, e.g. conditional branches that tile differently), resource
// exhaustion (too many pinned registers, too many call arguments), link failures
// (unresolved labels, encoder errors), memory mapping failures (which disable the JIT for
// the rest of the process) and I/O errors from debug dumps. ErrorClass lets the driver
// decide policy without matching on every variant. JitResult<T> is the crate-wide alias.

//! Error types for the JIT compiler.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

use crate::x64::encoder::EncodingError;

/// Main error type for a JIT compilation.
#[derive(Error, Debug)]
pub enum JitError {
    #[error("Unsupported tree shape: {reason}")]
    Unsupported {
        reason: String,
    },

    #[error("Structural inconsistency: {reason}")]
    Structural {
        reason: String,
    },

    #[error("Resources exhausted: {reason}")]
    Exhausted {
        reason: String,
    },

    #[error("Link failure: {reason}")]
    Link {
        reason: String,
    },

    #[error("Encoding failed: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Memory mapping failed: {reason}")]
    MemoryMap {
        reason: String,
    },

    #[error("JIT compilation is disabled")]
    Disabled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by the driver to pick a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Abort this compilation only.
    Recoverable,
    /// Broken internal invariant.
    Internal,
    /// The environment cannot host generated code; stop compiling.
    Environment,
}

impl JitError {
    pub fn unsupported(reason: impl Into<String>) -> Self {
        JitError::Unsupported { reason: reason.into() }
    }

    pub fn exhausted(reason: impl Into<String>) -> Self {
        JitError::Exhausted { reason: reason.into() }
    }

    pub fn link(reason: impl Into<String>) -> Self {
        JitError::Link { reason: reason.into() }
    }

    pub fn memory_map(reason: impl Into<String>) -> Self {
        JitError::MemoryMap { reason: reason.into() }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            JitError::Structural { .. } => ErrorClass::Internal,
            JitError::MemoryMap { .. } => ErrorClass::Environment,
            _ => ErrorClass::Recoverable,
        }
    }
}

/// Report a broken internal invariant.
///
/// Debug builds treat this as fatal; release builds abort only the
/// current compilation.
pub fn structural(reason: impl Into<String>) -> JitError {
    let reason = reason.into();
    if cfg!(debug_assertions) {
        panic!("structural inconsistency: {reason}");
    }
    JitError::Structural { reason }
}

/// Result type alias for JIT operations.
pub type JitResult<T> = Result<T, JitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(JitError::unsupported("x").class(), ErrorClass::Recoverable);
        assert_eq!(JitError::exhausted("x").class(), ErrorClass::Recoverable);
        assert_eq!(JitError::link("x").class(), ErrorClass::Recoverable);
        assert_eq!(JitError::memory_map("x").class(), ErrorClass::Environment);
        assert_eq!(
            JitError::Structural { reason: "x".into() }.class(),
            ErrorClass::Internal
        );
    }

    #[test]
    fn test_encoding_error_converts() {
        let err: JitError = EncodingError::InvalidRegister.into();
        assert!(matches!(err, JitError::Encoding(_)));
        assert_eq!(err.class(), ErrorClass::Recoverable);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "structural inconsistency")]
    fn test_structural_is_fatal_in_debug() {
        let _ = structural("branches disagree");
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_structural_is_recoverable_in_release() {
        let err = structural("branches disagree");
        assert_eq!(err.class(), ErrorClass::Internal);
    }
}
