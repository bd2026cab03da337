//! Error taxonomy for the foreign-call engine.
//!
//! Preparation failures keep the numeric `ffi_status` they were mapped from so
//! the caller can decide how severe they are; configuration errors are always
//! recoverable by the caller that made them.

use thiserror::Error;

/// Errors surfaced by the foreign-call and callback-bridging engine.
#[derive(Debug, Error)]
pub enum FfiError {
    /// The call-interface preparation rejected a type definition
    /// (`FFI_BAD_TYPEDEF`). The raw status code is preserved.
    #[error("bad type definition in call-interface preparation (status {status})")]
    BadTypedef { status: u32 },

    /// The call-interface preparation rejected the requested ABI
    /// (`FFI_BAD_ABI`). The raw status code is preserved.
    #[error("bad or unsupported ABI in call-interface preparation (status {status})")]
    BadAbi { status: u32 },

    /// The preparation failed with a status this engine does not recognize.
    #[error("call-interface preparation failed (status {status})")]
    PrepFailed { status: u32 },

    /// The closure allocator returned no memory.
    #[error("closure allocation returned no memory")]
    ClosureAllocation,

    /// Trampoline setup for a freshly allocated closure failed. The raw
    /// status code from the underlying preparation is attached.
    #[error("closure trampoline preparation failed (status {status})")]
    ClosurePreparation { status: u32 },

    /// The target runtime instance has been torn down (or is tearing down)
    /// and no longer accepts work.
    #[error("runtime instance {id} is unavailable")]
    RuntimeUnavailable { id: u64 },

    /// The operation is only valid on the thread that owns the runtime
    /// instance.
    #[error("operation must run on the runtime thread that owns instance {id}")]
    WrongThread { id: u64 },

    /// A caller-supplied argument was rejected before any native code ran.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A dynamic-library operation failed; carries the loader's error text.
    #[error("dynamic library error: {0}")]
    Library(String),
}

impl FfiError {
    /// Returns the underlying numeric status for preparation failures, if any.
    pub fn status(&self) -> Option<u32> {
        match self {
            FfiError::BadTypedef { status }
            | FfiError::BadAbi { status }
            | FfiError::PrepFailed { status }
            | FfiError::ClosurePreparation { status } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_preserved() {
        let err = FfiError::BadAbi { status: 2 };
        assert_eq!(err.status(), Some(2));
        assert!(err.to_string().contains("status 2"));
    }

    #[test]
    fn test_non_prep_errors_have_no_status() {
        assert_eq!(FfiError::ClosureAllocation.status(), None);
        assert_eq!(FfiError::RuntimeUnavailable { id: 7 }.status(), None);
    }
}
