//! Foreign-call and callback-bridging engine for the Trestle runtime.
//!
//! This crate lets the managed surface describe arbitrary native function
//! signatures, invoke native functions synchronously or on a worker pool, and
//! expose host callbacks as real native function pointers that foreign code
//! may call from any thread it likes.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use trestle_ffi::{CallInterface, NativeType, DEFAULT_ABI};
//!
//! let cif = Arc::new(
//!     CallInterface::prepare_fixed(
//!         NativeType::F64,
//!         &[NativeType::F64, NativeType::F64],
//!         DEFAULT_ABI,
//!     )
//!     .unwrap(),
//! );
//! // Reuse `cif` for every call and closure with this signature.
//! ```
//!
//! # Threading model
//!
//! Managed code runs on exactly one thread per runtime instance. A closure
//! invoked from that thread dispatches immediately; a closure invoked from
//! any other thread queues a pending-invocation record, signals the
//! instance's wake handle, and blocks until the runtime thread's drain loop
//! ([`RuntimeHandle::drain`]) has executed the callback and filled the
//! caller's buffers in place. Asynchronous call completions travel the same
//! queue, so the runtime thread observes all cross-thread work in FIFO order.
//!
//! Closure lifetime follows host garbage collection: dropping a
//! [`ClosureHandle`] is the finalizer and the only way the trampoline memory
//! is released.

mod call;
mod callback;
mod cif;
mod error;
mod library;
mod queue;
mod runtime;
mod types;
mod worker;

pub use call::call_sync;
pub use callback::{
    live_closure_count, take_pending_callback_error, CallbackFn, ClosureHandle,
    ErrorReportFn,
};
pub use cif::{Abi, CallInterface, DEFAULT_ABI};
pub use error::FfiError;
pub use library::{thread_errno, NativeLibrary};
pub use runtime::{registry, RuntimeHandle, RuntimeRegistry, RuntimeState, WakeFn};
pub use types::{
    capability_table, NativeType, TypeCapability, FFI_ARG_SIZE, POINTER_SIZE,
};
pub use worker::{call_async, CompletionFn, POOL_SIZE_ENV};

#[cfg(unix)]
pub use library::dlopen_flags;

/// Engine version exposed to the managed surface.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
