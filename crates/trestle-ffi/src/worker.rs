//! Worker-pool offloading of native calls.
//!
//! `call_async` hands an [`AsyncCallContext`] to a bounded process-wide pool.
//! A worker thread runs the native call, captures any panic text best-effort
//! (a hard native fault remains unrecoverable by design), then routes the
//! completion back through the owning runtime instance's dispatch queue so
//! the completion callback runs exactly once on the runtime thread.

use std::any::Any;
use std::env;
use std::ffi::c_void;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use libffi::raw;
use once_cell::sync::Lazy;

use crate::cif::CallInterface;
use crate::error::FfiError;
use crate::queue::DispatchTask;
use crate::runtime::{RuntimeHandle, RuntimeState};

/// Completion callback for an asynchronous native call. Receives the captured
/// error text, or `None` on success. Always invoked on the runtime thread.
pub type CompletionFn = Box<dyn FnOnce(Option<String>)>;

/// Environment variable overriding the worker-pool size.
pub const POOL_SIZE_ENV: &str = "TRESTLE_FFI_POOL_SIZE";

/// Unconfigured default, further capped at the machine's core count.
const DEFAULT_POOL_SIZE: usize = 4;
const MAX_POOL_SIZE: usize = 128;

/// One in-flight asynchronous native-call request.
pub struct AsyncCallContext {
    cif: Arc<CallInterface>,
    fun: *const c_void,
    result: *mut c_void,
    args: *mut *mut c_void,
    runtime: Arc<RuntimeState>,
    on_complete: Option<CompletionFn>,
    error: Option<String>,
}

// SAFETY: the raw pointers stay valid until the completion callback has run
// (the submitting caller's contract), and `on_complete` is only ever invoked
// on the runtime thread that created it.
unsafe impl Send for AsyncCallContext {}

impl AsyncCallContext {
    /// Run the completion callback. Runtime thread only.
    pub(crate) fn finish(mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(self.error.take());
        }
    }

    /// Discard without completing. Used when the owning runtime disappeared
    /// before the completion could be delivered.
    pub(crate) fn abandon(mut self) {
        self.on_complete.take();
        log::warn!(
            "async native call completion dropped; runtime instance {} is gone",
            self.runtime.id()
        );
    }

    #[cfg(test)]
    pub(crate) fn completed_for_tests(runtime: Arc<RuntimeState>) -> Self {
        use crate::cif::DEFAULT_ABI;
        use crate::types::NativeType;
        Self {
            cif: Arc::new(
                CallInterface::prepare_fixed(NativeType::Void, &[], DEFAULT_ABI)
                    .expect("void cif"),
            ),
            fun: std::ptr::null(),
            result: std::ptr::null_mut(),
            args: std::ptr::null_mut(),
            runtime,
            on_complete: None,
            error: None,
        }
    }
}

struct WorkerPool {
    sender: Mutex<Sender<AsyncCallContext>>,
}

impl WorkerPool {
    fn start(size: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<AsyncCallContext>();
        let receiver = Arc::new(Mutex::new(receiver));
        for index in 0..size {
            let receiver = Arc::clone(&receiver);
            let builder =
                thread::Builder::new().name(format!("trestle-ffi-worker-{index}"));
            builder
                .spawn(move || worker_loop(receiver))
                .unwrap_or_else(|e| {
                    panic!("failed to spawn ffi worker thread: {e}")
                });
        }
        log::debug!("started ffi worker pool with {size} thread(s)");
        Self {
            sender: Mutex::new(sender),
        }
    }

    fn submit(&self, ctx: AsyncCallContext) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        // The receiver lives for the process; send only fails if every worker
        // thread died, which is unrecoverable anyway.
        if sender.send(ctx).is_err() {
            log::error!("ffi worker pool is gone; async native call dropped");
        }
    }
}

fn pool_size() -> usize {
    let configured = env::var(POOL_SIZE_ENV)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or_else(|| DEFAULT_POOL_SIZE.min(num_cpus::get().max(1)));
    configured.min(MAX_POOL_SIZE).max(1)
}

static POOL: Lazy<WorkerPool> = Lazy::new(|| WorkerPool::start(pool_size()));

fn worker_loop(receiver: Arc<Mutex<Receiver<AsyncCallContext>>>) {
    loop {
        let ctx = {
            let guard = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            guard.recv()
        };
        match ctx {
            Ok(ctx) => execute(ctx),
            // Channel closed: process is shutting down.
            Err(_) => return,
        }
    }
}

fn execute(mut ctx: AsyncCallContext) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: validated at submission; buffer lifetimes are the
        // submitting caller's contract.
        unsafe {
            let fun: unsafe extern "C" fn() = mem::transmute(ctx.fun);
            raw::ffi_call(ctx.cif.cif_ptr(), Some(fun), ctx.result, ctx.args);
        }
    }));
    if let Err(payload) = outcome {
        ctx.error = Some(panic_text(payload));
    }

    let runtime = Arc::clone(&ctx.runtime);
    if runtime
        .enqueue(DispatchTask::Completion(ctx))
        .is_err()
    {
        // The context (and its completion callback) was dropped by the
        // closed queue; nothing further to deliver.
        log::warn!(
            "runtime instance {} tore down before an async call completed",
            runtime.id()
        );
    }
}

pub(crate) fn panic_text(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "native call raised an unidentifiable panic".to_string()
    }
}

/// Submit one native call to the worker pool.
///
/// Returns immediately; `on_complete` runs exactly once on `runtime`'s thread
/// after the native call has fully completed and the runtime thread has
/// drained its queue. Completions of distinct submissions are delivered in
/// finish order, not submission order.
///
/// # Safety
///
/// Same contract as [`crate::call::call_sync`], with the lifetimes extended:
/// `fun`, `result`, and `args` (and the argument values they reference) must
/// stay valid until `on_complete` has run.
pub unsafe fn call_async(
    runtime: &RuntimeHandle,
    cif: Arc<CallInterface>,
    fun: *const c_void,
    result: *mut c_void,
    args: *mut *mut c_void,
    on_complete: CompletionFn,
) -> Result<(), FfiError> {
    if fun.is_null() {
        return Err(FfiError::InvalidArgument(
            "function address is null".into(),
        ));
    }
    if cif.arg_count() > 0 && args.is_null() {
        return Err(FfiError::InvalidArgument(
            "argument pointer array is null".into(),
        ));
    }

    let ctx = AsyncCallContext {
        cif,
        fun,
        result,
        args,
        runtime: Arc::clone(runtime.state()),
        on_complete: Some(on_complete),
        error: None,
    };
    POOL.submit(ctx);
    Ok(())
}
