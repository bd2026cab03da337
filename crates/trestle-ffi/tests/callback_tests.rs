//! Integration tests for the closure subsystem: same-thread dispatch,
//! foreign-thread rendezvous, FIFO draining, and error routing.

mod common;

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use common::WakeSignal;
use trestle_ffi::{
    take_pending_callback_error, CallInterface, ClosureHandle, NativeType,
    RuntimeHandle, DEFAULT_ABI,
};

fn int_unary_cif() -> Arc<CallInterface> {
    Arc::new(
        CallInterface::prepare_fixed(NativeType::I32, &[NativeType::I32], DEFAULT_ABI)
            .unwrap(),
    )
}

/// Reads the single i32 argument of a closure invocation.
fn read_arg(args: &[*const c_void]) -> i32 {
    unsafe { *(args[0] as *const i32) }
}

/// Writes an i32 closure return value into the widened result slot.
fn write_result(result: &mut [u8], value: i32) {
    let widened = (value as i64) as u64;
    let bytes = widened.to_ne_bytes();
    let len = bytes.len().min(result.len());
    result[..len].copy_from_slice(&bytes[..len]);
}

fn as_int_fn(code: usize) -> extern "C" fn(i32) -> i32 {
    unsafe { std::mem::transmute(code) }
}

#[test]
fn test_same_thread_dispatch_is_immediate() {
    let (wake, signal) = WakeSignal::new();
    let runtime = RuntimeHandle::register(wake);

    let closure = ClosureHandle::create(
        &runtime,
        int_unary_cif(),
        NativeType::I32.result_size(),
        1,
        Box::new(|_| {}),
        Box::new(|result, args| {
            let v = read_arg(args);
            write_result(result, v * 2);
            None
        }),
    )
    .unwrap();

    let f = as_int_fn(closure.code_ptr() as usize);
    assert_eq!(f(21), 42);
    assert!(format!("{closure:?}").contains("key"));

    // Direct dispatch must not touch the queue or the wake handle.
    assert_eq!(signal.count(), 0);
    assert_eq!(runtime.drain().unwrap(), 0);

    drop(closure);
    runtime.teardown().unwrap();
}

#[test]
fn test_foreign_thread_blocks_until_drained() {
    let (wake, signal) = WakeSignal::new();
    let runtime = RuntimeHandle::register(wake);

    let executed = Arc::new(AtomicBool::new(false));
    let executed_in_callback = Arc::clone(&executed);
    let closure = ClosureHandle::create(
        &runtime,
        int_unary_cif(),
        NativeType::I32.result_size(),
        1,
        Box::new(|_| {}),
        Box::new(move |result, args| {
            executed_in_callback.store(true, Ordering::SeqCst);
            let v = read_arg(args);
            write_result(result, v * 2);
            None
        }),
    )
    .unwrap();

    let code = closure.code_ptr() as usize;
    let executed_in_caller = Arc::clone(&executed);
    let caller = thread::spawn(move || {
        let f = as_int_fn(code);
        let result = f(5);
        // The trampoline only returns after the runtime thread signaled the
        // rendezvous, so the callback must have run by now.
        assert!(executed_in_caller.load(Ordering::SeqCst));
        result
    });

    signal.wait_for(1);
    assert!(!caller.is_finished());
    assert_eq!(runtime.drain().unwrap(), 1);
    assert_eq!(caller.join().unwrap(), 10);

    drop(closure);
    runtime.teardown().unwrap();
}

#[test]
fn test_queued_invocations_drain_in_fifo_order() {
    let (wake, signal) = WakeSignal::new();
    let runtime = RuntimeHandle::register(wake);

    let order: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let mut closures = Vec::new();
    for _ in 0..2 {
        let order = Arc::clone(&order);
        closures.push(
            ClosureHandle::create(
                &runtime,
                int_unary_cif(),
                NativeType::I32.result_size(),
                1,
                Box::new(|_| {}),
                Box::new(move |result, args| {
                    let tag = read_arg(args);
                    order.lock().unwrap().push(tag);
                    write_result(result, tag);
                    None
                }),
            )
            .unwrap(),
        );
    }

    let code_a = closures[0].code_ptr() as usize;
    let code_b = closures[1].code_ptr() as usize;

    let caller_a = thread::spawn(move || as_int_fn(code_a)(1));
    // Wait until A is queued before B starts, so the enqueue order is known.
    signal.wait_for(1);
    let caller_b = thread::spawn(move || as_int_fn(code_b)(2));
    signal.wait_for(2);

    assert_eq!(runtime.drain().unwrap(), 2);
    assert_eq!(caller_a.join().unwrap(), 1);
    assert_eq!(caller_b.join().unwrap(), 2);
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);

    drop(closures);
    runtime.teardown().unwrap();
}

#[test]
fn test_direct_dispatch_error_lands_in_pending_slot() {
    let (wake, _signal) = WakeSignal::new();
    let runtime = RuntimeHandle::register(wake);

    let closure = ClosureHandle::create(
        &runtime,
        int_unary_cif(),
        NativeType::I32.result_size(),
        1,
        Box::new(|_| {}),
        Box::new(|_, _| Some("callback failed".to_string())),
    )
    .unwrap();

    let f = as_int_fn(closure.code_ptr() as usize);
    let _ = f(1);
    assert_eq!(
        take_pending_callback_error().as_deref(),
        Some("callback failed")
    );
    assert!(take_pending_callback_error().is_none());

    drop(closure);
    runtime.teardown().unwrap();
}

#[test]
fn test_queued_dispatch_error_goes_to_error_report() {
    let (wake, signal) = WakeSignal::new();
    let runtime = RuntimeHandle::register(wake);

    let reported: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let reported_sink = Arc::clone(&reported);
    let closure = ClosureHandle::create(
        &runtime,
        int_unary_cif(),
        NativeType::I32.result_size(),
        1,
        Box::new(move |message| {
            reported_sink.lock().unwrap().push(message.to_string());
        }),
        Box::new(|_, _| Some("queued failure".to_string())),
    )
    .unwrap();

    let code = closure.code_ptr() as usize;
    let caller = thread::spawn(move || as_int_fn(code)(9));

    signal.wait_for(1);
    assert_eq!(runtime.drain().unwrap(), 1);
    caller.join().unwrap();

    assert_eq!(*reported.lock().unwrap(), vec!["queued failure".to_string()]);
    // Queued errors never use the same-thread pending slot.
    assert!(take_pending_callback_error().is_none());

    drop(closure);
    runtime.teardown().unwrap();
}
