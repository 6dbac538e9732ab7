// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Context ordering, close semantics, fatal exception handling, and the device syscall filter over the simulated device.
// Author: Lukas Bower

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use accel_bridge::link::{exs, sysnum};
use accel_bridge::sim::{SimMachine, SimOutcome};
use accel_bridge::{
    BridgeError, CallArgs, CommandStatus, ContextState, ProcessHandle, REQUEST_ID_INVALID,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn boot() -> (SimMachine, ProcessHandle) {
    init_logging();
    let machine = SimMachine::new(0);
    let proc = ProcessHandle::create_with_boot(machine.boot()).expect("create device process");
    (machine, proc)
}

#[test]
fn completions_keep_submission_order_per_context() -> anyhow::Result<()> {
    let (machine, proc) = boot();
    let lib = machine.library("libdemo.so");
    lib.define("identity", |_mem, args| SimOutcome::Return(args.arg(0)));

    let handle = proc.load_library("libdemo.so")?;
    let sym = proc.get_symbol(handle, "identity")?;
    let ctx = proc.open_context()?;

    let mut reqs = Vec::new();
    for i in 0..5u64 {
        let mut args = CallArgs::new();
        args.set_u64(0, i)?;
        reqs.push(ctx.call_async(sym, args)?);
    }
    // Once the last submission completes, every earlier one must have a
    // result waiting.
    let (status, retval) = ctx.wait_result(*reqs.last().unwrap())?;
    assert_eq!((status, retval), (CommandStatus::Ok, 4));
    for (i, req) in reqs[..4].iter().enumerate() {
        let (status, retval) = ctx.peek_result(*req)?;
        assert_eq!(status, CommandStatus::Ok, "request {i} not finished");
        assert_eq!(retval, i as u64);
    }

    ctx.close()?;
    proc.destroy()?;
    Ok(())
}

#[test]
fn request_ids_are_unique_and_never_the_sentinel() -> anyhow::Result<()> {
    let (machine, proc) = boot();
    let lib = machine.library("libdemo.so");
    lib.define("identity", |_mem, args| SimOutcome::Return(args.arg(0)));
    let handle = proc.load_library("libdemo.so")?;
    let sym = proc.get_symbol(handle, "identity")?;
    let ctx = proc.open_context()?;

    let mut seen = HashSet::new();
    for _ in 0..32 {
        let mut args = CallArgs::new();
        args.set_u64(0, 7)?;
        let req = ctx.call_async(sym, args)?;
        assert_ne!(req, 0);
        assert_ne!(req, REQUEST_ID_INVALID);
        assert!(seen.insert(req), "request id {req} reused");
    }
    for req in &seen {
        ctx.wait_result(*req)?;
    }
    ctx.close()?;
    proc.destroy()?;
    Ok(())
}

#[test]
fn close_is_idempotent_and_exit_is_terminal() -> anyhow::Result<()> {
    let (_machine, proc) = boot();
    let ctx = proc.open_context()?;
    // A completed round trip pins the worker in its BLOCKED event loop.
    let warmup = ctx.call_host_async(|| 0)?;
    ctx.wait_result(warmup)?;
    assert_eq!(ctx.state(), ContextState::Blocked);

    ctx.close()?;
    assert_eq!(ctx.state(), ContextState::Exit);
    ctx.close()?;
    assert_eq!(ctx.state(), ContextState::Exit);

    assert!(matches!(
        ctx.call_host_async(|| 1),
        Err(BridgeError::ContextExited)
    ));
    proc.destroy()?;
    Ok(())
}

#[test]
fn close_lets_queued_work_finish_first() -> anyhow::Result<()> {
    let (machine, proc) = boot();
    let lib = machine.library("libsleep.so");
    lib.define("nap", |_mem, args| {
        thread::sleep(Duration::from_millis(50));
        SimOutcome::Return(args.arg(0))
    });
    let handle = proc.load_library("libsleep.so")?;
    let sym = proc.get_symbol(handle, "nap")?;
    let ctx = proc.open_context()?;

    let mut args = CallArgs::new();
    args.set_u64(0, 11)?;
    let first = ctx.call_async(sym, args)?;
    let second = ctx.call_host_async(|| 22)?;
    ctx.close()?;

    assert_eq!(ctx.wait_result(first)?, (CommandStatus::Ok, 11));
    assert_eq!(ctx.wait_result(second)?, (CommandStatus::Ok, 22));
    proc.destroy()?;
    Ok(())
}

#[test]
fn host_calls_run_at_their_queue_position() -> anyhow::Result<()> {
    let (_machine, proc) = boot();
    let ctx = proc.open_context()?;
    let req = ctx.call_host_async(|| 1234)?;
    assert_eq!(ctx.wait_result(req)?, (CommandStatus::Ok, 1234));
    ctx.close()?;
    proc.destroy()?;
    Ok(())
}

#[test]
fn unknown_and_collected_ids_are_rejected() -> anyhow::Result<()> {
    let (_machine, proc) = boot();
    let ctx = proc.open_context()?;
    assert!(matches!(
        ctx.peek_result(999),
        Err(BridgeError::UnknownRequest(999))
    ));
    let req = ctx.call_host_async(|| 5)?;
    ctx.wait_result(req)?;
    assert!(matches!(
        ctx.wait_result(req),
        Err(BridgeError::UnknownRequest(_))
    ));
    ctx.close()?;
    proc.destroy()?;
    Ok(())
}

#[test]
fn fatal_device_exception_exits_the_context() -> anyhow::Result<()> {
    let (machine, proc) = boot();
    let lib = machine.library("libbad.so");
    lib.define("crash", |_mem, _args| SimOutcome::Fault);
    let handle = proc.load_library("libbad.so")?;
    let sym = proc.get_symbol(handle, "crash")?;
    let ctx = proc.open_context()?;

    let req = ctx.call_async(sym, CallArgs::new())?;
    let (status, word) = ctx.wait_result(req)?;
    assert_eq!(status, CommandStatus::Exception);
    assert_ne!(word & exs::MONT, 0, "retval carries the exception word");

    assert_eq!(ctx.state(), ContextState::Exit);
    assert!(matches!(
        ctx.call_host_async(|| 0),
        Err(BridgeError::ContextExited)
    ));
    // A context never leaves EXIT; closing it now is a no-op.
    ctx.close()?;
    assert_eq!(ctx.state(), ContextState::Exit);
    proc.destroy()?;
    Ok(())
}

#[test]
fn blacklisted_syscall_is_refused_with_enosys() -> anyhow::Result<()> {
    let (machine, proc) = boot();
    let lib = machine.library("libsys.so");
    lib.define("try_fork", |_mem, _args| SimOutcome::Syscall(sysnum::FORK));
    let handle = proc.load_library("libsys.so")?;
    let sym = proc.get_symbol(handle, "try_fork")?;
    let ctx = proc.open_context()?;

    let req = ctx.call_async(sym, CallArgs::new())?;
    let (status, retval) = ctx.wait_result(req)?;
    assert_eq!(status, CommandStatus::Ok);
    assert_eq!(retval as i64, -i64::from(libc::ENOSYS));
    assert_eq!(machine.rejected_syscalls(), vec![sysnum::FORK]);

    ctx.close()?;
    proc.destroy()?;
    Ok(())
}

#[test]
fn allowed_syscall_is_forwarded_to_the_host() -> anyhow::Result<()> {
    const SYS_GETPID: i64 = 39;
    let (machine, proc) = boot();
    let lib = machine.library("libsys.so");
    lib.define("ask_pid", |_mem, _args| SimOutcome::Syscall(SYS_GETPID));
    let handle = proc.load_library("libsys.so")?;
    let sym = proc.get_symbol(handle, "ask_pid")?;
    let ctx = proc.open_context()?;

    let req = ctx.call_async(sym, CallArgs::new())?;
    let (status, _) = ctx.wait_result(req)?;
    assert_eq!(status, CommandStatus::Ok);
    assert_eq!(machine.forwarded_syscalls(), vec![SYS_GETPID]);

    ctx.close()?;
    proc.destroy()?;
    Ok(())
}

#[test]
fn submission_validation_rejects_bad_calls() -> anyhow::Result<()> {
    let (_machine, proc) = boot();
    let ctx = proc.open_context()?;

    assert!(matches!(
        ctx.call_async(accel_bridge::DeviceAddr::NULL, CallArgs::new()),
        Err(BridgeError::NullFunction)
    ));

    let mut gappy = CallArgs::new();
    gappy.set_i64(3, 1)?;
    assert!(matches!(
        ctx.call_async(accel_bridge::DeviceAddr::from_raw(0xf100_0000), gappy),
        Err(BridgeError::ArgumentGap(_))
    ));

    ctx.close()?;
    proc.destroy()?;
    Ok(())
}

#[test]
fn contexts_run_independently() -> anyhow::Result<()> {
    let (machine, proc) = boot();
    let lib = machine.library("libsleep.so");
    lib.define("nap", |_mem, args| {
        thread::sleep(Duration::from_millis(100));
        SimOutcome::Return(args.arg(0))
    });
    lib.define("quick", |_mem, args| SimOutcome::Return(args.arg(0)));
    let handle = proc.load_library("libsleep.so")?;
    let nap = proc.get_symbol(handle, "nap")?;
    let quick = proc.get_symbol(handle, "quick")?;

    let slow_ctx = proc.open_context()?;
    let fast_ctx = proc.open_context()?;

    let mut args = CallArgs::new();
    args.set_u64(0, 1)?;
    let slow = slow_ctx.call_async(nap, args)?;
    let mut args = CallArgs::new();
    args.set_u64(0, 2)?;
    let fast = fast_ctx.call_async(quick, args)?;

    // The fast context is not queued behind the slow one.
    assert_eq!(fast_ctx.wait_result(fast)?, (CommandStatus::Ok, 2));
    assert_eq!(slow_ctx.wait_result(slow)?, (CommandStatus::Ok, 1));

    slow_ctx.close()?;
    fast_ctx.close()?;
    proc.destroy()?;
    Ok(())
}
