// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: End-to-end device call scenarios over the simulated device.
// Author: Lukas Bower

use std::thread;
use std::time::{Duration, Instant};

use accel_bridge::sim::{SimMachine, SimOutcome};
use accel_bridge::{CallArgs, CommandStatus, Intent, ProcessHandle, StackBuffer};

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
fn simple_call_returns_sum() -> anyhow::Result<()> {
    let (machine, proc) = boot();
    let lib = machine.library("libdemo.so");
    lib.define("add", |_mem, args| SimOutcome::Return(args.arg(0) + args.arg(1)));

    let handle = proc.load_library("libdemo.so")?;
    let sym = proc.get_symbol(handle, "add")?;
    let ctx = proc.open_context()?;

    let mut args = CallArgs::new();
    args.set_i64(0, 2)?;
    args.set_i64(1, 3)?;
    let req = ctx.call_async(sym, args)?;
    let (status, retval) = ctx.wait_result(req)?;
    assert_eq!(status, CommandStatus::Ok);
    assert_eq!(retval, 5);

    ctx.close()?;
    proc.destroy()?;
    Ok(())
}

#[test]
fn peek_reports_unfinished_until_done() -> anyhow::Result<()> {
    let (machine, proc) = boot();
    let lib = machine.library("libsleep.so");
    lib.define("sleep_ticks", |_mem, args| {
        thread::sleep(Duration::from_millis(100 * args.arg(0)));
        SimOutcome::Return(args.arg(0))
    });

    let handle = proc.load_library("libsleep.so")?;
    let ctx = proc.open_context()?;
    let mut args = CallArgs::new();
    args.set_u64(0, 3)?;
    let req = ctx.call_async_by_name(handle, "sleep_ticks", args)?;

    let (status, _) = ctx.peek_result(req)?;
    assert_eq!(status, CommandStatus::Unfinished, "peek before completion");

    let deadline = Instant::now() + Duration::from_secs(5);
    let retval = loop {
        let (status, retval) = ctx.peek_result(req)?;
        if status == CommandStatus::Ok {
            break retval;
        }
        assert_eq!(status, CommandStatus::Unfinished);
        assert!(Instant::now() < deadline, "call never completed");
        thread::sleep(Duration::from_millis(10));
    };
    assert_eq!(retval, 3);

    // The result was collected by the successful peek.
    assert!(ctx.peek_result(req).is_err());

    ctx.close()?;
    proc.destroy()?;
    Ok(())
}

#[test]
fn inout_stack_buffer_is_copied_back() -> anyhow::Result<()> {
    let (machine, proc) = boot();
    let lib = machine.library("libbuf.so");
    lib.define("double_int", |mem, args| {
        let at = accel_bridge::DeviceAddr::from_raw(args.arg(1));
        let v = mem.read_u32(at);
        mem.write_u32(at, v * 2);
        SimOutcome::Return(0)
    });

    let handle = proc.load_library("libbuf.so")?;
    let sym = proc.get_symbol(handle, "double_int")?;
    let ctx = proc.open_context()?;

    let x = StackBuffer::from_bytes(&42u32.to_le_bytes());
    let mut args = CallArgs::new();
    args.set_i32(0, 1)?;
    args.set_stack(Intent::InOut, 1, x.clone())?;
    let req = ctx.call_async(sym, args)?;
    let (status, _) = ctx.wait_result(req)?;
    assert_eq!(status, CommandStatus::Ok);
    assert_eq!(u32::from_le_bytes(x.to_vec().try_into().unwrap()), 84);

    // With intent IN the device-side doubling stays on the device.
    let y = StackBuffer::from_bytes(&42u32.to_le_bytes());
    let mut args = CallArgs::new();
    args.set_i32(0, 1)?;
    args.set_stack(Intent::In, 1, y.clone())?;
    let req = ctx.call_async(sym, args)?;
    let (status, _) = ctx.wait_result(req)?;
    assert_eq!(status, CommandStatus::Ok);
    assert_eq!(u32::from_le_bytes(y.to_vec().try_into().unwrap()), 42);

    ctx.close()?;
    proc.destroy()?;
    Ok(())
}

#[test]
fn out_buffer_beyond_register_args() -> anyhow::Result<()> {
    let (machine, proc) = boot();
    let lib = machine.library("libbuf.so");
    // Arguments 8 and 9 travel through the stack parameter area.
    lib.define("fill_greeting", |mem, args| {
        let dst = accel_bridge::DeviceAddr::from_raw(args.arg(8));
        let len = args.arg(9) as usize;
        let mut text = b"hello\0".to_vec();
        text.resize(len, 0);
        mem.write(dst, &text);
        SimOutcome::Return(len as u64)
    });

    let handle = proc.load_library("libbuf.so")?;
    let sym = proc.get_symbol(handle, "fill_greeting")?;
    let ctx = proc.open_context()?;

    let out = StackBuffer::zeroed(10);
    let mut args = CallArgs::new();
    for i in 0..8 {
        args.set_double(i, (i + 1) as f64)?;
    }
    args.set_stack(Intent::Out, 8, out.clone())?;
    args.set_u32(9, 10)?;
    let req = ctx.call_async(sym, args)?;
    let (status, retval) = ctx.wait_result(req)?;
    assert_eq!(status, CommandStatus::Ok);
    assert_eq!(retval, 10);
    assert_eq!(&out.to_vec()[..6], b"hello\0");

    ctx.close()?;
    proc.destroy()?;
    Ok(())
}

#[test]
fn float_argument_reaches_device_in_high_half() -> anyhow::Result<()> {
    let (machine, proc) = boot();
    let lib = machine.library("libdemo.so");
    lib.define("float_bits", |_mem, args| SimOutcome::Return(args.arg(0) >> 32));

    let handle = proc.load_library("libdemo.so")?;
    let ctx = proc.open_context()?;
    let mut args = CallArgs::new();
    args.set_float(0, -1.5)?;
    let req = ctx.call_async_by_name(handle, "float_bits", args)?;
    let (status, retval) = ctx.wait_result(req)?;
    assert_eq!(status, CommandStatus::Ok);
    assert_eq!(retval as u32, (-1.5f32).to_bits());

    ctx.close()?;
    proc.destroy()?;
    Ok(())
}
