// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Bootstrap observability, symbol cache, memory transfers, and the connector registry over the simulated device.
// Author: Lukas Bower

use serial_test::serial;

use accel_bridge::link::{DEFAULT_HELPER_PATH, HELPER_ABI_VERSION, HELPER_PATH_ENV};
use accel_bridge::sim::{SimMachine, SimOutcome};
use accel_bridge::{BridgeError, CallArgs, CommandStatus, DeviceAddr, ProcessHandle};

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
#[serial]
fn bootstrap_steps_are_observable_in_order() -> anyhow::Result<()> {
    let (machine, proc) = boot();
    let events = machine.boot_events();
    assert_eq!(events[0], "map_driver_page");
    assert_eq!(events[1], "init_syscall_area");
    assert!(events[2].starts_with("spawn_process "));
    assert_eq!(
        machine.spawned_helper().unwrap(),
        std::path::PathBuf::from(DEFAULT_HELPER_PATH)
    );
    proc.destroy()?;
    assert!(machine.boot_events().contains(&"terminate_process".to_owned()));
    Ok(())
}

#[test]
#[serial]
fn helper_path_env_override_wins() -> anyhow::Result<()> {
    init_logging();
    std::env::set_var(HELPER_PATH_ENV, "/opt/custom/abrun");
    let machine = SimMachine::new(0);
    let proc = ProcessHandle::create_with_boot(machine.boot())?;
    std::env::remove_var(HELPER_PATH_ENV);
    assert_eq!(
        machine.spawned_helper().unwrap(),
        std::path::PathBuf::from("/opt/custom/abrun")
    );
    proc.destroy()?;
    Ok(())
}

#[test]
fn helper_version_mismatch_aborts_bootstrap() {
    init_logging();
    let machine = SimMachine::new(0);
    machine.set_table_version(HELPER_ABI_VERSION + 1);
    match ProcessHandle::create_with_boot(machine.boot()) {
        Err(BridgeError::HelperVersionMismatch { device, host }) => {
            assert_eq!(device, HELPER_ABI_VERSION + 1);
            assert_eq!(host, HELPER_ABI_VERSION);
        }
        Err(e) => panic!("expected version mismatch, got {e:?}"),
        Ok(_) => panic!("bootstrap must not succeed with a skewed helper table"),
    }
    // Bootstrap failure tears the device process down.
    assert!(machine.boot_events().contains(&"terminate_process".to_owned()));
}

#[test]
#[serial]
fn registered_connector_serves_create_by_node() -> anyhow::Result<()> {
    init_logging();
    let machine = SimMachine::new(4);
    machine.install_as_connector();
    let proc = ProcessHandle::create(4)?;
    assert_eq!(proc.device_number(), 4);
    proc.destroy()?;
    assert!(ProcessHandle::create(5).is_err(), "unknown node must fail");
    Ok(())
}

#[test]
fn symbol_cache_dispatches_find_sym_once() -> anyhow::Result<()> {
    let (machine, proc) = boot();
    let lib = machine.library("libdemo.so");
    lib.define("add", |_mem, args| SimOutcome::Return(args.arg(0) + args.arg(1)));

    let handle = proc.load_library("libdemo.so")?;
    let ctx = proc.open_context()?;
    for _ in 0..2 {
        let mut args = CallArgs::new();
        args.set_i64(0, 20)?;
        args.set_i64(1, 22)?;
        let req = ctx.call_async_by_name(handle, "add", args)?;
        let (status, retval) = ctx.wait_result(req)?;
        assert_eq!(status, CommandStatus::Ok);
        assert_eq!(retval, 42);
    }
    assert_eq!(
        machine.find_sym_invocations(),
        1,
        "second lookup must come from the cache"
    );

    ctx.close()?;
    proc.destroy()?;
    Ok(())
}

#[test]
fn unknown_library_and_symbol_are_typed_errors() -> anyhow::Result<()> {
    let (machine, proc) = boot();
    machine.library("libknown.so");
    assert!(matches!(
        proc.load_library("libmissing.so"),
        Err(BridgeError::LibraryLoadFailed(_))
    ));
    let handle = proc.load_library("libknown.so")?;
    assert!(matches!(
        proc.get_symbol(handle, "nope"),
        Err(BridgeError::SymbolNotFound { .. })
    ));
    let long = "x".repeat(300);
    assert!(matches!(
        proc.get_symbol(handle, &long),
        Err(BridgeError::NameTooLong)
    ));
    proc.destroy()?;
    Ok(())
}

#[test]
fn alloc_free_round_trip_and_failure() -> anyhow::Result<()> {
    let (machine, proc) = boot();
    let buf = proc.alloc_mem(256)?;
    assert!(!buf.is_null());
    assert_eq!(machine.outstanding_allocs(), 1);
    proc.free_mem(buf)?;
    assert_eq!(machine.outstanding_allocs(), 0);
    assert!(matches!(
        proc.alloc_mem(1 << 40),
        Err(BridgeError::AllocFailed(_))
    ));
    proc.destroy()?;
    Ok(())
}

#[test]
fn sync_mem_transfer_round_trip() -> anyhow::Result<()> {
    let (_machine, proc) = boot();
    let buf = proc.alloc_mem(16)?;
    let payload = *b"accelerated data";
    proc.write_mem(buf, &payload)?;
    let mut readback = [0u8; 16];
    proc.read_mem(&mut readback, buf)?;
    assert_eq!(readback, payload);
    proc.destroy()?;
    Ok(())
}

#[test]
fn mem_write_orders_against_calls_on_one_context() -> anyhow::Result<()> {
    let (machine, proc) = boot();
    let lib = machine.library("libbuf.so");
    lib.define("read_word", |mem, args| {
        SimOutcome::Return(u64::from(mem.read_u32(DeviceAddr::from_raw(args.arg(0)))))
    });

    let handle = proc.load_library("libbuf.so")?;
    let sym = proc.get_symbol(handle, "read_word")?;
    let buf = proc.alloc_mem(4)?;
    proc.write_mem(buf, &0xaaaa_5555u32.to_le_bytes())?;
    let ctx = proc.open_context()?;

    // Write submitted before the call on the same context is visible.
    let w = ctx.async_write_mem(buf, 0x1234_5678u32.to_le_bytes().to_vec())?;
    let mut args = CallArgs::new();
    args.set_u64(0, buf.into_raw())?;
    let c = ctx.call_async(sym, args)?;
    assert_eq!(ctx.wait_result(c)?, (CommandStatus::Ok, 0x1234_5678));
    assert_eq!(ctx.wait_result(w)?.0, CommandStatus::Ok);

    // In the opposite order the call observes the prior contents.
    let mut args = CallArgs::new();
    args.set_u64(0, buf.into_raw())?;
    let c = ctx.call_async(sym, args)?;
    let w = ctx.async_write_mem(buf, 0x9999_9999u32.to_le_bytes().to_vec())?;
    assert_eq!(ctx.wait_result(c)?, (CommandStatus::Ok, 0x1234_5678));
    assert_eq!(ctx.wait_result(w)?.0, CommandStatus::Ok);

    ctx.close()?;
    proc.destroy()?;
    Ok(())
}

#[test]
fn async_read_mem_fills_host_buffer() -> anyhow::Result<()> {
    let (_machine, proc) = boot();
    let buf = proc.alloc_mem(8)?;
    proc.write_mem(buf, b"deadbeef")?;
    let ctx = proc.open_context()?;
    let dst = accel_bridge::StackBuffer::zeroed(8);
    let req = ctx.async_read_mem(dst.clone(), buf, 8)?;
    assert_eq!(ctx.wait_result(req)?.0, CommandStatus::Ok);
    assert_eq!(dst.to_vec(), b"deadbeef");
    ctx.close()?;
    proc.destroy()?;
    Ok(())
}
