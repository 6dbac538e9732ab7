// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Device process handle: helper bootstrap, privileged control operations, and the symbol cache.
// Author: Lukas Bower

//! Process handles.
//!
//! A [`ProcessHandle`] owns one device process: it spawns the helper
//! binary, reads the helper function table out of device memory, and keeps
//! two private contexts. The main context is used only for bootstrap and
//! final teardown; every privileged control operation (load-library,
//! find-symbol, alloc, free, mem transfers, open-context) is serialized
//! through the worker context. User contexts run their calls
//! concurrently; the control plane stays single-threaded from the device's
//! point of view.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info};
use once_cell::sync::Lazy;

use crate::addr::DeviceAddr;
use crate::args::{CallArgs, Intent, StackBuffer};
use crate::command::{Command, Handler, HandlerOutcome};
use crate::context::{
    spawn_child_context, Context, ContextShared, ContextWorker, LoopExit, SyscallFilter,
};
use crate::error::{BridgeError, CommandStatus, ContextState};
use crate::link::{self, DeviceBoot, HelperTable, HELPER_ABI_VERSION};
use crate::signals;
use crate::SYMBOL_NAME_MAX;

/// The underlying device library keeps process-wide state (the driver's
/// fixed page, the syscall-argument area, the DMA/fork lock). Two handles
/// must not initialize it concurrently.
static BOOTSTRAP_GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub(crate) struct ProcessInner {
    device_no: u32,
    helper: HelperTable,
    boot: Mutex<Box<dyn DeviceBoot>>,
    main_driver: Mutex<ContextWorker>,
    worker_ctx: Context,
    /// Serializes the control plane: worker-context calls and the helper
    /// table from the device's point of view.
    control: Mutex<()>,
    sym_cache: Mutex<HashMap<(u64, String), DeviceAddr>>,
}

impl ProcessInner {
    /// Submit a call on the worker context and wait for it, converting a
    /// non-OK completion into a typed error.
    fn call_on_worker(&self, addr: DeviceAddr, args: CallArgs) -> Result<u64, BridgeError> {
        let _ctl = self.control.lock().expect("control lock");
        let id = self.worker_ctx.call_async(addr, args)?;
        let (status, retval) = self.worker_ctx.wait_result(id)?;
        if status == CommandStatus::Ok {
            Ok(retval)
        } else {
            Err(BridgeError::ControlCallFailed { status, retval })
        }
    }

    fn load_library(&self, name: &str) -> Result<u64, BridgeError> {
        let mut args = CallArgs::new();
        args.set_stack(Intent::In, 0, cstring_buffer(name)?)?;
        let handle = self.call_on_worker(self.helper.load_library, args)?;
        if handle == 0 {
            return Err(BridgeError::LibraryLoadFailed(name.to_owned()));
        }
        debug!("library {name:?} -> handle {handle:#x}");
        Ok(handle)
    }

    pub(crate) fn get_symbol(&self, libhdl: u64, name: &str) -> Result<DeviceAddr, BridgeError> {
        if name.len() > SYMBOL_NAME_MAX {
            return Err(BridgeError::NameTooLong);
        }
        {
            let cache = self.sym_cache.lock().expect("symbol cache lock");
            if let Some(addr) = cache.get(&(libhdl, name.to_owned())) {
                return Ok(*addr);
            }
        }
        let mut args = CallArgs::new();
        args.set_u64(0, libhdl)?;
        args.set_stack(Intent::In, 1, cstring_buffer(name)?)?;
        let raw = self.call_on_worker(self.helper.find_sym, args)?;
        if raw == 0 {
            return Err(BridgeError::SymbolNotFound {
                libhdl,
                name: name.to_owned(),
            });
        }
        let addr = DeviceAddr::from_raw(raw);
        self.sym_cache
            .lock()
            .expect("symbol cache lock")
            .insert((libhdl, name.to_owned()), addr);
        debug!("symbol {name:?} -> {addr}");
        Ok(addr)
    }

    fn alloc_mem(&self, size: usize) -> Result<DeviceAddr, BridgeError> {
        let mut args = CallArgs::new();
        args.set_u64(0, size as u64)?;
        let raw = self.call_on_worker(self.helper.alloc_buff, args)?;
        if raw == 0 {
            return Err(BridgeError::AllocFailed(size));
        }
        Ok(DeviceAddr::from_raw(raw))
    }

    fn free_mem(&self, addr: DeviceAddr) -> Result<(), BridgeError> {
        let mut args = CallArgs::new();
        args.set_u64(0, addr.into_raw())?;
        self.call_on_worker(self.helper.free_buff, args)?;
        Ok(())
    }

    fn read_mem(&self, dst: &mut [u8], src: DeviceAddr) -> Result<(), BridgeError> {
        let _ctl = self.control.lock().expect("control lock");
        let buf = StackBuffer::zeroed(dst.len());
        let id = self.worker_ctx.async_read_mem(buf.clone(), src, dst.len())?;
        let (status, retval) = self.worker_ctx.wait_result(id)?;
        if status != CommandStatus::Ok {
            return Err(BridgeError::ControlCallFailed { status, retval });
        }
        dst.copy_from_slice(&buf.to_vec());
        Ok(())
    }

    fn write_mem(&self, dst: DeviceAddr, src: &[u8]) -> Result<(), BridgeError> {
        let _ctl = self.control.lock().expect("control lock");
        let id = self.worker_ctx.async_write_mem(dst, src.to_vec())?;
        let (status, retval) = self.worker_ctx.wait_result(id)?;
        if status != CommandStatus::Ok {
            return Err(BridgeError::ControlCallFailed { status, retval });
        }
        Ok(())
    }
}

fn cstring_buffer(name: &str) -> Result<StackBuffer, BridgeError> {
    if name.len() > SYMBOL_NAME_MAX {
        return Err(BridgeError::NameTooLong);
    }
    let mut bytes = Vec::with_capacity(name.len() + 1);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    Ok(StackBuffer::from_bytes(&bytes))
}

/// Handle to one device process.
pub struct ProcessHandle {
    inner: Arc<ProcessInner>,
}

impl ProcessHandle {
    /// Create a device process on node `node` through the registered
    /// connector (see [`link::register_connector`]).
    pub fn create(node: u32) -> Result<Self, BridgeError> {
        Self::create_with_boot(link::connect(node)?)
    }

    /// Create a device process from an explicit boot object.
    pub fn create_with_boot(mut boot: Box<dyn DeviceBoot>) -> Result<Self, BridgeError> {
        let _bootstrap = BOOTSTRAP_GUARD.lock().expect("bootstrap guard");
        match Self::bootstrap(&mut boot) {
            Ok((helper, main_driver, worker_ctx)) => {
                let inner = Arc::new(ProcessInner {
                    device_no: boot.device_number(),
                    helper,
                    boot: Mutex::new(boot),
                    main_driver: Mutex::new(main_driver),
                    worker_ctx,
                    control: Mutex::new(()),
                    sym_cache: Mutex::new(HashMap::new()),
                });
                inner.worker_ctx.attach_process(Arc::downgrade(&inner));
                info!("device process ready on node {}", inner.device_no);
                Ok(ProcessHandle { inner })
            }
            Err(e) => {
                error!("device process bootstrap failed: {e}");
                boot.terminate_process();
                Err(e)
            }
        }
    }

    fn bootstrap(
        boot: &mut Box<dyn DeviceBoot>,
    ) -> Result<(HelperTable, ContextWorker, Context), BridgeError> {
        boot.map_driver_page()?;
        boot.init_syscall_area()?;
        let helper_path = link::helper_path();
        info!(
            "spawning device helper {} on node {}",
            helper_path.display(),
            boot.device_number()
        );
        let main_link = boot.spawn_process(&helper_path)?;
        signals::capture_saved_mask();

        // Drive the helper through its libc initialization to the first
        // block, where it deposits the helper table address.
        let main_shared = ContextShared::new();
        let mut main_driver = ContextWorker::new(Arc::clone(&main_shared), main_link);
        main_shared.set_state(ContextState::Running);
        main_driver.drive_to_block()?;
        let table_addr = DeviceAddr::from_raw(main_driver.collect_return_value()?);
        let mut wire = [0u8; HelperTable::WIRE_SIZE];
        main_driver.link().read_mem(&mut wire, table_addr)?;
        let helper = HelperTable::from_wire(&wire);
        if helper.version != HELPER_ABI_VERSION {
            return Err(BridgeError::HelperVersionMismatch {
                device: helper.version,
                host: HELPER_ABI_VERSION,
            });
        }
        debug!(
            "helper table at {table_addr}: load_library={} alloc_buff={} free_buff={} \
             find_sym={} create_thread={} call_func={} exit={}",
            helper.load_library,
            helper.alloc_buff,
            helper.free_buff,
            helper.find_sym,
            helper.create_thread,
            helper.call_func,
            helper.exit,
        );

        // Create the worker context: ask the helper for a new device
        // thread, hook its clone, and hand the child to a pseudo-thread.
        let worker_shared = ContextShared::new();
        main_driver.do_call(helper.create_thread, &CallArgs::new())?;
        match main_driver.exception_loop(SyscallFilter::HookClone)? {
            LoopExit::CloneRequested => {}
            other => {
                return Err(BridgeError::Bootstrap(format!(
                    "expected clone from create_thread, got {other:?}"
                )))
            }
        }
        let tid = spawn_child_context(main_driver.link(), Arc::clone(&worker_shared))?;
        main_driver.unblock(tid as u64)?;
        main_driver.drive_to_block()?;
        main_driver.collect_return_value()?;
        debug!("worker context has device thread {tid}");

        Ok((helper, main_driver, Context::from_shared(worker_shared)))
    }

    /// Device node this process runs on.
    #[must_use]
    pub fn device_number(&self) -> u32 {
        self.inner.device_no
    }

    /// Load a shared library into the device process.
    pub fn load_library(&self, name: &str) -> Result<u64, BridgeError> {
        self.inner.load_library(name)
    }

    /// Resolve a symbol in a loaded library, consulting the cache first.
    pub fn get_symbol(&self, libhdl: u64, name: &str) -> Result<DeviceAddr, BridgeError> {
        self.inner.get_symbol(libhdl, name)
    }

    /// Allocate a buffer in device memory.
    pub fn alloc_mem(&self, size: usize) -> Result<DeviceAddr, BridgeError> {
        self.inner.alloc_mem(size)
    }

    /// Free a buffer allocated with [`alloc_mem`](Self::alloc_mem).
    pub fn free_mem(&self, addr: DeviceAddr) -> Result<(), BridgeError> {
        self.inner.free_mem(addr)
    }

    /// Synchronously read device memory.
    pub fn read_mem(&self, dst: &mut [u8], src: DeviceAddr) -> Result<(), BridgeError> {
        self.inner.read_mem(dst, src)
    }

    /// Synchronously write device memory.
    pub fn write_mem(&self, dst: DeviceAddr, src: &[u8]) -> Result<(), BridgeError> {
        self.inner.write_mem(dst, src)
    }

    /// Open a new user context: a fresh device thread with its own
    /// pseudo-thread and command queue.
    pub fn open_context(&self) -> Result<Context, BridgeError> {
        let inner = &self.inner;
        let _ctl = inner.control.lock().expect("control lock");
        let create_thread = inner.helper.create_thread;
        let slot: Arc<Mutex<Option<Context>>> = Arc::new(Mutex::new(None));
        let slot_in = Arc::clone(&slot);
        let proc_weak = Arc::downgrade(inner);
        let handler: Handler = Box::new(move |worker, cmd| {
            open_context_handler(worker, cmd, create_thread, &slot_in, proc_weak)
        });
        let id = inner.worker_ctx.submit_control(handler)?;
        let (status, retval) = inner.worker_ctx.wait_result(id)?;
        if status != CommandStatus::Ok {
            return Err(BridgeError::ControlCallFailed { status, retval });
        }
        let result = slot
            .lock()
            .expect("context slot lock")
            .take()
            .ok_or_else(|| BridgeError::link("open_context produced no context"));
        result
    }

    /// Exit the device process and release the link. Open user contexts
    /// must be closed by their owners first.
    pub fn destroy(self) -> Result<(), BridgeError> {
        let inner = self.inner;
        inner.worker_ctx.close()?;
        let _ctl = inner.control.lock().expect("control lock");
        inner
            .main_driver
            .lock()
            .expect("main driver lock")
            .shutdown();
        inner.boot.lock().expect("boot lock").terminate_process();
        info!("device process on node {} destroyed", inner.device_no);
        Ok(())
    }
}

fn open_context_handler(
    worker: &mut ContextWorker,
    cmd: &mut Command,
    create_thread: DeviceAddr,
    slot: &Mutex<Option<Context>>,
    proc_weak: Weak<ProcessInner>,
) -> HandlerOutcome {
    let args = CallArgs::new();
    if let Err(e) = worker.do_call(create_thread, &args) {
        error!("open_context: create_thread call failed: {e}");
        cmd.set_result(0, CommandStatus::Error);
        return HandlerOutcome::Fatal;
    }
    match worker.exception_loop(SyscallFilter::HookClone) {
        Ok(LoopExit::CloneRequested) => {}
        Ok(LoopExit::Exception(word)) => {
            cmd.set_result(word, CommandStatus::Exception);
            return HandlerOutcome::Fatal;
        }
        Ok(other) => {
            error!("open_context: device blocked unexpectedly ({other:?})");
            cmd.set_result(0, CommandStatus::Error);
            return HandlerOutcome::Fatal;
        }
        Err(e) => {
            error!("open_context: exception loop failed: {e}");
            cmd.set_result(0, CommandStatus::Error);
            return HandlerOutcome::Fatal;
        }
    }
    let child_shared = ContextShared::new();
    let tid = match spawn_child_context(worker.link(), Arc::clone(&child_shared)) {
        Ok(tid) => tid,
        Err(e) => {
            error!("open_context: clone handling failed: {e}");
            cmd.set_result(0, CommandStatus::Error);
            return HandlerOutcome::Fatal;
        }
    };
    if let Err(e) = worker.unblock(tid as u64) {
        error!("open_context: parent unblock failed: {e}");
        cmd.set_result(0, CommandStatus::Error);
        return HandlerOutcome::Fatal;
    }
    match worker.exception_loop(SyscallFilter::Default) {
        Ok(LoopExit::Blocked) => {
            if let Err(e) = worker.collect_return_value() {
                error!("open_context: parent resync failed: {e}");
                cmd.set_result(0, CommandStatus::Error);
                return HandlerOutcome::Fatal;
            }
        }
        other => {
            error!("open_context: parent did not reach block ({other:?})");
            cmd.set_result(0, CommandStatus::Error);
            return HandlerOutcome::Fatal;
        }
    }
    let ctx = Context::from_shared(child_shared);
    ctx.attach_process(proc_weak);
    *slot.lock().expect("context slot lock") = Some(ctx);
    cmd.set_result(tid as u64, CommandStatus::Ok);
    HandlerOutcome::Continue
}
