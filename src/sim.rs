// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Deterministic in-process device: a simulated machine implementing the device link seam for tests and experiments.
// Author: Lukas Bower

//! Simulated device.
//!
//! [`SimMachine`] stands in for the device driver, device OS, and helper
//! binary behind the [`DeviceLink`]/[`DeviceBoot`] seam. Device functions
//! are host closures registered per library; they receive the marshalled
//! arguments (registers for the first eight, the stack parameter area
//! beyond that) and a window onto the flat device memory, so stack-buffer
//! intents, frame layout, and copy-back are all observable end to end.
//!
//! Device execution happens inside `wait_exception` on the calling
//! pseudo-thread, preserving the rule that a context's device side is only
//! ever entered by its own pseudo-thread. The machine is deterministic: no
//! clocks, no randomness.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::addr::DeviceAddr;
use crate::error::BridgeError;
use crate::link::{
    self, exs, sysnum, DeviceBoot, DeviceLink, HelperTable, Reg, HELPER_ABI_VERSION,
    HYPERCALL_BLOCK, NUM_ARGS_ON_REGISTER, PARAM_AREA_OFFSET,
};

/// Base of the simulated device address space.
pub const MEM_BASE: u64 = 0x6000_0000;
/// Size of the simulated device memory.
pub const MEM_SIZE: usize = 8 * 1024 * 1024;
/// Stack carved out per device thread, top down from the end of memory.
const STACK_SIZE: u64 = 1024 * 1024;
/// Bump-allocator heap range.
const HEAP_BASE: u64 = MEM_BASE + 0x2000;
const HEAP_LIMIT: u64 = MEM_BASE + 0x40_0000;
/// The helper table lives at the bottom of memory.
const TABLE_ADDR: u64 = MEM_BASE;

// Helper entry points occupy a reserved range outside data memory.
const HELPER_FN_BASE: u64 = 0xf000_0000;
const LOAD_LIBRARY_FN: u64 = HELPER_FN_BASE + 0x10;
const ALLOC_BUFF_FN: u64 = HELPER_FN_BASE + 0x20;
const FREE_BUFF_FN: u64 = HELPER_FN_BASE + 0x30;
const FIND_SYM_FN: u64 = HELPER_FN_BASE + 0x40;
const CREATE_THREAD_FN: u64 = HELPER_FN_BASE + 0x50;
const CALL_FUNC_FN: u64 = HELPER_FN_BASE + 0x60;
const EXIT_FN: u64 = HELPER_FN_BASE + 0x70;
/// Registered device functions get addresses from here up.
const USER_FN_BASE: u64 = 0xf100_0000;

/// What a simulated device function does when it finishes.
pub enum SimOutcome {
    /// Return normally; the device parks at the block hypercall with this
    /// value.
    Return(u64),
    /// End by issuing this raw system call; the value the host delivers
    /// on resume becomes the function's return value.
    Syscall(i64),
    /// Raise a memory trap.
    Fault,
}

/// Marshalled arguments as the device sees them.
pub struct SimArgs {
    regs: [u64; NUM_ARGS_ON_REGISTER],
    param_words: Vec<u64>,
}

impl SimArgs {
    /// Argument `i`: registers for the first eight, the stack parameter
    /// area beyond.
    #[must_use]
    pub fn arg(&self, i: usize) -> u64 {
        if i < NUM_ARGS_ON_REGISTER {
            self.regs[i]
        } else {
            self.param_words.get(i).copied().unwrap_or(0)
        }
    }
}

/// Mutable window onto simulated device memory for device functions.
pub struct SimMem<'a> {
    mem: &'a mut [u8],
}

impl SimMem<'_> {
    fn range(&self, addr: DeviceAddr, len: usize) -> std::ops::Range<usize> {
        let a = addr.into_raw();
        assert!(
            a >= MEM_BASE && a + len as u64 <= MEM_BASE + MEM_SIZE as u64,
            "device access out of bounds: {addr} + {len}"
        );
        let at = (a - MEM_BASE) as usize;
        at..at + len
    }

    /// Read `len` bytes at `addr`.
    #[must_use]
    pub fn read(&self, addr: DeviceAddr, len: usize) -> Vec<u8> {
        self.mem[self.range(addr, len)].to_vec()
    }

    /// Write `bytes` at `addr`.
    pub fn write(&mut self, addr: DeviceAddr, bytes: &[u8]) {
        let range = self.range(addr, bytes.len());
        self.mem[range].copy_from_slice(bytes);
    }

    /// Read a little-endian u32.
    #[must_use]
    pub fn read_u32(&self, addr: DeviceAddr) -> u32 {
        u32::from_le_bytes(self.read(addr, 4).try_into().expect("4 bytes"))
    }

    /// Write a little-endian u32.
    pub fn write_u32(&mut self, addr: DeviceAddr, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }

    /// Read a nul-terminated string (capped at 4 KiB).
    #[must_use]
    pub fn read_cstr(&self, addr: DeviceAddr) -> String {
        let mut out = Vec::new();
        for i in 0..4096u64 {
            let byte = self.read(addr.add(i), 1)[0];
            if byte == 0 {
                break;
            }
            out.push(byte);
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

type SimFunction = Arc<dyn Fn(&mut SimMem<'_>, &SimArgs) -> SimOutcome + Send + Sync>;

struct Event {
    word: u64,
    frame: Option<(i64, [u64; 6])>,
}

impl Event {
    fn spurious() -> Self {
        Event {
            word: 0,
            frame: None,
        }
    }

    fn block(retval: u64, sp: u64) -> Self {
        Event {
            word: exs::MONC,
            frame: Some((sysnum::HYPERCALL, [HYPERCALL_BLOCK, retval, 0, 0, 0, sp])),
        }
    }

    fn syscall(num: i64) -> Self {
        Event {
            word: exs::MONC,
            frame: Some((num, [0; 6])),
        }
    }

    fn fault() -> Self {
        Event {
            word: exs::MONT,
            frame: None,
        }
    }
}

enum RunState {
    /// Parked at the block hypercall; unblock starts the function at PC.
    Parked,
    /// Stopped inside a function-raised system call; resume delivers the
    /// call's result as the function's return value.
    InSyscall,
    /// Work to perform at the next exception wait.
    StartPending(StartKind),
    /// Torn down.
    Terminated,
}

enum StartKind {
    RunFunction,
    FirstBlock,
    ReturnAndBlock(u64),
}

struct SimThread {
    tid: i64,
    pc: u64,
    sp: u64,
    arg_regs: [u64; NUM_ARGS_ON_REGISTER],
    home_sp: u64,
    pending: VecDeque<Event>,
    run: RunState,
    cur_sysnum: i64,
    cur_frame: [u64; 6],
}

struct MachineInner {
    node: u32,
    mem: Mutex<Vec<u8>>,
    heap_next: Mutex<u64>,
    allocs: Mutex<HashMap<u64, usize>>,
    libs: Mutex<HashMap<String, u64>>,
    syms: Mutex<HashMap<(u64, String), u64>>,
    fns: Mutex<HashMap<u64, SimFunction>>,
    next_fn: AtomicU64,
    next_lib: AtomicU64,
    next_tid: AtomicI64,
    thread_slots: AtomicU64,
    find_sym_calls: AtomicU64,
    forwarded: Mutex<Vec<i64>>,
    rejected: Mutex<Vec<i64>>,
    boot_events: Mutex<Vec<String>>,
    spawned_helper: Mutex<Option<PathBuf>>,
    /// Version written into the helper table at spawn; tests can skew it.
    table_version: AtomicU64,
}

impl MachineInner {
    fn event(&self, what: impl Into<String>) {
        self.boot_events
            .lock()
            .expect("events lock")
            .push(what.into());
    }

    fn spawn_thread(self: &Arc<Self>, first: StartKind) -> (i64, Arc<SimLink>) {
        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        let slot = self.thread_slots.fetch_add(1, Ordering::SeqCst);
        let home_sp = MEM_BASE + MEM_SIZE as u64 - slot * STACK_SIZE;
        let thread = SimThread {
            tid,
            pc: 0,
            sp: home_sp,
            arg_regs: [0; NUM_ARGS_ON_REGISTER],
            home_sp,
            pending: VecDeque::new(),
            run: RunState::StartPending(first),
            cur_sysnum: 0,
            cur_frame: [0; 6],
        };
        let link = Arc::new(SimLink {
            machine: Arc::clone(self),
            thread: Mutex::new(thread),
        });
        (tid, link)
    }

    fn bump_alloc(&self, size: usize) -> u64 {
        let mut next = self.heap_next.lock().expect("heap lock");
        let at = (*next + 15) & !15;
        if at + size as u64 > HEAP_LIMIT {
            return 0;
        }
        *next = at + size as u64;
        self.allocs.lock().expect("allocs lock").insert(at, size);
        at
    }
}

/// Handle to one simulated device process.
#[derive(Clone)]
pub struct SimMachine {
    inner: Arc<MachineInner>,
}

impl SimMachine {
    /// A fresh machine for device node `node`.
    #[must_use]
    pub fn new(node: u32) -> Self {
        SimMachine {
            inner: Arc::new(MachineInner {
                node,
                mem: Mutex::new(vec![0; MEM_SIZE]),
                heap_next: Mutex::new(HEAP_BASE),
                allocs: Mutex::new(HashMap::new()),
                libs: Mutex::new(HashMap::new()),
                syms: Mutex::new(HashMap::new()),
                fns: Mutex::new(HashMap::new()),
                next_fn: AtomicU64::new(USER_FN_BASE),
                next_lib: AtomicU64::new(0x10),
                next_tid: AtomicI64::new(1),
                thread_slots: AtomicU64::new(0),
                find_sym_calls: AtomicU64::new(0),
                forwarded: Mutex::new(Vec::new()),
                rejected: Mutex::new(Vec::new()),
                boot_events: Mutex::new(Vec::new()),
                spawned_helper: Mutex::new(None),
                table_version: AtomicU64::new(HELPER_ABI_VERSION),
            }),
        }
    }

    /// Boot object for [`crate::ProcessHandle::create_with_boot`].
    #[must_use]
    pub fn boot(&self) -> Box<dyn DeviceBoot> {
        Box::new(SimBoot {
            machine: Arc::clone(&self.inner),
        })
    }

    /// Install this machine as the global connector so
    /// [`crate::ProcessHandle::create`] resolves to it.
    pub fn install_as_connector(&self) {
        let inner = Arc::clone(&self.inner);
        link::register_connector(Box::new(move |node| {
            if node == inner.node {
                Ok(Box::new(SimBoot {
                    machine: Arc::clone(&inner),
                }))
            } else {
                Err(BridgeError::link(format!("no simulated device {node}")))
            }
        }));
    }

    /// Register (or fetch) a device library by name.
    #[must_use]
    pub fn library(&self, name: &str) -> SimLibrary {
        let mut libs = self.inner.libs.lock().expect("libs lock");
        let handle = *libs
            .entry(name.to_owned())
            .or_insert_with(|| self.inner.next_lib.fetch_add(0x10, Ordering::SeqCst));
        SimLibrary {
            machine: Arc::clone(&self.inner),
            handle,
        }
    }

    /// Skew the helper table version to provoke the bootstrap mismatch.
    pub fn set_table_version(&self, version: u64) {
        self.inner.table_version.store(version, Ordering::SeqCst);
    }

    /// How often the device-side find-symbol entry point ran.
    #[must_use]
    pub fn find_sym_invocations(&self) -> u64 {
        self.inner.find_sym_calls.load(Ordering::SeqCst)
    }

    /// System calls forwarded to the host, in order.
    #[must_use]
    pub fn forwarded_syscalls(&self) -> Vec<i64> {
        self.inner.forwarded.lock().expect("forwarded lock").clone()
    }

    /// System calls refused by the filter, in order.
    #[must_use]
    pub fn rejected_syscalls(&self) -> Vec<i64> {
        self.inner.rejected.lock().expect("rejected lock").clone()
    }

    /// Device allocations still outstanding.
    #[must_use]
    pub fn outstanding_allocs(&self) -> usize {
        self.inner.allocs.lock().expect("allocs lock").len()
    }

    /// Helper binary path the device OS was asked to load.
    #[must_use]
    pub fn spawned_helper(&self) -> Option<PathBuf> {
        self.inner.spawned_helper.lock().expect("helper lock").clone()
    }

    /// Boot steps observed, in order.
    #[must_use]
    pub fn boot_events(&self) -> Vec<String> {
        self.inner.boot_events.lock().expect("events lock").clone()
    }

    /// Test access: read device memory directly.
    #[must_use]
    pub fn peek_mem(&self, addr: DeviceAddr, len: usize) -> Vec<u8> {
        let mem = self.inner.mem.lock().expect("mem lock");
        let at = (addr.into_raw() - MEM_BASE) as usize;
        mem[at..at + len].to_vec()
    }

    /// Test access: write device memory directly.
    pub fn poke_mem(&self, addr: DeviceAddr, bytes: &[u8]) {
        let mut mem = self.inner.mem.lock().expect("mem lock");
        let at = (addr.into_raw() - MEM_BASE) as usize;
        mem[at..at + bytes.len()].copy_from_slice(bytes);
    }
}

/// A registered device library.
pub struct SimLibrary {
    machine: Arc<MachineInner>,
    handle: u64,
}

impl SimLibrary {
    /// The handle `load_library` will return for this library.
    #[must_use]
    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// Define a device function; returns the address `find_sym` resolves.
    pub fn define<F>(&self, name: &str, f: F) -> DeviceAddr
    where
        F: Fn(&mut SimMem<'_>, &SimArgs) -> SimOutcome + Send + Sync + 'static,
    {
        let addr = self.machine.next_fn.fetch_add(0x10, Ordering::SeqCst);
        self.machine
            .fns
            .lock()
            .expect("fns lock")
            .insert(addr, Arc::new(f));
        self.machine
            .syms
            .lock()
            .expect("syms lock")
            .insert((self.handle, name.to_owned()), addr);
        debug!("sim: {name:?} defined at {addr:#x}");
        DeviceAddr::from_raw(addr)
    }
}

struct SimBoot {
    machine: Arc<MachineInner>,
}

impl DeviceBoot for SimBoot {
    fn map_driver_page(&mut self) -> Result<(), BridgeError> {
        self.machine.event("map_driver_page");
        Ok(())
    }

    fn init_syscall_area(&mut self) -> Result<(), BridgeError> {
        self.machine.event("init_syscall_area");
        Ok(())
    }

    fn spawn_process(&mut self, helper: &Path) -> Result<Arc<dyn DeviceLink>, BridgeError> {
        self.machine.event(format!("spawn_process {}", helper.display()));
        *self.machine.spawned_helper.lock().expect("helper lock") = Some(helper.to_owned());
        let table = HelperTable {
            version: self.machine.table_version.load(Ordering::SeqCst),
            load_library: DeviceAddr::from_raw(LOAD_LIBRARY_FN),
            alloc_buff: DeviceAddr::from_raw(ALLOC_BUFF_FN),
            free_buff: DeviceAddr::from_raw(FREE_BUFF_FN),
            find_sym: DeviceAddr::from_raw(FIND_SYM_FN),
            create_thread: DeviceAddr::from_raw(CREATE_THREAD_FN),
            call_func: DeviceAddr::from_raw(CALL_FUNC_FN),
            exit: DeviceAddr::from_raw(EXIT_FN),
        };
        {
            let mut mem = self.machine.mem.lock().expect("mem lock");
            let at = (TABLE_ADDR - MEM_BASE) as usize;
            mem[at..at + HelperTable::WIRE_SIZE].copy_from_slice(&table.to_wire());
        }
        let (_tid, link) = self.machine.spawn_thread(StartKind::FirstBlock);
        {
            // The helper performs some libc setup before depositing the
            // table; model it as one spurious wake, then the first block.
            let mut thread = link.thread.lock().expect("thread lock");
            thread.pending.push_back(Event::spurious());
            let sp = thread.home_sp;
            thread.pending.push_back(Event::block(TABLE_ADDR, sp));
            thread.run = RunState::Parked;
        }
        Ok(link)
    }

    fn terminate_process(&mut self) {
        self.machine.event("terminate_process");
    }

    fn device_number(&self) -> u32 {
        self.machine.node
    }
}

/// Device link for one simulated thread.
pub struct SimLink {
    machine: Arc<MachineInner>,
    thread: Mutex<SimThread>,
}

impl SimLink {
    fn deliver(&self, thread: &mut SimThread, ev: Event) -> u64 {
        if let Some((num, frame)) = ev.frame {
            thread.cur_sysnum = num;
            thread.cur_frame = frame;
            thread.run = if num == sysnum::HYPERCALL && frame[0] == HYPERCALL_BLOCK {
                RunState::Parked
            } else {
                RunState::InSyscall
            };
        }
        ev.word
    }

    fn snapshot_args(&self, thread: &SimThread) -> SimArgs {
        let mut param_words = vec![0u64; 64];
        let mem = self.machine.mem.lock().expect("mem lock");
        for (i, word) in param_words.iter_mut().enumerate() {
            let addr = thread.sp + PARAM_AREA_OFFSET as u64 + 8 * i as u64;
            if addr >= MEM_BASE && addr + 8 <= MEM_BASE + MEM_SIZE as u64 {
                let at = (addr - MEM_BASE) as usize;
                *word = u64::from_le_bytes(mem[at..at + 8].try_into().expect("8 bytes"));
            }
        }
        SimArgs {
            regs: thread.arg_regs,
            param_words,
        }
    }

    fn read_cstr(&self, addr: u64) -> String {
        if addr < MEM_BASE {
            return String::new();
        }
        let mem = self.machine.mem.lock().expect("mem lock");
        let mut out = Vec::new();
        let mut at = (addr - MEM_BASE) as usize;
        while at < mem.len() && mem[at] != 0 && out.len() < 4096 {
            out.push(mem[at]);
            at += 1;
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Run the function at the thread's program counter to its next stop.
    fn execute(&self, thread: &mut SimThread) -> Event {
        let addr = thread.pc;
        let home_sp = thread.home_sp;
        trace!("sim tid {}: executing {addr:#x}", thread.tid);
        match addr {
            LOAD_LIBRARY_FN => {
                let name = self.read_cstr(thread.arg_regs[0]);
                let handle = self
                    .machine
                    .libs
                    .lock()
                    .expect("libs lock")
                    .get(&name)
                    .copied()
                    .unwrap_or(0);
                debug!("sim: load_library({name:?}) -> {handle:#x}");
                Event::block(handle, home_sp)
            }
            FIND_SYM_FN => {
                self.machine.find_sym_calls.fetch_add(1, Ordering::SeqCst);
                let libhdl = thread.arg_regs[0];
                let name = self.read_cstr(thread.arg_regs[1]);
                let addr = self
                    .machine
                    .syms
                    .lock()
                    .expect("syms lock")
                    .get(&(libhdl, name.clone()))
                    .copied()
                    .unwrap_or(0);
                debug!("sim: find_sym({libhdl:#x}, {name:?}) -> {addr:#x}");
                Event::block(addr, home_sp)
            }
            ALLOC_BUFF_FN => {
                let size = thread.arg_regs[0] as usize;
                Event::block(self.machine.bump_alloc(size), home_sp)
            }
            FREE_BUFF_FN => {
                let at = thread.arg_regs[0];
                self.machine.allocs.lock().expect("allocs lock").remove(&at);
                Event::block(0, home_sp)
            }
            CREATE_THREAD_FN => Event::syscall(sysnum::CLONE),
            EXIT_FN | CALL_FUNC_FN => Event::block(0, home_sp),
            _ => {
                let func = self.machine.fns.lock().expect("fns lock").get(&addr).cloned();
                match func {
                    Some(func) => {
                        let args = self.snapshot_args(thread);
                        let mut mem = self.machine.mem.lock().expect("mem lock");
                        let mut window = SimMem {
                            mem: mem.as_mut_slice(),
                        };
                        match func(&mut window, &args) {
                            SimOutcome::Return(rv) => Event::block(rv, home_sp),
                            SimOutcome::Syscall(num) => Event::syscall(num),
                            SimOutcome::Fault => Event::fault(),
                        }
                    }
                    None => Event::fault(),
                }
            }
        }
    }
}

impl DeviceLink for SimLink {
    fn wait_exception(&self) -> io::Result<u64> {
        let mut thread = self.thread.lock().expect("thread lock");
        loop {
            if let Some(ev) = thread.pending.pop_front() {
                return Ok(self.deliver(&mut thread, ev));
            }
            let next = match std::mem::replace(&mut thread.run, RunState::Parked) {
                RunState::StartPending(StartKind::RunFunction) => self.execute(&mut thread),
                RunState::StartPending(StartKind::FirstBlock) => Event::block(0, thread.home_sp),
                RunState::StartPending(StartKind::ReturnAndBlock(rv)) => {
                    Event::block(rv, thread.home_sp)
                }
                RunState::Terminated => {
                    return Err(io::Error::other("simulated device thread terminated"))
                }
                state => {
                    thread.run = state;
                    return Err(io::Error::other("simulated device is idle"));
                }
            };
            thread.pending.push_back(next);
        }
    }

    fn syscall_number(&self) -> Result<i64, BridgeError> {
        Ok(self.thread.lock().expect("thread lock").cur_sysnum)
    }

    fn syscall_args(&self, count: usize) -> Result<Vec<u64>, BridgeError> {
        let thread = self.thread.lock().expect("thread lock");
        Ok(thread.cur_frame[..count.min(6)].to_vec())
    }

    fn set_register(&self, reg: Reg, value: u64) -> Result<(), BridgeError> {
        let mut thread = self.thread.lock().expect("thread lock");
        match reg {
            Reg::ProgramCounter => thread.pc = value,
            Reg::StackPointer => thread.sp = value,
            Reg::Arg(i) => {
                if i >= NUM_ARGS_ON_REGISTER {
                    return Err(BridgeError::link(format!("no argument register {i}")));
                }
                thread.arg_regs[i] = value;
            }
        }
        Ok(())
    }

    fn read_mem(&self, dst: &mut [u8], src: DeviceAddr) -> Result<(), BridgeError> {
        let mem = self.machine.mem.lock().expect("mem lock");
        let a = src.into_raw();
        if a < MEM_BASE || a + dst.len() as u64 > MEM_BASE + MEM_SIZE as u64 {
            return Err(BridgeError::BadDeviceAccess(src));
        }
        let at = (a - MEM_BASE) as usize;
        dst.copy_from_slice(&mem[at..at + dst.len()]);
        Ok(())
    }

    fn write_mem(&self, dst: DeviceAddr, src: &[u8]) -> Result<(), BridgeError> {
        let mut mem = self.machine.mem.lock().expect("mem lock");
        let a = dst.into_raw();
        if a < MEM_BASE || a + src.len() as u64 > MEM_BASE + MEM_SIZE as u64 {
            return Err(BridgeError::BadDeviceAccess(dst));
        }
        let at = (a - MEM_BASE) as usize;
        mem[at..at + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn forward_syscall(&self, num: i64) -> Result<(), BridgeError> {
        self.machine.forwarded.lock().expect("forwarded lock").push(num);
        let mut thread = self.thread.lock().expect("thread lock");
        thread.run = RunState::StartPending(StartKind::ReturnAndBlock(0));
        Ok(())
    }

    fn unblock(&self, retval: u64) -> Result<(), BridgeError> {
        let mut thread = self.thread.lock().expect("thread lock");
        let next = match &thread.run {
            RunState::Parked => RunState::StartPending(StartKind::RunFunction),
            RunState::InSyscall => RunState::StartPending(StartKind::ReturnAndBlock(retval)),
            _ => return Err(BridgeError::link("unblock while device not stopped")),
        };
        thread.run = next;
        Ok(())
    }

    fn reject_syscall(&self, num: i64, errno: i32) -> Result<(), BridgeError> {
        self.machine.rejected.lock().expect("rejected lock").push(num);
        let mut thread = self.thread.lock().expect("thread lock");
        let next = match &thread.run {
            RunState::InSyscall => {
                let rv = -(i64::from(errno)) as u64;
                RunState::StartPending(StartKind::ReturnAndBlock(rv))
            }
            _ => return Err(BridgeError::link("reject while device not in a syscall")),
        };
        thread.run = next;
        Ok(())
    }

    fn notify_blocked(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    fn clone_thread(&self) -> Result<(i64, Arc<dyn DeviceLink>), BridgeError> {
        let (tid, link) = self.machine.spawn_thread(StartKind::FirstBlock);
        debug!("sim: cloned device thread {tid}");
        Ok((tid, link))
    }

    fn instruction_counters(&self) -> Result<(u64, u64), BridgeError> {
        let thread = self.thread.lock().expect("thread lock");
        Ok((thread.pc, 0))
    }

    fn terminate_thread(&self) {
        let mut thread = self.thread.lock().expect("thread lock");
        thread.run = RunState::Terminated;
        thread.pending.clear();
    }
}
