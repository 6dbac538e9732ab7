// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Context: the device thread plus the host pseudo-thread that drives its exception/syscall loop and serves its command queue.
// Author: Lukas Bower

//! Contexts and their workers.
//!
//! A [`Context`] is the unit of asynchronous submission: one device thread
//! paired with one host pseudo-thread. While the device runs, the
//! pseudo-thread sits in the exception loop forwarding or filtering device
//! system calls; when the device parks at the block hypercall, the
//! pseudo-thread switches to serving the context's request queue. Each
//! request handler typically marshals a call, unblocks the device, rides
//! the exception loop to the next block, and collects the return value.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread;

use log::{debug, error, trace, warn};
use once_cell::sync::Lazy;

use crate::addr::DeviceAddr;
use crate::args::{CallArgs, StackBuffer};
use crate::command::{Command, Handler, HandlerOutcome};
use crate::error::{BridgeError, CommandStatus, ContextState};
use crate::link::{exs, sysnum, DeviceLink, Reg, HYPERCALL_BLOCK};
use crate::process::ProcessInner;
use crate::queue::CommQueue;
use crate::signals::{self, SignalWindow};
use crate::REQUEST_ID_INVALID;

/// System calls the default filter refuses with `-ENOSYS`: anything that
/// would fork, exec, exit, or rearrange signal handling under the device
/// OS's feet.
static DEFAULT_FILTERED: Lazy<HashSet<i64>> = Lazy::new(|| {
    use crate::link::sysnum::*;
    [
        RT_SIGACTION,
        RT_SIGRETURN,
        FORK,
        VFORK,
        EXECVE,
        EXIT,
        WAIT4,
        RT_SIGPENDING,
        RT_SIGTIMEDWAIT,
        RT_SIGSUSPEND,
        SIGALTSTACK,
        EXIT_GROUP,
        SIGNALFD,
        SIGNALFD4,
    ]
    .into_iter()
    .collect()
});

static NEXT_CTX_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct ContextShared {
    ctx_id: u64,
    comq: CommQueue,
    state: AtomicU8,
    seq_no: AtomicU64,
    pending: Mutex<HashSet<u64>>,
    proc: Mutex<Weak<ProcessInner>>,
}

impl ContextShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(ContextShared {
            ctx_id: NEXT_CTX_ID.fetch_add(1, Ordering::Relaxed),
            comq: CommQueue::new(),
            state: AtomicU8::new(ContextState::Unknown as u8),
            seq_no: AtomicU64::new(1),
            pending: Mutex::new(HashSet::new()),
            proc: Mutex::new(Weak::new()),
        })
    }

    pub(crate) fn state(&self) -> ContextState {
        match self.state.load(Ordering::Acquire) {
            0 => ContextState::Unknown,
            1 => ContextState::Running,
            2 => ContextState::Syscall,
            3 => ContextState::Blocked,
            _ => ContextState::Exit,
        }
    }

    pub(crate) fn set_state(&self, state: ContextState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Issue a fresh request ID, never 0 and never the invalid sentinel.
    fn issue_request_id(&self) -> u64 {
        loop {
            let id = self.seq_no.fetch_add(1, Ordering::SeqCst);
            if id != 0 && id != REQUEST_ID_INVALID {
                return id;
            }
        }
    }
}

/// How the exception loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// The device requested BLOCK; the context is now BLOCKED.
    Blocked,
    /// The clone hook caught a clone system call.
    CloneRequested,
    /// Fatal hardware exception; the word is carried for diagnostics.
    Exception(u64),
    /// The context left RUNNING for another reason (already EXIT).
    Terminated,
}

/// The syscall filters, closed so match exhaustiveness is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyscallFilter {
    /// Reject the blacklist, recognize BLOCK, forward the rest.
    Default,
    /// Like `Default`, but intercept clone during context creation.
    HookClone,
}

enum Verdict {
    Forward,
    Rejected,
    Block,
    Clone,
}

enum Step {
    Handled,
    Break(LoopExit),
}

/// Worker half of a context: owned by exactly one pseudo-thread (or, for
/// the main context, parked under the process mutex between uses).
pub(crate) struct ContextWorker {
    shared: Arc<ContextShared>,
    link: Arc<dyn DeviceLink>,
    sp: DeviceAddr,
}

impl ContextWorker {
    pub(crate) fn new(shared: Arc<ContextShared>, link: Arc<dyn DeviceLink>) -> Self {
        ContextWorker {
            shared,
            link,
            sp: DeviceAddr::NULL,
        }
    }

    pub(crate) fn link(&self) -> &Arc<dyn DeviceLink> {
        &self.link
    }

    fn ctx_id(&self) -> u64 {
        self.shared.ctx_id
    }

    /// Wait for a real exception word, swallowing EINTR and spurious
    /// wakeups. Signals are deliverable only while inside the wait.
    fn next_exception(&self) -> Result<u64, BridgeError> {
        loop {
            let word = {
                let _window = SignalWindow::open();
                match self.link.wait_exception() {
                    Ok(word) => word,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(BridgeError::ExceptionWait(e)),
                }
            };
            if word & exs::EXCEPTION_MASK == 0 {
                trace!("ctx {}: spurious wakeup (exs {:#x})", self.ctx_id(), word);
                continue;
            }
            return Ok(word);
        }
    }

    fn is_block_hypercall(&self, num: i64) -> Result<bool, BridgeError> {
        if num != sysnum::HYPERCALL {
            return Ok(false);
        }
        let args = self.link.syscall_args(2)?;
        Ok(args.first().copied() == Some(HYPERCALL_BLOCK))
    }

    fn filter_verdict(&self, filter: SyscallFilter, num: i64) -> Result<Verdict, BridgeError> {
        if filter == SyscallFilter::HookClone && num == sysnum::CLONE {
            return Ok(Verdict::Clone);
        }
        if DEFAULT_FILTERED.contains(&num) {
            return Ok(Verdict::Rejected);
        }
        if self.is_block_hypercall(num)? {
            return Ok(Verdict::Block);
        }
        Ok(Verdict::Forward)
    }

    fn handle_single_exception(&mut self, filter: SyscallFilter) -> Result<Step, BridgeError> {
        let word = self.next_exception()?;
        trace!("ctx {}: exs {:#018x}", self.ctx_id(), word);
        if word & exs::MONC != 0 {
            let num = self.link.syscall_number()?;
            match self.filter_verdict(filter, num)? {
                Verdict::Rejected => {
                    error!(
                        "ctx {}: syscall {} is not allowed in offloaded code",
                        self.ctx_id(),
                        num
                    );
                    self.link.reject_syscall(num, libc::ENOSYS)?;
                }
                Verdict::Block => {
                    self.link.notify_blocked()?;
                    self.shared.set_state(ContextState::Blocked);
                    return Ok(Step::Break(LoopExit::Blocked));
                }
                Verdict::Clone => return Ok(Step::Break(LoopExit::CloneRequested)),
                Verdict::Forward => {
                    trace!("ctx {}: forwarding syscall {}", self.ctx_id(), num);
                    self.shared.set_state(ContextState::Syscall);
                    self.link.forward_syscall(num)?;
                    self.shared.set_state(ContextState::Running);
                }
            }
        }
        let fatal = word & (exs::MONT | exs::UNCORRECTABLE) != 0
            || (word & exs::CORRECTABLE != 0 && word & (exs::MONC | exs::RDBG) == 0);
        if fatal {
            error!(
                "ctx {}: fatal device exception (exs {:#018x})",
                self.ctx_id(),
                word
            );
            let _ = self.link.notify_blocked();
            match self.link.instruction_counters() {
                Ok((ic, ice)) => error!("ctx {}: IC={:#x} ICE={:#x}", self.ctx_id(), ic, ice),
                Err(e) => error!("ctx {}: instruction counters unavailable: {e}", self.ctx_id()),
            }
            return Ok(Step::Break(LoopExit::Exception(word)));
        }
        Ok(Step::Handled)
    }

    /// Run the exception loop while the context is RUNNING.
    pub(crate) fn exception_loop(
        &mut self,
        filter: SyscallFilter,
    ) -> Result<LoopExit, BridgeError> {
        while self.shared.state() == ContextState::Running {
            match self.handle_single_exception(filter)? {
                Step::Handled => {}
                Step::Break(exit) => return Ok(exit),
            }
        }
        Ok(LoopExit::Terminated)
    }

    /// Run until the device voluntarily blocks; anything else is a
    /// bootstrap failure.
    pub(crate) fn drive_to_block(&mut self) -> Result<(), BridgeError> {
        match self.exception_loop(SyscallFilter::Default)? {
            LoopExit::Blocked => Ok(()),
            other => Err(BridgeError::Bootstrap(format!(
                "device stopped unexpectedly during bring-up: {other:?}"
            ))),
        }
    }

    /// Resume the device, seeding the first argument register.
    pub(crate) fn unblock(&mut self, sr0: u64) -> Result<(), BridgeError> {
        self.link.unblock(sr0)?;
        self.shared.set_state(ContextState::Running);
        Ok(())
    }

    /// Read (retval, sp) out of the block hypercall the device is parked
    /// at, updating the stored stack pointer.
    pub(crate) fn collect_return_value(&mut self) -> Result<u64, BridgeError> {
        let args = self.link.syscall_args(6)?;
        if args.first().copied() != Some(HYPERCALL_BLOCK) {
            return Err(BridgeError::link(
                "device is not parked at the block hypercall",
            ));
        }
        self.sp = DeviceAddr::from_raw(args[5]);
        trace!(
            "ctx {}: block retval {:#x}, sp {}",
            self.ctx_id(),
            args[1],
            self.sp
        );
        Ok(args[1])
    }

    /// Start a device function: program counter, register arguments, stack
    /// frame, then unblock.
    pub(crate) fn do_call(
        &mut self,
        addr: DeviceAddr,
        args: &CallArgs,
    ) -> Result<(), BridgeError> {
        debug!("ctx {}: call {}", self.ctx_id(), addr);
        self.link.set_register(Reg::ProgramCounter, addr.into_raw())?;
        let marshalled = args.marshal(self.sp)?;
        for (i, value) in marshalled.reg_vals.iter().enumerate() {
            self.link.set_register(Reg::Arg(i), *value)?;
        }
        if let Some(frame) = marshalled.frame {
            self.link.write_mem(frame.addr, &frame.image)?;
            self.sp = frame.addr;
        }
        self.link
            .set_register(Reg::StackPointer, self.sp.into_raw())?;
        self.unblock(marshalled.reg_vals.first().copied().unwrap_or(0))
    }

    /// Ride out a device call started by [`do_call`]: wait for the next
    /// block, collect the result, perform copy-back.
    pub(crate) fn finish_call(&mut self, cmd: &mut Command, args: &CallArgs) -> HandlerOutcome {
        match self.exception_loop(SyscallFilter::Default) {
            Ok(LoopExit::Blocked) => {
                let retval = match self.collect_return_value() {
                    Ok(retval) => retval,
                    Err(e) => {
                        error!("ctx {}: result collection failed: {e}", self.ctx_id());
                        cmd.set_result(0, CommandStatus::Error);
                        return HandlerOutcome::Fatal;
                    }
                };
                cmd.set_result(retval, CommandStatus::Ok);
                if args.has_copy_back() {
                    let link = Arc::clone(&self.link);
                    if let Err(e) = args.copy_back(self.sp, |dst, src| link.read_mem(dst, src)) {
                        error!("ctx {}: copy-back failed: {e}", self.ctx_id());
                        cmd.set_result(retval, CommandStatus::Error);
                    }
                }
                HandlerOutcome::Continue
            }
            Ok(LoopExit::Exception(word)) => {
                cmd.set_result(word, CommandStatus::Exception);
                HandlerOutcome::Fatal
            }
            Ok(exit) => {
                error!("ctx {}: device call ended with {exit:?}", self.ctx_id());
                cmd.set_result(0, CommandStatus::Error);
                HandlerOutcome::Fatal
            }
            Err(e) => {
                error!("ctx {}: device call failed: {e}", self.ctx_id());
                cmd.set_result(0, CommandStatus::Error);
                HandlerOutcome::Fatal
            }
        }
    }

    /// BLOCKED event loop: pop requests, run them, push completions.
    pub(crate) fn event_loop(&mut self) {
        while self.shared.state() == ContextState::Blocked {
            let popped = {
                let _window = SignalWindow::open();
                self.shared.comq.pop_request()
            };
            let Some(mut cmd) = popped else { break };
            trace!("ctx {}: serving request {}", self.ctx_id(), cmd.id());
            match cmd.invoke(self) {
                HandlerOutcome::Continue => self.shared.comq.push_completion(cmd),
                HandlerOutcome::Fatal => {
                    error!(
                        "ctx {}: internal error executing request {}",
                        self.ctx_id(),
                        cmd.id()
                    );
                    self.shared.set_state(ContextState::Exit);
                    self.shared.comq.close_request_side();
                    self.shared.comq.push_completion(cmd);
                    break;
                }
                HandlerOutcome::Shutdown => {
                    self.shared.comq.push_completion(cmd);
                    break;
                }
            }
        }
        self.drain_requests();
    }

    /// Answer every request still queued after exit so no waiter hangs.
    fn drain_requests(&mut self) {
        self.shared.comq.close_request_side();
        while let Some(mut cmd) = self.shared.comq.pop_request() {
            warn!(
                "ctx {}: completing request {} with error after exit",
                self.ctx_id(),
                cmd.id()
            );
            cmd.set_result(0, CommandStatus::Error);
            self.shared.comq.push_completion(cmd);
        }
    }

    /// Shut this context down from inside a handler (close command).
    pub(crate) fn shutdown(&mut self) {
        self.link.terminate_thread();
        self.shared.set_state(ContextState::Exit);
    }

    /// Body of a freshly cloned pseudo-thread: adopt the child signal
    /// mask, run to the first block to capture the stack pointer, then
    /// serve the queue.
    fn run_child(mut self, ready: mpsc::Sender<()>) {
        signals::adopt_child_mask();
        self.shared.set_state(ContextState::Running);
        let _ = ready.send(());
        match self.exception_loop(SyscallFilter::Default) {
            Ok(LoopExit::Blocked) => {
                if let Err(e) = self.collect_return_value() {
                    error!("ctx {}: first block malformed: {e}", self.ctx_id());
                    self.shared.set_state(ContextState::Exit);
                    self.drain_requests();
                    return;
                }
                trace!("ctx {}: child context ready, sp {}", self.ctx_id(), self.sp);
            }
            other => {
                error!(
                    "ctx {}: child context failed to reach first block: {other:?}",
                    self.ctx_id()
                );
                self.shared.set_state(ContextState::Exit);
                self.drain_requests();
                return;
            }
        }
        self.event_loop();
    }
}

/// Service a pending clone request: create the device thread through the
/// parent's link and start the pseudo-thread that owns the new context.
/// Returns the device thread ID to deliver to the parent.
pub(crate) fn spawn_child_context(
    parent_link: &Arc<dyn DeviceLink>,
    shared: Arc<ContextShared>,
) -> Result<i64, BridgeError> {
    let (tid, child_link) = parent_link.clone_thread()?;
    let worker = ContextWorker::new(shared, child_link);
    let (ready_tx, ready_rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("accel-ctx-{}", worker.ctx_id()))
        .spawn(move || worker.run_child(ready_tx))
        .map_err(BridgeError::ThreadSpawn)?;
    ready_rx
        .recv()
        .map_err(|_| BridgeError::link("child pseudo-thread died during startup"))?;
    Ok(tid)
}

/// Handle to one context. Clones share the same underlying context.
#[derive(Clone)]
pub struct Context {
    shared: Arc<ContextShared>,
}

impl Context {
    pub(crate) fn from_shared(shared: Arc<ContextShared>) -> Self {
        Context { shared }
    }

    pub(crate) fn attach_process(&self, proc: Weak<ProcessInner>) {
        *self.shared.proc.lock().expect("proc backref lock") = proc;
    }

    /// Submission path for privileged process-control commands.
    pub(crate) fn submit_control(&self, handler: Handler) -> Result<u64, BridgeError> {
        self.submit(handler)
    }

    /// Current state of the context.
    #[must_use]
    pub fn state(&self) -> ContextState {
        self.shared.state()
    }

    fn submit(&self, handler: Handler) -> Result<u64, BridgeError> {
        if self.shared.state() == ContextState::Exit {
            return Err(BridgeError::ContextExited);
        }
        let id = self.shared.issue_request_id();
        self.shared
            .pending
            .lock()
            .expect("pending lock")
            .insert(id);
        if self.shared.comq.push_request(Command::new(id, handler)).is_err() {
            self.shared
                .pending
                .lock()
                .expect("pending lock")
                .remove(&id);
            return Err(BridgeError::ContextExited);
        }
        Ok(id)
    }

    /// Queue a call to the device function at `addr`.
    pub fn call_async(&self, addr: DeviceAddr, args: CallArgs) -> Result<u64, BridgeError> {
        if addr.is_null() {
            return Err(BridgeError::NullFunction);
        }
        // Surface marshalling errors at submission time, not on the worker.
        args.num_args()?;
        self.submit(Box::new(move |worker, cmd| {
            trace!("[request {}] start", cmd.id());
            if let Err(e) = worker.do_call(addr, &args) {
                error!("[request {}] call setup failed: {e}", cmd.id());
                cmd.set_result(0, CommandStatus::Error);
                return HandlerOutcome::Fatal;
            }
            let outcome = worker.finish_call(cmd, &args);
            trace!("[request {}] done", cmd.id());
            outcome
        }))
    }

    /// Queue a call to `name` in the library `libhdl`, resolving through
    /// the process symbol cache.
    pub fn call_async_by_name(
        &self,
        libhdl: u64,
        name: &str,
        args: CallArgs,
    ) -> Result<u64, BridgeError> {
        let proc = self
            .shared
            .proc
            .lock()
            .expect("proc backref lock")
            .upgrade()
            .ok_or(BridgeError::ContextExited)?;
        let addr = proc.get_symbol(libhdl, name)?;
        self.call_async(addr, args)
    }

    /// Queue a host function at this context's FIFO position.
    pub fn call_host_async<F>(&self, func: F) -> Result<u64, BridgeError>
    where
        F: FnOnce() -> u64 + Send + 'static,
    {
        self.submit(Box::new(move |_worker, cmd| {
            cmd.set_result(func(), CommandStatus::Ok);
            HandlerOutcome::Continue
        }))
    }

    /// Queue a read of `len` bytes of device memory into `dst`.
    pub fn async_read_mem(
        &self,
        dst: StackBuffer,
        src: DeviceAddr,
        len: usize,
    ) -> Result<u64, BridgeError> {
        if len > dst.len() {
            return Err(BridgeError::TransferTooLarge {
                len,
                cap: dst.len(),
            });
        }
        self.submit(Box::new(move |worker, cmd| {
            let mut guard = dst.lock();
            match worker.link.read_mem(&mut guard[..len], src) {
                Ok(()) => cmd.set_result(0, CommandStatus::Ok),
                Err(e) => {
                    warn!("async read of {len} bytes failed: {e}");
                    cmd.set_result(0, CommandStatus::Error);
                }
            }
            HandlerOutcome::Continue
        }))
    }

    /// Queue a write of `src` into device memory at `dst`.
    pub fn async_write_mem(&self, dst: DeviceAddr, src: Vec<u8>) -> Result<u64, BridgeError> {
        self.submit(Box::new(move |worker, cmd| {
            match worker.link.write_mem(dst, &src) {
                Ok(()) => cmd.set_result(0, CommandStatus::Ok),
                Err(e) => {
                    warn!("async write of {} bytes failed: {e}", src.len());
                    cmd.set_result(0, CommandStatus::Error);
                }
            }
            HandlerOutcome::Continue
        }))
    }

    /// Non-blocking result check. Returns `(Unfinished, 0)` while the
    /// command is still in flight; collecting a finished result removes
    /// the request ID from the outstanding set.
    pub fn peek_result(&self, reqid: u64) -> Result<(CommandStatus, u64), BridgeError> {
        let mut pending = self.shared.pending.lock().expect("pending lock");
        if !pending.contains(&reqid) {
            return Err(BridgeError::UnknownRequest(reqid));
        }
        match self.shared.comq.peek_completion(reqid) {
            Some(cmd) => {
                pending.remove(&reqid);
                Ok((cmd.status(), cmd.retval()))
            }
            None => Ok((CommandStatus::Unfinished, 0)),
        }
    }

    /// Block until the command completes and return its result.
    pub fn wait_result(&self, reqid: u64) -> Result<(CommandStatus, u64), BridgeError> {
        {
            let mut pending = self.shared.pending.lock().expect("pending lock");
            if !pending.remove(&reqid) {
                return Err(BridgeError::UnknownRequest(reqid));
            }
        }
        let cmd = self.shared.comq.wait_completion(reqid);
        Ok((cmd.status(), cmd.retval()))
    }

    /// Close the context: tear down the device thread and end the
    /// pseudo-thread. Idempotent; closing an exited context returns Ok.
    pub fn close(&self) -> Result<(), BridgeError> {
        if self.shared.state() == ContextState::Exit {
            return Ok(());
        }
        let id = self.shared.issue_request_id();
        let handler: Handler = Box::new(|worker, cmd| {
            worker.shutdown();
            cmd.set_result(0, CommandStatus::Ok);
            HandlerOutcome::Shutdown
        });
        if self.shared.comq.push_request(Command::new(id, handler)).is_err() {
            // Already torn down by an earlier close or a fatal error.
            return Ok(());
        }
        let _ = self.shared.comq.wait_completion(id);
        Ok(())
    }
}
