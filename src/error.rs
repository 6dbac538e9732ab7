// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Error and status types shared across the bridge runtime.
// Author: Lukas Bower

//! Errors and completion statuses.

use crate::addr::DeviceAddr;

/// Completion status of a submitted command.
///
/// Discriminants are part of the embedding ABI and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CommandStatus {
    /// The device function (or host handler) completed normally.
    Ok = 0,
    /// The device raised a hardware exception; the retval carries the raw
    /// exception word.
    Exception = 1,
    /// The handler failed on the host side.
    Error = 2,
    /// The command has not completed yet (peek only).
    Unfinished = 3,
}

/// Observable state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextState {
    /// Constructed but the device thread is not running yet.
    Unknown = 0,
    /// The device is executing user code.
    Running = 1,
    /// The device is stopped inside a forwarded system call.
    Syscall = 2,
    /// The device is parked at the block hypercall; the worker is serving
    /// the request queue.
    Blocked = 3,
    /// Terminal. The context never leaves this state.
    Exit = 4,
}

/// Errors surfaced by the bridge API.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// An argument index was outside the supported range.
    #[error("argument index {0} out of range")]
    ArgIndexOutOfRange(usize),
    /// An argument slot below the highest set index was never filled.
    #[error("argument {0} was never set")]
    ArgumentGap(usize),
    /// The accumulated stack locals exceed the configured cap.
    #[error("stack locals exceed limit: {size} > {limit}")]
    LocalsOverflow {
        /// Bytes the locals region would need.
        size: usize,
        /// Configured cap in bytes.
        limit: usize,
    },
    /// A library or symbol name is longer than the wire format allows.
    #[error("name longer than {} bytes", crate::SYMBOL_NAME_MAX)]
    NameTooLong,
    /// A device function address was null at submission time.
    #[error("null device function address")]
    NullFunction,
    /// The context has exited (or its request queue is closed).
    #[error("context has exited")]
    ContextExited,
    /// The request ID was never issued on this context, or its result was
    /// already collected.
    #[error("unknown request id {0}")]
    UnknownRequest(u64),
    /// The helper table embedded in the device binary does not match this
    /// runtime.
    #[error("helper ABI version mismatch: device {device:#x}, host {host:#x}")]
    HelperVersionMismatch {
        /// Version read from the device.
        device: u64,
        /// Version compiled into this crate.
        host: u64,
    },
    /// A privileged control call completed with a non-OK status.
    #[error("control call failed with status {status:?} (retval {retval:#x})")]
    ControlCallFailed {
        /// Completion status of the control command.
        status: CommandStatus,
        /// Raw retval of the control command.
        retval: u64,
    },
    /// The device could not load the requested library.
    #[error("device failed to load library {0:?}")]
    LibraryLoadFailed(String),
    /// The device could not resolve a symbol.
    #[error("symbol {name:?} not found in library {libhdl:#x}")]
    SymbolNotFound {
        /// Library handle searched.
        libhdl: u64,
        /// Symbol name looked up.
        name: String,
    },
    /// The device allocator returned null.
    #[error("device allocation of {0} bytes failed")]
    AllocFailed(usize),
    /// A transfer touched memory outside the device address space.
    #[error("device memory access out of bounds at {0}")]
    BadDeviceAccess(DeviceAddr),
    /// An async transfer is larger than the host buffer backing it.
    #[error("transfer of {len} bytes exceeds {cap}-byte buffer")]
    TransferTooLarge {
        /// Requested transfer length.
        len: usize,
        /// Host buffer capacity.
        cap: usize,
    },
    /// The device link failed.
    #[error("device link: {0}")]
    Link(String),
    /// Waiting for a device exception failed.
    #[error("exception wait failed")]
    ExceptionWait(#[source] std::io::Error),
    /// No device connector is registered for `ProcessHandle::create`.
    #[error("no device connector registered")]
    NoConnector,
    /// Device process bootstrap failed.
    #[error("bootstrap: {0}")]
    Bootstrap(String),
    /// Spawning a host pseudo-thread failed.
    #[error("pseudo-thread spawn failed")]
    ThreadSpawn(#[source] std::io::Error),
}

impl BridgeError {
    /// Shorthand used by link implementations.
    pub fn link(msg: impl Into<String>) -> Self {
        BridgeError::Link(msg.into())
    }
}
