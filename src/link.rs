// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Device link seam: traits over the device driver/OS glue, wire constants, and the helper function table record.
// Author: Lukas Bower

//! The device link.
//!
//! Everything the runtime needs from the device kernel driver and the
//! device OS goes through two narrow traits: [`DeviceLink`] for per-thread
//! interaction (exception waits, registers, memory, syscall forwarding) and
//! [`DeviceBoot`] for per-process bring-up. Real driver glue lives in the
//! embedding; the in-crate [`crate::sim`] module supplies a deterministic
//! implementation for tests.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use std::sync::RwLock;

use crate::addr::DeviceAddr;
use crate::error::BridgeError;

/// Number of argument slots passed in device registers.
pub const NUM_ARGS_ON_REGISTER: usize = 8;

/// Byte offset of the parameter area inside a device stack frame.
pub const PARAM_AREA_OFFSET: usize = 176;

/// Helper ABI version this runtime was built against.
pub const HELPER_ABI_VERSION: u64 = 0x3;

/// Environment variable overriding the helper binary path.
pub const HELPER_PATH_ENV: &str = "ACCEL_BRIDGE_HELPER";

/// Compiled-in default helper binary path.
pub const DEFAULT_HELPER_PATH: &str = "/usr/libexec/accel-bridge/abrun";

/// Resolve the helper binary path, honouring [`HELPER_PATH_ENV`].
#[must_use]
pub fn helper_path() -> PathBuf {
    std::env::var_os(HELPER_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_HELPER_PATH))
}

/// Derived paths for one device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNode(
    /// Device node index.
    pub u32,
);

impl DeviceNode {
    /// Device driver file for this node.
    #[must_use]
    pub fn device_path(self) -> PathBuf {
        PathBuf::from(format!("/dev/accel{}", self.0))
    }

    /// Device OS control socket for this node.
    #[must_use]
    pub fn os_socket_path(self) -> PathBuf {
        PathBuf::from(format!("/var/run/accel/os.sock.{}", self.0))
    }
}

/// Exception word bits reported by the device.
pub mod exs {
    /// Bits below this mask never indicate an exception; a word with no
    /// bits above it is a spurious wakeup.
    pub const EXCEPTION_MASK: u64 = !0xff;
    /// Monitor call: the device issued a system call.
    pub const MONC: u64 = 1 << 8;
    /// Memory access trap.
    pub const MONT: u64 = 1 << 9;
    /// Uncorrectable hardware error.
    pub const UNCORRECTABLE: u64 = 1 << 10;
    /// Correctable hardware error.
    pub const CORRECTABLE: u64 = 1 << 11;
    /// Debug-raise bit; correctable errors alongside it are expected.
    pub const RDBG: u64 = 1 << 12;
}

/// Device OS system call numbers used by the runtime.
///
/// The device OS mirrors the Linux numbering for the calls it forwards, so
/// only the numbers the filters care about are spelled out here.
pub mod sysnum {
    /// rt_sigaction
    pub const RT_SIGACTION: i64 = 13;
    /// rt_sigreturn
    pub const RT_SIGRETURN: i64 = 15;
    /// clone
    pub const CLONE: i64 = 56;
    /// fork
    pub const FORK: i64 = 57;
    /// vfork
    pub const VFORK: i64 = 58;
    /// execve
    pub const EXECVE: i64 = 59;
    /// exit
    pub const EXIT: i64 = 60;
    /// wait4
    pub const WAIT4: i64 = 61;
    /// rt_sigpending
    pub const RT_SIGPENDING: i64 = 127;
    /// rt_sigtimedwait
    pub const RT_SIGTIMEDWAIT: i64 = 128;
    /// rt_sigsuspend
    pub const RT_SIGSUSPEND: i64 = 130;
    /// sigaltstack
    pub const SIGALTSTACK: i64 = 131;
    /// exit_group
    pub const EXIT_GROUP: i64 = 231;
    /// signalfd
    pub const SIGNALFD: i64 = 282;
    /// signalfd4
    pub const SIGNALFD4: i64 = 289;
    /// Device hypercall multiplexer (the block hypercall rides on it).
    pub const HYPERCALL: i64 = 316;
}

/// First hypercall argument selecting the voluntary block request.
pub const HYPERCALL_BLOCK: u64 = 0x10;

/// Device registers the runtime pokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    /// Resume address for the next unblock.
    ProgramCounter,
    /// Device stack pointer.
    StackPointer,
    /// Argument register `0..NUM_ARGS_ON_REGISTER`.
    Arg(usize),
}

/// Per-thread interaction with the device driver and OS.
///
/// One link is entered only ever by the pseudo-thread owning its context;
/// implementations may rely on that for their own state.
pub trait DeviceLink: Send + Sync {
    /// Block until the device raises an exception; returns the raw
    /// exception word. May return spurious words with no exception bits.
    fn wait_exception(&self) -> io::Result<u64>;

    /// Number of the system call the device is stopped at.
    fn syscall_number(&self) -> Result<i64, BridgeError>;

    /// First `count` arguments of the system call the device is stopped at.
    fn syscall_args(&self, count: usize) -> Result<Vec<u64>, BridgeError>;

    /// Set a device user register.
    fn set_register(&self, reg: Reg, value: u64) -> Result<(), BridgeError>;

    /// Copy device memory into a host buffer.
    fn read_mem(&self, dst: &mut [u8], src: DeviceAddr) -> Result<(), BridgeError>;

    /// Copy a host buffer into device memory.
    fn write_mem(&self, dst: DeviceAddr, src: &[u8]) -> Result<(), BridgeError>;

    /// Run the stopped system call on the host and resume the device.
    fn forward_syscall(&self, sysnum: i64) -> Result<(), BridgeError>;

    /// Resume the device, delivering `retval` as the stopped call's result.
    fn unblock(&self, retval: u64) -> Result<(), BridgeError>;

    /// Refuse the stopped system call, resuming the device with `-errno`.
    fn reject_syscall(&self, sysnum: i64, errno: i32) -> Result<(), BridgeError>;

    /// Tell the device OS this thread entered the BLOCKED state.
    fn notify_blocked(&self) -> Result<(), BridgeError>;

    /// Service the pending clone request: create the device thread and a
    /// link for it. Returns the new device thread id.
    fn clone_thread(&self) -> Result<(i64, Arc<dyn DeviceLink>), BridgeError>;

    /// Instruction counter registers, for fatal-exception diagnostics.
    fn instruction_counters(&self) -> Result<(u64, u64), BridgeError>;

    /// Tear down the device thread behind this link. Idempotent.
    fn terminate_thread(&self);
}

/// Per-process bring-up and tear-down of the device driver state.
pub trait DeviceBoot: Send {
    /// Map the fixed-address page the driver needs for its private data.
    /// Obtaining any other address is fatal.
    fn map_driver_page(&mut self) -> Result<(), BridgeError>;

    /// Allocate, lock, and register the shared syscall-argument area.
    fn init_syscall_area(&mut self) -> Result<(), BridgeError>;

    /// Ask the device OS to create the device process and load the helper
    /// binary; returns the main thread's link.
    fn spawn_process(&mut self, helper: &Path) -> Result<Arc<dyn DeviceLink>, BridgeError>;

    /// Exit the device process and release the link. Idempotent.
    fn terminate_process(&mut self);

    /// Device node this boot object is attached to.
    fn device_number(&self) -> u32;
}

/// Factory producing a [`DeviceBoot`] for a device node.
pub type Connector = dyn Fn(u32) -> Result<Box<dyn DeviceBoot>, BridgeError> + Send + Sync;

static CONNECTOR: Lazy<RwLock<Option<Box<Connector>>>> = Lazy::new(|| RwLock::new(None));

/// Install the process-wide device connector used by
/// [`crate::ProcessHandle::create`]. The last installed connector wins.
pub fn register_connector(connector: Box<Connector>) {
    *CONNECTOR.write().expect("connector lock") = Some(connector);
}

pub(crate) fn connect(node: u32) -> Result<Box<dyn DeviceBoot>, BridgeError> {
    match CONNECTOR.read().expect("connector lock").as_ref() {
        Some(f) => f(node),
        None => Err(BridgeError::NoConnector),
    }
}

/// The helper function table embedded in the device helper binary.
///
/// Wire format: eight little-endian 64-bit words at a well-known symbol,
/// `{version, load_library, alloc_buff, free_buff, find_sym, create_thread,
/// call_func, exit}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperTable {
    /// ABI version; must equal [`HELPER_ABI_VERSION`].
    pub version: u64,
    /// Entry point loading a shared library into the device process.
    pub load_library: DeviceAddr,
    /// Entry point allocating a device buffer.
    pub alloc_buff: DeviceAddr,
    /// Entry point freeing a device buffer.
    pub free_buff: DeviceAddr,
    /// Entry point resolving a symbol to a device address.
    pub find_sym: DeviceAddr,
    /// Entry point creating a new device thread.
    pub create_thread: DeviceAddr,
    /// Entry point dispatching a function call (used device-side).
    pub call_func: DeviceAddr,
    /// Entry point exiting the helper.
    pub exit: DeviceAddr,
}

impl HelperTable {
    /// Size of the wire record in bytes.
    pub const WIRE_SIZE: usize = 64;

    /// Parse the wire record.
    pub fn from_wire(bytes: &[u8; Self::WIRE_SIZE]) -> Self {
        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            u64::from_le_bytes(w)
        };
        HelperTable {
            version: word(0),
            load_library: DeviceAddr::from_raw(word(1)),
            alloc_buff: DeviceAddr::from_raw(word(2)),
            free_buff: DeviceAddr::from_raw(word(3)),
            find_sym: DeviceAddr::from_raw(word(4)),
            create_thread: DeviceAddr::from_raw(word(5)),
            call_func: DeviceAddr::from_raw(word(6)),
            exit: DeviceAddr::from_raw(word(7)),
        }
    }

    /// Serialize to the wire record.
    #[must_use]
    pub fn to_wire(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        let words = [
            self.version,
            self.load_library.into_raw(),
            self.alloc_buff.into_raw(),
            self.free_buff.into_raw(),
            self.find_sym.into_raw(),
            self.create_thread.into_raw(),
            self.call_func.into_raw(),
            self.exit.into_raw(),
        ];
        for (i, w) in words.iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&w.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_table_wire_round_trip() {
        let table = HelperTable {
            version: HELPER_ABI_VERSION,
            load_library: DeviceAddr::from_raw(0xf000_0010),
            alloc_buff: DeviceAddr::from_raw(0xf000_0020),
            free_buff: DeviceAddr::from_raw(0xf000_0030),
            find_sym: DeviceAddr::from_raw(0xf000_0040),
            create_thread: DeviceAddr::from_raw(0xf000_0050),
            call_func: DeviceAddr::from_raw(0xf000_0060),
            exit: DeviceAddr::from_raw(0xf000_0070),
        };
        assert_eq!(HelperTable::from_wire(&table.to_wire()), table);
    }

    #[test]
    fn node_paths_follow_template() {
        let node = DeviceNode(2);
        assert_eq!(node.device_path(), PathBuf::from("/dev/accel2"));
        assert_eq!(
            node.os_socket_path(),
            PathBuf::from("/var/run/accel/os.sock.2")
        );
    }
}
