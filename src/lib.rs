// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Crate root for the accel-bridge host-side offload runtime.
// Author: Lukas Bower
#![warn(missing_docs)]

//! Host-side offload runtime for companion accelerator processors.
//!
//! A host program creates a [`ProcessHandle`] per device process, loads
//! shared libraries into it, and invokes device functions asynchronously
//! through [`Context`]s. Each context pairs one device thread with one
//! host pseudo-thread that drives the device's exception/syscall loop,
//! serves the context's command queue, and collects results. Argument
//! marshalling (registers, stack frames, and IN/OUT/INOUT stack buffers)
//! is handled by [`CallArgs`].
//!
//! The device driver and device OS sit behind the [`link::DeviceLink`] and
//! [`link::DeviceBoot`] traits; the [`sim`] module ships a deterministic
//! in-process implementation used by the test suite.

/// Device virtual address newtype.
pub mod addr;
/// Call argument marshalling.
pub mod args;
/// Commands: request IDs, handlers, results.
pub mod command;
/// Contexts and their pseudo-thread workers.
pub mod context;
/// Errors and statuses.
pub mod error;
/// The device link seam and wire constants.
pub mod link;
/// Device process handles and privileged control operations.
pub mod process;
/// Blocking command queues.
mod queue;
/// Signal-mask discipline around device waits.
mod signals;
/// Deterministic simulated device.
pub mod sim;

pub use addr::DeviceAddr;
pub use args::{CallArgs, Intent, StackBuffer, DEFAULT_MAX_LOCALS, MAX_ARGS};
pub use context::Context;
pub use error::{BridgeError, CommandStatus, ContextState};
pub use link::{HELPER_ABI_VERSION, HELPER_PATH_ENV, NUM_ARGS_ON_REGISTER};
pub use process::ProcessHandle;

/// Sentinel distinct from every request ID a context can issue.
pub const REQUEST_ID_INVALID: u64 = u64::MAX;

/// Longest library or symbol name accepted, excluding the nul terminator
/// appended on transfer.
pub const SYMBOL_NAME_MAX: usize = 255;

/// Version of this runtime.
#[must_use]
pub fn version_string() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
