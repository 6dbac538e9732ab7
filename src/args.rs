// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: ABI-accurate marshalling of call arguments into the device register image and stack frame, with inout copy-back.
// Author: Lukas Bower

//! Call arguments.
//!
//! A [`CallArgs`] collects typed scalar slots and stack-buffer slots, then
//! turns them into the device register image and (when needed) a stack
//! frame image at submission time. Stack buffers are shared handles: the
//! caller keeps a clone of the [`StackBuffer`] and observes OUT/INOUT
//! copy-back through it after the call completes.
//!
//! Frame layout, low to high: a fixed header of [`PARAM_AREA_OFFSET`]
//! bytes, one 64-bit parameter word per argument, then the locals region
//! ending exactly at the stack pointer the frame was built from. Each
//! buffer begins on an 8-byte boundary inside locals and its slot records
//! the byte offset from the start of the region.

use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use crate::addr::DeviceAddr;
use crate::error::BridgeError;
use crate::link::{NUM_ARGS_ON_REGISTER, PARAM_AREA_OFFSET};

/// Maximum number of argument slots.
pub const MAX_ARGS: usize = 256;

/// Default cap on the locals region. The device's initial stack page is
/// 64 MiB; staying 1 MiB below it leaves headroom for the callee.
pub const DEFAULT_MAX_LOCALS: usize = 63 * 1024 * 1024;

/// Transfer direction of a stack buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Copy host to device before the call.
    In,
    /// Copy device to host after the call; no pre-copy.
    Out,
    /// Copy in before and back out after.
    InOut,
}

impl Intent {
    fn copies_in(self) -> bool {
        matches!(self, Intent::In | Intent::InOut)
    }

    fn copies_out(self) -> bool {
        matches!(self, Intent::Out | Intent::InOut)
    }
}

/// A host buffer destined for the device stack.
///
/// Cloning shares the underlying bytes; the length is fixed at creation.
#[derive(Debug, Clone)]
pub struct StackBuffer {
    len: usize,
    data: Arc<Mutex<Vec<u8>>>,
}

impl StackBuffer {
    /// Buffer initialized from a byte slice.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        StackBuffer {
            len: bytes.len(),
            data: Arc::new(Mutex::new(bytes.to_vec())),
        }
    }

    /// Zero-filled buffer of `len` bytes.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        StackBuffer {
            len,
            data: Arc::new(Mutex::new(vec![0; len])),
        }
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length buffer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Snapshot of the current contents.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().expect("stack buffer lock")
    }
}

#[derive(Debug, Clone)]
enum ArgSlot {
    Value(u64),
    Stack {
        intent: Intent,
        offset: usize,
        buf: StackBuffer,
    },
}

/// Marshalled form of one submission, consumed by the context worker.
pub(crate) struct Marshalled {
    /// Values for the first `min(nargs, 8)` argument registers.
    pub reg_vals: Vec<u64>,
    /// Stack frame to install, when one is needed.
    pub frame: Option<Frame>,
}

/// A stack frame image and the address it must be written to.
pub(crate) struct Frame {
    pub addr: DeviceAddr,
    pub image: Vec<u8>,
}

/// Ordered, typed arguments for one device call.
#[derive(Debug, Default)]
pub struct CallArgs {
    slots: Vec<Option<ArgSlot>>,
    locals_len: usize,
    locals_limit: usize,
}

impl CallArgs {
    /// Empty argument list.
    #[must_use]
    pub fn new() -> Self {
        CallArgs {
            slots: Vec::new(),
            locals_len: 0,
            locals_limit: DEFAULT_MAX_LOCALS,
        }
    }

    /// Override the locals cap for this argument list.
    #[must_use]
    pub fn with_locals_limit(mut self, bytes: usize) -> Self {
        self.locals_limit = bytes;
        self
    }

    /// Drop all slots and locals.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.locals_len = 0;
    }

    fn put(&mut self, argnum: usize, slot: ArgSlot) -> Result<(), BridgeError> {
        if argnum >= MAX_ARGS {
            return Err(BridgeError::ArgIndexOutOfRange(argnum));
        }
        if argnum >= self.slots.len() {
            self.slots.resize(argnum + 1, None);
        }
        // Replacing a stack slot leaves its old bytes as dead padding in
        // the locals region; the region only ever grows.
        self.slots[argnum] = Some(slot);
        Ok(())
    }

    /// Set a signed 64-bit argument.
    pub fn set_i64(&mut self, argnum: usize, value: i64) -> Result<(), BridgeError> {
        self.put(argnum, ArgSlot::Value(value as u64))
    }

    /// Set an unsigned 64-bit argument.
    pub fn set_u64(&mut self, argnum: usize, value: u64) -> Result<(), BridgeError> {
        self.put(argnum, ArgSlot::Value(value))
    }

    /// Set a signed 32-bit argument (sign-extended).
    pub fn set_i32(&mut self, argnum: usize, value: i32) -> Result<(), BridgeError> {
        self.put(argnum, ArgSlot::Value(value as i64 as u64))
    }

    /// Set an unsigned 32-bit argument (zero-extended).
    pub fn set_u32(&mut self, argnum: usize, value: u32) -> Result<(), BridgeError> {
        self.put(argnum, ArgSlot::Value(u64::from(value)))
    }

    /// Set a signed 16-bit argument (sign-extended).
    pub fn set_i16(&mut self, argnum: usize, value: i16) -> Result<(), BridgeError> {
        self.put(argnum, ArgSlot::Value(value as i64 as u64))
    }

    /// Set an unsigned 16-bit argument (zero-extended).
    pub fn set_u16(&mut self, argnum: usize, value: u16) -> Result<(), BridgeError> {
        self.put(argnum, ArgSlot::Value(u64::from(value)))
    }

    /// Set a signed 8-bit argument (sign-extended).
    pub fn set_i8(&mut self, argnum: usize, value: i8) -> Result<(), BridgeError> {
        self.put(argnum, ArgSlot::Value(value as i64 as u64))
    }

    /// Set an unsigned 8-bit argument (zero-extended).
    pub fn set_u8(&mut self, argnum: usize, value: u8) -> Result<(), BridgeError> {
        self.put(argnum, ArgSlot::Value(u64::from(value)))
    }

    /// Set a single-precision argument. The device ABI carries floats in
    /// the high half of the 64-bit slot, low half zeroed.
    pub fn set_float(&mut self, argnum: usize, value: f32) -> Result<(), BridgeError> {
        self.put(argnum, ArgSlot::Value(u64::from(value.to_bits()) << 32))
    }

    /// Set a double-precision argument.
    pub fn set_double(&mut self, argnum: usize, value: f64) -> Result<(), BridgeError> {
        self.put(argnum, ArgSlot::Value(value.to_bits()))
    }

    /// Pass `buf` on the device stack and point argument `argnum` at it.
    ///
    /// The buffer is appended to the locals region at the next 8-byte
    /// boundary. Fails fast when the region would exceed the cap; the
    /// call is never submitted in that case.
    pub fn set_stack(
        &mut self,
        intent: Intent,
        argnum: usize,
        buf: StackBuffer,
    ) -> Result<(), BridgeError> {
        let offset = round_up8(self.locals_len);
        let end = offset + buf.len();
        if end > self.locals_limit {
            return Err(BridgeError::LocalsOverflow {
                size: end,
                limit: self.locals_limit,
            });
        }
        self.put(argnum, ArgSlot::Stack { intent, offset, buf })?;
        self.locals_len = end;
        Ok(())
    }

    /// Number of argument slots, verifying there are no holes.
    pub fn num_args(&self) -> Result<usize, BridgeError> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_none() {
                return Err(BridgeError::ArgumentGap(i));
            }
        }
        Ok(self.slots.len())
    }

    /// Total bytes the locals region reserves below the stack pointer.
    #[must_use]
    pub fn locals_size(&self) -> usize {
        round_up8(self.locals_len)
    }

    /// The 64-bit value argument `argnum` contributes, given the device
    /// stack pointer the frame will be built from. Stack slots resolve to
    /// the device address their buffer will occupy once the locals region
    /// is reserved.
    pub fn get(&self, sp: DeviceAddr, argnum: usize) -> Result<u64, BridgeError> {
        match self.slots.get(argnum) {
            Some(Some(ArgSlot::Value(v))) => Ok(*v),
            Some(Some(ArgSlot::Stack { offset, .. })) => {
                Ok(self.locals_base(sp).add(*offset as u64).into_raw())
            }
            Some(None) => Err(BridgeError::ArgumentGap(argnum)),
            None => Err(BridgeError::ArgIndexOutOfRange(argnum)),
        }
    }

    fn locals_base(&self, sp: DeviceAddr) -> DeviceAddr {
        sp.sub(self.locals_size() as u64)
    }

    pub(crate) fn marshal(&self, sp: DeviceAddr) -> Result<Marshalled, BridgeError> {
        let nargs = self.num_args()?;
        let mut reg_vals = Vec::with_capacity(nargs.min(NUM_ARGS_ON_REGISTER));
        for i in 0..nargs.min(NUM_ARGS_ON_REGISTER) {
            reg_vals.push(self.get(sp, i)?);
        }
        let locals = self.locals_size();
        if nargs <= NUM_ARGS_ON_REGISTER && locals == 0 {
            return Ok(Marshalled {
                reg_vals,
                frame: None,
            });
        }
        // Frame: header, one parameter word per argument, locals at the
        // tail so the region ends exactly at the incoming sp.
        let frame_size = round_up16(PARAM_AREA_OFFSET + 8 * nargs + locals);
        let frame_addr = sp.sub(frame_size as u64);
        let mut image = vec![0u8; frame_size];
        for i in 0..nargs {
            let word = self.get(sp, i)?.to_le_bytes();
            let at = PARAM_AREA_OFFSET + 8 * i;
            image[at..at + 8].copy_from_slice(&word);
        }
        let locals_at = frame_size - locals;
        for slot in self.slots.iter().flatten() {
            if let ArgSlot::Stack { intent, offset, buf } = slot {
                if intent.copies_in() && !buf.is_empty() {
                    let at = locals_at + offset;
                    image[at..at + buf.len()].copy_from_slice(&buf.lock());
                }
            }
        }
        debug!(
            "marshalled {} args, frame {} bytes at {} (locals {})",
            nargs, frame_size, frame_addr, locals
        );
        Ok(Marshalled {
            reg_vals,
            frame: Some(Frame {
                addr: frame_addr,
                image,
            }),
        })
    }

    /// Re-read every OUT/INOUT slot from device memory into its host
    /// buffer. `sp` is the stack pointer captured at the completing block.
    pub(crate) fn copy_back<F>(&self, sp: DeviceAddr, mut read: F) -> Result<(), BridgeError>
    where
        F: FnMut(&mut [u8], DeviceAddr) -> Result<(), BridgeError>,
    {
        let base = self.locals_base(sp);
        for slot in self.slots.iter().flatten() {
            if let ArgSlot::Stack { intent, offset, buf } = slot {
                if intent.copies_out() && !buf.is_empty() {
                    let mut guard = buf.lock();
                    read(&mut guard, base.add(*offset as u64))?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn has_copy_back(&self) -> bool {
        self.slots.iter().flatten().any(|slot| {
            matches!(slot, ArgSlot::Stack { intent, .. } if intent.copies_out())
        })
    }
}

fn round_up8(n: usize) -> usize {
    (n + 7) & !7
}

fn round_up16(n: usize) -> usize {
    (n + 15) & !15
}
