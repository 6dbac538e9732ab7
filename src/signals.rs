// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Signal-mask discipline for pseudo-threads around device waits.
// Author: Lukas Bower

//! Signal-mask discipline.
//!
//! The invariant: a pseudo-thread runs with all signals blocked, except
//! while it is suspended inside the device exception wait (or the request
//! queue pop), where the thread's saved mask is restored so signals can
//! interrupt the wait. [`SignalWindow`] is the one place that opens and
//! closes that window.

use std::cell::Cell;
use std::mem::MaybeUninit;

thread_local! {
    static SAVED_MASK: Cell<Option<libc::sigset_t>> = const { Cell::new(None) };
}

fn empty_set() -> libc::sigset_t {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        set.assume_init()
    }
}

fn full_set() -> libc::sigset_t {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigfillset(set.as_mut_ptr());
        set.assume_init()
    }
}

/// Capture the calling thread's current mask as its saved mask.
///
/// Called once on the thread that creates a device process, before any
/// exception loop runs on it.
pub(crate) fn capture_saved_mask() {
    let mut cur = empty_set();
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, std::ptr::null(), &mut cur);
    }
    SAVED_MASK.with(|m| m.set(Some(cur)));
}

/// Adopt the child pseudo-thread mask: everything blocked except SIGCONT.
///
/// NPTL ignores attempts to block the signals it uses internally, so
/// filling the set is safe and thread cancellation keeps working.
pub(crate) fn adopt_child_mask() {
    let mut set = full_set();
    unsafe {
        libc::sigdelset(&mut set, libc::SIGCONT);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
    SAVED_MASK.with(|m| m.set(Some(set)));
}

fn restore_saved() {
    let saved = SAVED_MASK.with(Cell::get).unwrap_or_else(empty_set);
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, &saved, std::ptr::null_mut());
    }
}

fn block_all() {
    let set = full_set();
    unsafe {
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

/// Scoped window during which the thread's saved signal mask is in effect.
///
/// Construct immediately before a suspension point; drop re-blocks all
/// signals so host work runs signal-quiet.
pub(crate) struct SignalWindow(());

impl SignalWindow {
    pub(crate) fn open() -> Self {
        restore_saved();
        SignalWindow(())
    }
}

impl Drop for SignalWindow {
    fn drop(&mut self) {
        block_all();
    }
}
