// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Blocking command FIFO with find/wait-by-ID, and the paired request/completion queues of a context.
// Author: Lukas Bower

//! Command queues.
//!
//! [`BlockingQueue`] is a mutex-and-condvar FIFO of [`Command`]s with
//! dequeue, find-by-ID, and wait-for-ID operations. [`CommQueue`] pairs a
//! request queue (host submits, worker consumes) with a completion queue
//! (worker produces, waiters consume). The request side carries a one-way
//! closed flag; once set, pushes are refused and blocked poppers drain the
//! backlog and then observe the close.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use log::trace;

use crate::command::Command;

struct QueueInner {
    items: VecDeque<Command>,
    closed: bool,
}

pub(crate) struct BlockingQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

impl BlockingQueue {
    pub(crate) fn new() -> Self {
        BlockingQueue {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Append and wake all waiters. Returns the command when the queue is
    /// closed so the caller keeps ownership.
    pub(crate) fn push(&self, cmd: Command) -> Result<(), Command> {
        let mut inner = self.inner.lock().expect("queue lock");
        if inner.closed {
            return Err(cmd);
        }
        inner.items.push_back(cmd);
        self.cond.notify_all();
        Ok(())
    }

    /// Block until the queue is non-empty, then return the front. `None`
    /// once the queue is closed and drained.
    pub(crate) fn pop(&self) -> Option<Command> {
        let mut inner = self.inner.lock().expect("queue lock");
        loop {
            if let Some(cmd) = inner.items.pop_front() {
                return Some(cmd);
            }
            if inner.closed {
                return None;
            }
            inner = self.cond.wait(inner).expect("queue lock");
        }
    }

    /// Remove and return the first entry with `id`, if present.
    pub(crate) fn try_find(&self, id: u64) -> Option<Command> {
        let mut inner = self.inner.lock().expect("queue lock");
        take_by_id(&mut inner.items, id)
    }

    /// Block until an entry with `id` appears, then remove and return it.
    /// Tolerates spurious wakeups.
    pub(crate) fn wait(&self, id: u64) -> Command {
        let mut inner = self.inner.lock().expect("queue lock");
        loop {
            if let Some(cmd) = take_by_id(&mut inner.items, id) {
                return cmd;
            }
            inner = self.cond.wait(inner).expect("queue lock");
        }
    }

    /// Set the one-way closed flag and wake all waiters.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock().expect("queue lock");
        inner.closed = true;
        self.cond.notify_all();
    }
}

fn take_by_id(items: &mut VecDeque<Command>, id: u64) -> Option<Command> {
    let at = items.iter().position(|c| c.id() == id)?;
    items.remove(at)
}

/// Request/completion queue pair for one context.
pub(crate) struct CommQueue {
    request: BlockingQueue,
    completion: BlockingQueue,
}

impl CommQueue {
    pub(crate) fn new() -> Self {
        CommQueue {
            request: BlockingQueue::new(),
            completion: BlockingQueue::new(),
        }
    }

    pub(crate) fn push_request(&self, cmd: Command) -> Result<(), Command> {
        self.request.push(cmd)
    }

    pub(crate) fn pop_request(&self) -> Option<Command> {
        self.request.pop()
    }

    /// Completions are always accepted; the completion side never closes,
    /// so every outstanding request can be answered even during teardown.
    pub(crate) fn push_completion(&self, cmd: Command) {
        trace!("completion for request {}", cmd.id());
        if self.completion.push(cmd).is_err() {
            unreachable!("completion queue never closes");
        }
    }

    pub(crate) fn peek_completion(&self, id: u64) -> Option<Command> {
        self.completion.try_find(id)
    }

    pub(crate) fn wait_completion(&self, id: u64) -> Command {
        self.completion.wait(id)
    }

    pub(crate) fn close_request_side(&self) {
        self.request.close();
    }
}
