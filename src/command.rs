// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: A submitted unit of work: request ID, one-shot handler, settable result.
// Author: Lukas Bower

//! Commands.
//!
//! A [`Command`] travels from the submitting thread to the context worker
//! through the request queue, is invoked exactly once, and comes back on
//! the completion queue carrying its result. Ownership is linear: exactly
//! one queue (or the worker) holds it at any moment.

use crate::context::ContextWorker;
use crate::error::CommandStatus;

/// What the worker does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerOutcome {
    /// Push the completion and keep serving the queue.
    Continue,
    /// Internal worker failure: push the completion, close the request
    /// side, transition the context to EXIT.
    Fatal,
    /// Terminal close command: the handler already tore the device thread
    /// down; the worker pushes the completion and leaves the loop.
    Shutdown,
}

pub(crate) type Handler =
    Box<dyn FnOnce(&mut ContextWorker, &mut Command) -> HandlerOutcome + Send>;

/// A submitted unit of work.
pub struct Command {
    id: u64,
    retval: u64,
    status: CommandStatus,
    handler: Option<Handler>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("retval", &self.retval)
            .field("status", &self.status)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl Command {
    pub(crate) fn new(id: u64, handler: Handler) -> Self {
        Command {
            id,
            retval: 0,
            status: CommandStatus::Unfinished,
            handler: Some(handler),
        }
    }

    /// A command with its result already set; queue tests use it as a
    /// bare payload.
    #[cfg(test)]
    pub(crate) fn finished(id: u64, retval: u64, status: CommandStatus) -> Self {
        Command {
            id,
            retval,
            status,
            handler: None,
        }
    }

    /// Request ID this command answers to.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Store the result observed through peek/wait.
    pub fn set_result(&mut self, retval: u64, status: CommandStatus) {
        self.retval = retval;
        self.status = status;
    }

    /// Stored return value.
    #[must_use]
    pub fn retval(&self) -> u64 {
        self.retval
    }

    /// Stored status.
    #[must_use]
    pub fn status(&self) -> CommandStatus {
        self.status
    }

    /// Run the handler. Invoked exactly once by the owning worker; a
    /// second invocation is a no-op.
    pub(crate) fn invoke(&mut self, worker: &mut ContextWorker) -> HandlerOutcome {
        match self.handler.take() {
            Some(handler) => handler(worker, self),
            None => HandlerOutcome::Continue,
        }
    }
}
