//! System Call Interface
//!
//! Table-driven system call dispatch for user-mode applications.
//!
//! # Security Model
//! - Whitelist approach: only numbers present in the table are allowed
//! - All arguments are validated before the handler runs
//! - Invalid inputs return errors, never panic
//!
//! # Validation Order
//! 1. Unknown number: `ENOSYS`
//! 2. Caller below the descriptor's privilege: `EPERM`
//! 3. Wrong argument shape: `EINVAL`
//! 4. Bad user pointer: `EFAULT`
//!
//! # Built-in Syscalls
//! - 0: exit(status) - terminate the current thread
//! - 1: write(fd, buf, len) - write to a file descriptor
//! - 2: read(fd, buf, len) - read from a file descriptor, waiting if needed
//! - 3: yield() - give up the CPU
//! - 4: getpid() - current process id

use core::cell::Cell;

use crate::dispatch::{FileTable, NextContext, ProcessControl, ScheduleReason, Scheduler};
use crate::error::ErrorCode;
use crate::frame::TrapFrame;

mod handler;
mod table;
mod validate;

pub use handler::{builtin_table, dispatch_syscall, numbers};
pub use table::{
    ArgKind, SyscallDescriptor, SyscallFn, SyscallTable, TableError, MAX_ARG_REGISTERS,
    MAX_SYSCALLS,
};
pub use validate::{check_shape, validate_args, Arg, Direction, SyscallArgs, UserBuffer};

/// Services available to a system call, built once per trap.
pub struct SyscallEnv<'a> {
    /// Process bookkeeping
    pub process: &'a dyn ProcessControl,
    /// Descriptor I/O
    pub files: &'a dyn FileTable,
    scheduler: &'a dyn Scheduler,
    deferred: Cell<Option<ScheduleReason>>,
    switch: Cell<Option<TrapFrame>>,
    interruptible: Cell<bool>,
}

impl<'a> SyscallEnv<'a> {
    /// Environment over the kernel's services.
    pub fn new(
        process: &'a dyn ProcessControl,
        files: &'a dyn FileTable,
        scheduler: &'a dyn Scheduler,
    ) -> Self {
        Self {
            process,
            files,
            scheduler,
            deferred: Cell::new(None),
            switch: Cell::new(None),
            interruptible: Cell::new(false),
        }
    }

    /// Ask for a reschedule once the result has been written back.
    ///
    /// A termination request is never downgraded by a later one.
    pub fn defer(&self, reason: ScheduleReason) {
        if self.deferred.get() != Some(ScheduleReason::Terminated) {
            self.deferred.set(Some(reason));
        }
    }

    /// Take the pending reschedule request.
    pub fn take_deferred(&self) -> Option<ScheduleReason> {
        self.deferred.take()
    }

    /// Context the scheduler chose while the call was blocked.
    pub fn take_switch(&self) -> Option<TrapFrame> {
        self.switch.take()
    }

    /// Wait for the current thread to be woken up.
    ///
    /// This is the yield point of blocking calls: an interruptible call with
    /// a pending signal gets `EINTR` instead of waiting. A switch chosen by
    /// the scheduler is kept until the result has been written back; the
    /// latest one wins.
    pub fn block(&self, frame: &TrapFrame) -> Result<(), ErrorCode> {
        if self.interruptible.get() && self.process.signal_pending() {
            return Err(ErrorCode::Eintr);
        }
        if let NextContext::Switch(next) =
            self.scheduler.tick_or_yield(frame, ScheduleReason::Blocked)
        {
            self.switch.set(Some(next));
        }
        Ok(())
    }

    pub(crate) fn set_interruptible(&self, interruptible: bool) {
        self.interruptible.set(interruptible);
    }
}
