//! System Call Table
//!
//! Fixed array of descriptors indexed by syscall number. Built once at init
//! and only read afterwards, so dispatch needs no lock.

use core::fmt;

use super::validate::{Direction, SyscallArgs};
use super::SyscallEnv;
use crate::error::ErrorCode;
use crate::frame::TrapFrame;
use crate::privilege::PrivilegeLevel;

/// Number of slots in the table.
pub const MAX_SYSCALLS: usize = 64;

/// Argument registers available on every supported ABI.
pub const MAX_ARG_REGISTERS: usize = 6;

/// System call implementation.
///
/// Runs only after every argument validated; the returned value is encoded
/// into the return register by the dispatch core.
pub type SyscallFn =
    fn(env: &SyscallEnv<'_>, frame: &mut TrapFrame, args: &SyscallArgs) -> Result<usize, ErrorCode>;

/// Declared shape of one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Plain integer, passed through unchecked
    Int,
    /// Pointer to a fixed-size object the kernel reads
    UserIn(usize),
    /// Pointer to a fixed-size object the kernel writes
    UserOut(usize),
    /// Pointer plus length, taking two consecutive registers
    UserBuffer(Direction),
}

impl ArgKind {
    /// Registers the argument occupies.
    #[inline]
    pub const fn registers(self) -> usize {
        match self {
            ArgKind::UserBuffer(_) => 2,
            _ => 1,
        }
    }

    /// Whether the argument carries a user pointer.
    #[inline]
    pub const fn is_pointer(self) -> bool {
        !matches!(self, ArgKind::Int)
    }
}

/// Immutable description of one system call.
#[derive(Clone, Copy)]
pub struct SyscallDescriptor {
    /// Syscall number
    pub number: usize,
    /// Name for logs
    pub name: &'static str,
    /// Declared arguments, in order
    pub args: &'static [ArgKind],
    /// Leading arguments that are required; pointers among them may not be null
    pub min_args: usize,
    /// Lowest privilege allowed to make the call
    pub min_privilege: PrivilegeLevel,
    /// Whether a pending signal may cut a blocking wait short
    pub interruptible: bool,
    /// Implementation
    pub handler: SyscallFn,
}

impl SyscallDescriptor {
    /// Descriptor for a call without arguments, callable from user mode.
    pub const fn new(number: usize, name: &'static str, handler: SyscallFn) -> Self {
        Self {
            number,
            name,
            args: &[],
            min_args: 0,
            min_privilege: PrivilegeLevel::User,
            interruptible: false,
            handler,
        }
    }

    /// Declare the arguments; the first `required` of them are mandatory.
    pub const fn with_args(mut self, args: &'static [ArgKind], required: usize) -> Self {
        self.args = args;
        self.min_args = required;
        self
    }

    /// Require at least `level` from the caller.
    pub const fn with_privilege(mut self, level: PrivilegeLevel) -> Self {
        self.min_privilege = level;
        self
    }

    /// Allow signals to interrupt blocking waits.
    pub const fn interruptible(mut self) -> Self {
        self.interruptible = true;
        self
    }

    /// Registers consumed by all declared arguments.
    pub const fn max_registers(&self) -> usize {
        let mut total = 0;
        let mut i = 0;
        while i < self.args.len() {
            total += self.args[i].registers();
            i += 1;
        }
        total
    }
}

impl fmt::Debug for SyscallDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyscallDescriptor")
            .field("number", &self.number)
            .field("name", &self.name)
            .field("args", &self.args)
            .field("min_args", &self.min_args)
            .field("min_privilege", &self.min_privilege)
            .field("interruptible", &self.interruptible)
            .finish()
    }
}

/// Error type for building the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// Number does not fit the table.
    NumberOutOfRange(usize),
    /// Slot already taken.
    Duplicate(usize),
    /// Arguments need more registers than the ABIs provide, or the
    /// required count exceeds the declared count.
    BadArguments(usize),
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NumberOutOfRange(n) => write!(f, "syscall {} outside the table", n),
            Self::Duplicate(n) => write!(f, "syscall {} defined twice", n),
            Self::BadArguments(n) => write!(f, "syscall {} has an invalid argument list", n),
        }
    }
}

/// Number-indexed descriptor table.
pub struct SyscallTable {
    slots: [Option<SyscallDescriptor>; MAX_SYSCALLS],
}

impl SyscallTable {
    /// Table with no entries.
    pub const fn new() -> Self {
        const EMPTY: Option<SyscallDescriptor> = None;
        Self {
            slots: [EMPTY; MAX_SYSCALLS],
        }
    }

    /// Add a descriptor.
    pub fn insert(&mut self, desc: SyscallDescriptor) -> Result<(), TableError> {
        if desc.max_registers() > MAX_ARG_REGISTERS || desc.min_args > desc.args.len() {
            return Err(TableError::BadArguments(desc.number));
        }
        let slot = self
            .slots
            .get_mut(desc.number)
            .ok_or(TableError::NumberOutOfRange(desc.number))?;
        if slot.is_some() {
            return Err(TableError::Duplicate(desc.number));
        }
        *slot = Some(desc);
        Ok(())
    }

    /// Builder form of [`SyscallTable::insert`].
    pub fn with(mut self, desc: SyscallDescriptor) -> Result<Self, TableError> {
        self.insert(desc)?;
        Ok(self)
    }

    /// Descriptor for `number`; `None` for empty slots and out-of-range numbers.
    #[inline]
    pub fn lookup(&self, number: usize) -> Option<&SyscallDescriptor> {
        self.slots.get(number).and_then(Option::as_ref)
    }

    /// Number of slots.
    #[inline]
    pub const fn len(&self) -> usize {
        MAX_SYSCALLS
    }

    /// Whether no syscall is defined.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Defined descriptors in number order.
    pub fn iter(&self) -> impl Iterator<Item = &SyscallDescriptor> {
        self.slots.iter().flatten()
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}
