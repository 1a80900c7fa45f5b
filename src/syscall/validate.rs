//! System Call Input Validation
//!
//! Turns the six raw argument registers into typed, validated arguments.
//!
//! # Security Principles
//! - Validate ALL arguments before the handler runs
//! - Fail-secure: deny by default
//! - Shape errors are reported before address errors, so the error a caller
//!   sees does not depend on which argument happened to be checked first
//!
//! Validation never dereferences user memory. A [`UserBuffer`] only records
//! that a range passed the [`PrivilegeGuard`]; reading or writing it is up
//! to the collaborator the handler passes it to.

use super::table::{ArgKind, SyscallDescriptor, MAX_ARG_REGISTERS};
use crate::error::ErrorCode;
use crate::privilege::{PrivilegeGuard, PrivilegeLevel};

/// Which way data moves through a user buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The kernel reads from user memory
    Read,
    /// The kernel writes to user memory
    Write,
}

/// A validated user-space buffer
///
/// This type guarantees that:
/// - The buffer is within the calling thread's user window
/// - The buffer does not touch kernel space
/// - `ptr + len` doesn't overflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserBuffer {
    ptr: usize,
    len: usize,
    direction: Direction,
}

impl UserBuffer {
    /// Start address.
    #[inline]
    pub const fn addr(&self) -> usize {
        self.ptr
    }

    /// Length in bytes.
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Declared transfer direction.
    #[inline]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Get the buffer as a byte slice
    ///
    /// # Safety
    /// The range passed address validation only; the caller must make sure
    /// it is mapped in the current address space for `'a` and accept that
    /// user code may change it concurrently.
    pub unsafe fn as_bytes<'a>(&self) -> &'a [u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: upheld by the caller.
        unsafe { core::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    /// Get the buffer as a mutable byte slice
    ///
    /// # Safety
    /// Same as [`UserBuffer::as_bytes`], and no other reference to the range
    /// may exist for `'a`.
    pub unsafe fn as_bytes_mut<'a>(&self) -> &'a mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: upheld by the caller.
        unsafe { core::slice::from_raw_parts_mut(self.ptr as *mut u8, self.len) }
    }
}

/// One validated argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    /// Optional argument left out (null pointer)
    Absent,
    /// Integer argument
    Int(usize),
    /// Pointer argument that passed validation
    User(UserBuffer),
}

/// Validated arguments, indexed by declared argument position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallArgs {
    args: [Arg; MAX_ARG_REGISTERS],
    count: usize,
}

impl SyscallArgs {
    /// Argument `i`.
    #[inline]
    pub fn get(&self, i: usize) -> Arg {
        if i < self.count {
            self.args[i]
        } else {
            Arg::Absent
        }
    }

    /// Integer argument `i`; zero if it is not an integer.
    pub fn int(&self, i: usize) -> usize {
        match self.get(i) {
            Arg::Int(value) => value,
            _ => 0,
        }
    }

    /// Pointer argument `i`, if present.
    pub fn buffer(&self, i: usize) -> Option<UserBuffer> {
        match self.get(i) {
            Arg::User(buf) => Some(buf),
            _ => None,
        }
    }

    /// Number of declared arguments.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the call takes no arguments.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Raw registers of declared argument `i`: `(value, length)`.
fn split(
    desc: &SyscallDescriptor,
    raw: &[usize; MAX_ARG_REGISTERS],
) -> [(usize, usize); MAX_ARG_REGISTERS] {
    let reg_at = |i: usize| raw.get(i).copied().unwrap_or(0);
    let mut out = [(0, 0); MAX_ARG_REGISTERS];
    let mut reg = 0;
    for (slot, kind) in out.iter_mut().zip(desc.args) {
        *slot = match *kind {
            ArgKind::Int => (reg_at(reg), 0),
            ArgKind::UserIn(size) | ArgKind::UserOut(size) => (reg_at(reg), size),
            ArgKind::UserBuffer(_) => (reg_at(reg), reg_at(reg + 1)),
        };
        reg += kind.registers();
    }
    out
}

/// Check the shape of the arguments.
///
/// Registers beyond the declared arguments must be zero and required pointers
/// must not be null. A required buffer of length zero may be null: nothing is
/// ever transferred through it.
pub fn check_shape(
    desc: &SyscallDescriptor,
    raw: &[usize; MAX_ARG_REGISTERS],
) -> Result<(), ErrorCode> {
    let unused = raw.get(desc.max_registers()..).unwrap_or(&[]);
    if unused.iter().any(|&r| r != 0) {
        return Err(ErrorCode::Einval);
    }

    let values = split(desc, raw);
    for (kind, &(ptr, len)) in desc.args.iter().zip(&values).take(desc.min_args) {
        let empty_buffer = matches!(kind, ArgKind::UserBuffer(_)) && len == 0;
        if kind.is_pointer() && ptr == 0 && !empty_buffer {
            return Err(ErrorCode::Einval);
        }
    }
    Ok(())
}

/// Validate every argument of a call whose shape already passed
/// [`check_shape`].
///
/// # Security Checks
/// 1. Pointer plus length doesn't overflow
/// 2. The range does not touch kernel space
/// 3. The range lies within the caller's user window
pub fn validate_args(
    desc: &SyscallDescriptor,
    raw: &[usize; MAX_ARG_REGISTERS],
    guard: &PrivilegeGuard,
    caller: PrivilegeLevel,
) -> Result<SyscallArgs, ErrorCode> {
    let values = split(desc, raw);
    let mut args = SyscallArgs {
        args: [Arg::Absent; MAX_ARG_REGISTERS],
        count: desc.args.len().min(MAX_ARG_REGISTERS),
    };

    for (i, kind) in desc.args.iter().enumerate().take(MAX_ARG_REGISTERS) {
        let (ptr, len) = values[i];
        args.args[i] = match *kind {
            ArgKind::Int => Arg::Int(ptr),
            ArgKind::UserBuffer(direction) if len == 0 && ptr == 0 => Arg::User(UserBuffer {
                ptr,
                len,
                direction,
            }),
            _ if ptr == 0 => Arg::Absent,
            ArgKind::UserIn(_) => user(guard, caller, ptr, len, Direction::Read)?,
            ArgKind::UserOut(_) => user(guard, caller, ptr, len, Direction::Write)?,
            ArgKind::UserBuffer(direction) => user(guard, caller, ptr, len, direction)?,
        };
    }
    Ok(args)
}

fn user(
    guard: &PrivilegeGuard,
    caller: PrivilegeLevel,
    ptr: usize,
    len: usize,
    direction: Direction,
) -> Result<Arg, ErrorCode> {
    if guard.is_valid_user_range(ptr, len, caller) {
        Ok(Arg::User(UserBuffer { ptr, len, direction }))
    } else {
        Err(ErrorCode::Efault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::TrapFrame;
    use crate::mm::AddressLayout;
    use crate::privilege::UserRange;
    use crate::syscall::SyscallEnv;

    const USER_START: usize = 0x4000_0000;
    const USER_END: usize = 0x4008_0000;

    const WRITE_ARGS: &[ArgKind] = &[ArgKind::Int, ArgKind::UserBuffer(Direction::Read)];
    const STAT_ARGS: &[ArgKind] = &[ArgKind::UserIn(16), ArgKind::UserOut(64)];

    fn nop(_: &SyscallEnv<'_>, _: &mut TrapFrame, _: &SyscallArgs) -> Result<usize, ErrorCode> {
        Ok(0)
    }

    fn guard() -> PrivilegeGuard {
        PrivilegeGuard::new(UserRange::new(USER_START, USER_END), AddressLayout::AARCH64)
    }

    fn write_desc() -> SyscallDescriptor {
        SyscallDescriptor::new(1, "write", nop).with_args(WRITE_ARGS, 2)
    }

    #[test]
    fn test_trailing_registers_must_be_zero() {
        let desc = write_desc();
        assert_eq!(check_shape(&desc, &[1, USER_START, 13, 0, 0, 0]), Ok(()));
        assert_eq!(check_shape(&desc, &[1, USER_START, 13, 7, 0, 0]), Err(ErrorCode::Einval));
    }

    #[test]
    fn test_required_null_pointer_is_einval() {
        let desc = write_desc();
        assert_eq!(check_shape(&desc, &[1, 0, 13, 0, 0, 0]), Err(ErrorCode::Einval));
        // nothing to transfer
        assert_eq!(check_shape(&desc, &[1, 0, 0, 0, 0, 0]), Ok(()));
    }

    #[test]
    fn test_zero_length_null_buffer_is_valid() {
        let args = validate_args(&write_desc(), &[1, 0, 0, 0, 0, 0], &guard(), PrivilegeLevel::User)
            .unwrap();
        assert!(args.buffer(1).unwrap().is_empty());
    }

    #[test]
    fn test_buffer_validation() {
        let desc = write_desc();
        let args = validate_args(&desc, &[1, USER_START, 13, 0, 0, 0], &guard(), PrivilegeLevel::User)
            .unwrap();
        assert_eq!(args.int(0), 1);
        let buf = args.buffer(1).unwrap();
        assert_eq!((buf.addr(), buf.len(), buf.direction()), (USER_START, 13, Direction::Read));

        let overflowing = [1, usize::MAX - 4, 13, 0, 0, 0];
        assert_eq!(
            validate_args(&desc, &overflowing, &guard(), PrivilegeLevel::User),
            Err(ErrorCode::Efault)
        );
        let kernel = [1, 0xFFFF_0000_0000_1000, 8, 0, 0, 0];
        assert_eq!(
            validate_args(&desc, &kernel, &guard(), PrivilegeLevel::User),
            Err(ErrorCode::Efault)
        );
    }

    #[test]
    fn test_fixed_size_pointers_and_optional_arguments() {
        let desc = SyscallDescriptor::new(9, "stat", nop).with_args(STAT_ARGS, 1);
        let args = validate_args(&desc, &[USER_START, 0, 0, 0, 0, 0], &guard(), PrivilegeLevel::User)
            .unwrap();
        assert_eq!(args.buffer(0).map(|b| b.len()), Some(16));
        assert_eq!(args.get(1), Arg::Absent);
        assert_eq!(args.get(5), Arg::Absent);

        // 64-byte object crossing the end of the window
        let raw = [USER_START, USER_END - 32, 0, 0, 0, 0];
        assert_eq!(
            validate_args(&desc, &raw, &guard(), PrivilegeLevel::User),
            Err(ErrorCode::Efault)
        );
    }
}
