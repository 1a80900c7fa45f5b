//! System Call Handler
//!
//! Dispatches system calls and implements the built-in handlers.
//!
//! # Security Considerations
//! - Numbers are validated against the table; unknown calls return ENOSYS
//! - Every argument is validated before the handler is entered
//! - Handlers never touch user memory themselves

use log::{debug, trace};

use super::table::{ArgKind, SyscallDescriptor, SyscallTable, TableError, MAX_ARG_REGISTERS};
use super::validate::{check_shape, validate_args, Direction, SyscallArgs};
use super::SyscallEnv;
use crate::dispatch::{IoProgress, ScheduleReason, Termination};
use crate::error::ErrorCode;
use crate::frame::TrapFrame;
use crate::privilege::PrivilegeGuard;

/// System call numbers
pub mod numbers {
    /// exit(status)
    pub const SYS_EXIT: usize = 0;
    /// write(fd, buf, len)
    pub const SYS_WRITE: usize = 1;
    /// read(fd, buf, len)
    pub const SYS_READ: usize = 2;
    /// yield()
    pub const SYS_YIELD: usize = 3;
    /// getpid()
    pub const SYS_GETPID: usize = 4;
}

/// Dispatch a system call
///
/// # Arguments
/// * `table` - Descriptor table
/// * `env` - Kernel services for the handler
/// * `number` - System call number from the ABI's number register
/// * `raw_args` - The six argument registers
/// * `frame` - Trap frame of the caller
///
/// # Returns
/// The handler's result. Writing it back is left to the caller.
///
/// # Security
/// No handler runs unless every argument validated; rejected calls have no
/// side effects.
pub fn dispatch_syscall(
    table: &SyscallTable,
    env: &SyscallEnv<'_>,
    number: usize,
    raw_args: [usize; MAX_ARG_REGISTERS],
    frame: &mut TrapFrame,
) -> Result<usize, ErrorCode> {
    let Some(desc) = table.lookup(number) else {
        debug!("syscall: unknown number {}", number);
        return Err(ErrorCode::Enosys);
    };

    let caller = frame.privilege();
    if !PrivilegeGuard::permits(caller, desc.min_privilege) {
        debug!("syscall: {} denied to {} caller", desc.name, caller);
        return Err(ErrorCode::Eperm);
    }

    check_shape(desc, &raw_args)?;
    let guard = PrivilegeGuard::new(env.process.user_range(), frame.arch().layout());
    let args = validate_args(desc, &raw_args, &guard, caller)?;

    trace!("syscall: {}{:x?}", desc.name, &raw_args[..desc.max_registers()]);
    env.set_interruptible(desc.interruptible);
    (desc.handler)(env, frame, &args)
}

const EXIT_ARGS: &[ArgKind] = &[ArgKind::Int];
const WRITE_ARGS: &[ArgKind] = &[ArgKind::Int, ArgKind::UserBuffer(Direction::Read)];
const READ_ARGS: &[ArgKind] = &[ArgKind::Int, ArgKind::UserBuffer(Direction::Write)];

/// Table holding the built-in system calls.
///
/// Kernels add their own calls with [`SyscallTable::insert`].
pub fn builtin_table() -> Result<SyscallTable, TableError> {
    SyscallTable::new()
        .with(SyscallDescriptor::new(numbers::SYS_EXIT, "exit", sys_exit).with_args(EXIT_ARGS, 1))?
        .with(
            SyscallDescriptor::new(numbers::SYS_WRITE, "write", sys_write)
                .with_args(WRITE_ARGS, 2),
        )?
        .with(
            SyscallDescriptor::new(numbers::SYS_READ, "read", sys_read)
                .with_args(READ_ARGS, 2)
                .interruptible(),
        )?
        .with(SyscallDescriptor::new(numbers::SYS_YIELD, "yield", sys_yield))?
        .with(SyscallDescriptor::new(numbers::SYS_GETPID, "getpid", sys_getpid))
}

/// Exit system call
///
/// Terminates the current thread; the dispatch core switches away after
/// write-back.
fn sys_exit(
    env: &SyscallEnv<'_>,
    _frame: &mut TrapFrame,
    args: &SyscallArgs,
) -> Result<usize, ErrorCode> {
    let status = args.int(0) as i32;
    debug!("syscall: exit({})", status);
    env.process.terminate_current(Termination::Exit(status));
    env.defer(ScheduleReason::Terminated);
    Ok(0)
}

/// Write system call
///
/// # Returns
/// Number of bytes written; descriptor errors come from the file table.
fn sys_write(
    env: &SyscallEnv<'_>,
    _frame: &mut TrapFrame,
    args: &SyscallArgs,
) -> Result<usize, ErrorCode> {
    let buf = args.buffer(1).ok_or(ErrorCode::Einval)?;
    env.files.write(args.int(0), buf)
}

/// Read system call
///
/// Waits at the scheduler until data arrives; a pending signal at that
/// point ends the wait with EINTR.
fn sys_read(
    env: &SyscallEnv<'_>,
    frame: &mut TrapFrame,
    args: &SyscallArgs,
) -> Result<usize, ErrorCode> {
    let fd = args.int(0);
    let buf = args.buffer(1).ok_or(ErrorCode::Einval)?;
    loop {
        match env.files.read(fd, buf)? {
            IoProgress::Done(n) => return Ok(n),
            IoProgress::WouldBlock => env.block(frame)?,
        }
    }
}

fn sys_yield(
    env: &SyscallEnv<'_>,
    _frame: &mut TrapFrame,
    _args: &SyscallArgs,
) -> Result<usize, ErrorCode> {
    env.defer(ScheduleReason::Yield);
    Ok(0)
}

fn sys_getpid(
    env: &SyscallEnv<'_>,
    _frame: &mut TrapFrame,
    _args: &SyscallArgs,
) -> Result<usize, ErrorCode> {
    Ok(env.process.current_pid())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::vec;

    use super::*;
    use crate::arch::Arch;
    use crate::privilege::{PrivilegeLevel, UserRange};
    use crate::testing::{FakeFiles, FakeProcess, FakeScheduler};

    const WINDOW: UserRange = UserRange::new(0x4000_0000, 0x4010_0000);

    struct Env {
        process: FakeProcess,
        files: FakeFiles,
        scheduler: FakeScheduler,
    }

    impl Env {
        fn new() -> Self {
            Self {
                process: FakeProcess::new(7, WINDOW),
                files: FakeFiles::new(),
                scheduler: FakeScheduler::new(),
            }
        }

        fn env(&self) -> SyscallEnv<'_> {
            SyscallEnv::new(&self.process, &self.files, &self.scheduler)
        }
    }

    fn user_frame() -> TrapFrame {
        TrapFrame::new(Arch::Riscv64, PrivilegeLevel::User)
    }

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counting(_: &SyscallEnv<'_>, _: &mut TrapFrame, _: &SyscallArgs) -> Result<usize, ErrorCode> {
        CALLS.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    #[test]
    fn test_unknown_numbers_are_enosys() {
        let table = builtin_table().unwrap();
        let fixture = Env::new();
        let mut frame = user_frame();
        for number in [5, 63, 64, usize::MAX] {
            assert_eq!(
                dispatch_syscall(&table, &fixture.env(), number, [0; 6], &mut frame),
                Err(ErrorCode::Enosys)
            );
        }
        assert!(!frame.is_modified());
        assert!(fixture.files.written().is_empty());
    }

    #[test]
    fn test_error_precedence() {
        const PTR: &[ArgKind] = &[ArgKind::UserIn(8)];
        CALLS.store(0, Ordering::SeqCst);
        let table = SyscallTable::new()
            .with(
                SyscallDescriptor::new(9, "privileged", counting)
                    .with_args(PTR, 1)
                    .with_privilege(PrivilegeLevel::Kernel),
            )
            .unwrap();
        let fixture = Env::new();
        let env = fixture.env();
        let mut frame = user_frame();

        // kernel pointer and stray register, but privilege is checked first
        let bad = [0xFFFF_FFC0_0000_0000, 1, 0, 0, 0, 0];
        assert_eq!(dispatch_syscall(&table, &env, 9, bad, &mut frame), Err(ErrorCode::Eperm));

        let mut kframe = TrapFrame::new(Arch::Riscv64, PrivilegeLevel::Kernel);
        assert_eq!(dispatch_syscall(&table, &env, 9, bad, &mut kframe), Err(ErrorCode::Einval));
        let kernel_ptr = [0xFFFF_FFC0_0000_0000, 0, 0, 0, 0, 0];
        assert_eq!(
            dispatch_syscall(&table, &env, 9, kernel_ptr, &mut kframe),
            Err(ErrorCode::Efault)
        );
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);

        let ok = [0x4000_0000, 0, 0, 0, 0, 0];
        assert_eq!(dispatch_syscall(&table, &env, 9, ok, &mut kframe), Ok(0));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_getpid_and_yield() {
        let table = builtin_table().unwrap();
        let fixture = Env::new();
        let env = fixture.env();
        let mut frame = user_frame();

        assert_eq!(dispatch_syscall(&table, &env, numbers::SYS_GETPID, [0; 6], &mut frame), Ok(7));
        assert_eq!(env.take_deferred(), None);

        assert_eq!(dispatch_syscall(&table, &env, numbers::SYS_YIELD, [0; 6], &mut frame), Ok(0));
        assert_eq!(env.take_deferred(), Some(ScheduleReason::Yield));
        // the handler itself never calls the scheduler
        assert!(fixture.scheduler.reasons().is_empty());
    }

    #[test]
    fn test_exit_terminates_and_defers() {
        let table = builtin_table().unwrap();
        let fixture = Env::new();
        let env = fixture.env();
        let mut frame = user_frame();

        let status = (-3i32) as u32 as usize;
        assert_eq!(
            dispatch_syscall(&table, &env, numbers::SYS_EXIT, [status, 0, 0, 0, 0, 0], &mut frame),
            Ok(0)
        );
        assert_eq!(fixture.process.terminations(), vec![Termination::Exit(-3)]);
        env.defer(ScheduleReason::Yield);
        assert_eq!(env.take_deferred(), Some(ScheduleReason::Terminated));
    }

    #[test]
    fn test_read_blocks_until_data() {
        let table = builtin_table().unwrap();
        let fixture = Env::new();
        fixture.files.queue_read(None);
        fixture.files.queue_read(None);
        fixture.files.queue_read(Some(&b"hey"[..]));

        let mut dest = [0u8; 8];
        let addr = dest.as_mut_ptr() as usize;
        let process = FakeProcess::new(7, UserRange::from_base_len(addr, dest.len()));
        let env = SyscallEnv::new(&process, &fixture.files, &fixture.scheduler);
        let mut frame = TrapFrame::new(Arch::Aarch64, PrivilegeLevel::User);

        let raw = [0, addr, dest.len(), 0, 0, 0];
        assert_eq!(dispatch_syscall(&table, &env, numbers::SYS_READ, raw, &mut frame), Ok(3));
        assert_eq!(&dest[..3], b"hey");
        assert_eq!(
            fixture.scheduler.reasons(),
            vec![ScheduleReason::Blocked, ScheduleReason::Blocked]
        );
    }

    #[test]
    fn test_read_interrupted_by_signal() {
        let table = builtin_table().unwrap();
        let fixture = Env::new();
        fixture.files.queue_read(None);
        fixture.process.raise_signal();
        let env = fixture.env();
        let mut frame = user_frame();

        let raw = [0, 0x4000_0000, 16, 0, 0, 0];
        assert_eq!(
            dispatch_syscall(&table, &env, numbers::SYS_READ, raw, &mut frame),
            Err(ErrorCode::Eintr)
        );
        assert!(fixture.scheduler.reasons().is_empty());
    }

    #[test]
    fn test_write_bad_descriptor() {
        let table = builtin_table().unwrap();
        let fixture = Env::new();
        let mut frame = user_frame();
        let raw = [42, 0x4000_0000, 4, 0, 0, 0];
        assert_eq!(
            dispatch_syscall(&table, &fixture.env(), numbers::SYS_WRITE, raw, &mut frame),
            Err(ErrorCode::Ebadf)
        );
    }
}
