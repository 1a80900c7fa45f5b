//! Generic Trap Frame
//!
//! Architecture-neutral view of the register state saved at trap entry.
//!
//! # Mutation Rules
//! The frame is owned by the trampoline for the duration of one trap. Code
//! running on behalf of the trap may change it in exactly three ways:
//! - write the syscall return register
//! - advance the PC past a synchronous trapping instruction
//! - replace the whole context with one handed back by the scheduler
//!
//! Each mutation marks the frame dirty, and restoration writes back only what
//! is dirty. A frame nobody touched restores bit-for-bit.

use core::fmt;

use bitflags::bitflags;

use crate::arch::Arch;
use crate::privilege::PrivilegeLevel;

/// Largest GPR count of any supported architecture.
pub const MAX_GPRS: usize = 31;

bitflags! {
    /// Fields changed since capture.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dirty: u8 {
        /// The syscall return register was written.
        const RETURN_VALUE = 1 << 0;
        /// The program counter was advanced.
        const PC = 1 << 1;
        /// The whole context was replaced.
        const CONTEXT = 1 << 2;
    }
}

/// Normalized register snapshot.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    arch: Arch,
    gprs: [u64; MAX_GPRS],
    pc: u64,
    sp: u64,
    status: u64,
    privilege: PrivilegeLevel,
    vector: usize,
    syndrome: u64,
    fault_addr: u64,
    dirty: Dirty,
}

impl TrapFrame {
    /// Create a zeroed context for `arch` running at `privilege`.
    ///
    /// Used to build fresh contexts (e.g. by a scheduler); frames for real
    /// traps come from the architecture capture functions.
    pub const fn new(arch: Arch, privilege: PrivilegeLevel) -> Self {
        Self {
            arch,
            gprs: [0; MAX_GPRS],
            pc: 0,
            sp: 0,
            status: 0,
            privilege,
            vector: 0,
            syndrome: 0,
            fault_addr: 0,
            dirty: Dirty::empty(),
        }
    }

    /// Set a general-purpose register (normalized index).
    ///
    /// Out-of-range indices are ignored.
    pub fn with_gpr(mut self, index: usize, value: u64) -> Self {
        if index < self.arch.gpr_count() {
            self.gprs[index] = value;
        }
        self
    }

    /// Set the program counter.
    pub const fn with_pc(mut self, pc: u64) -> Self {
        self.pc = pc;
        self
    }

    /// Set the stack pointer.
    pub const fn with_sp(mut self, sp: u64) -> Self {
        self.sp = sp;
        self
    }

    /// Set the status / flags word.
    pub const fn with_status(mut self, status: u64) -> Self {
        self.status = status;
        self
    }

    /// Set the trap identification (vector, syndrome, fault address).
    pub const fn with_cause(mut self, vector: usize, syndrome: u64, fault_addr: u64) -> Self {
        self.vector = vector;
        self.syndrome = syndrome;
        self.fault_addr = fault_addr;
        self
    }

    /// Architecture that produced the frame.
    #[inline]
    pub const fn arch(&self) -> Arch {
        self.arch
    }

    /// General-purpose register by normalized index; zero past the arch count.
    #[inline]
    pub fn gpr(&self, index: usize) -> u64 {
        if index < self.arch.gpr_count() {
            self.gprs[index]
        } else {
            0
        }
    }

    /// The saved general-purpose registers in normalized order.
    #[inline]
    pub fn gprs(&self) -> &[u64] {
        &self.gprs[..self.arch.gpr_count()]
    }

    /// Program counter at the time of the trap.
    #[inline]
    pub const fn pc(&self) -> u64 {
        self.pc
    }

    /// Stack pointer at the time of the trap.
    #[inline]
    pub const fn sp(&self) -> u64 {
        self.sp
    }

    /// Processor status / flags word.
    #[inline]
    pub const fn status(&self) -> u64 {
        self.status
    }

    /// Privilege level the trap was taken from.
    #[inline]
    pub const fn privilege(&self) -> PrivilegeLevel {
        self.privilege
    }

    /// Vector number.
    #[inline]
    pub const fn vector(&self) -> usize {
        self.vector
    }

    /// Architecture cause word (x86 error code, ESR, scause).
    #[inline]
    pub const fn syndrome(&self) -> u64 {
        self.syndrome
    }

    /// Fault address (CR2, FAR, stval).
    #[inline]
    pub const fn fault_addr(&self) -> u64 {
        self.fault_addr
    }

    /// Fields changed since capture.
    #[inline]
    pub const fn dirty(&self) -> Dirty {
        self.dirty
    }

    /// Check whether anything must be written back on restore.
    #[inline]
    pub fn is_modified(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Write the syscall return register.
    pub(crate) fn set_return_value(&mut self, value: u64) {
        let reg = self.arch.return_register();
        self.gprs[reg] = value;
        self.dirty |= Dirty::RETURN_VALUE;
    }

    /// Step past the trapping instruction.
    pub(crate) fn advance_pc(&mut self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.pc = self.pc.wrapping_add(bytes);
        self.dirty |= Dirty::PC;
    }

    /// Replace the context with the one the scheduler picked.
    ///
    /// The trap identification of the current trap is kept; it describes
    /// how we entered, not where we return to.
    pub(crate) fn switch_to(&mut self, next: &TrapFrame) {
        debug_assert_eq!(self.arch, next.arch);
        self.gprs = next.gprs;
        self.pc = next.pc;
        self.sp = next.sp;
        self.status = next.status;
        self.privilege = next.privilege;
        self.dirty |= Dirty::CONTEXT;
    }

    /// Build a frame from captured architecture state. Used by the
    /// per-architecture capture functions only.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_raw(
        arch: Arch,
        gprs: &[u64],
        pc: u64,
        sp: u64,
        status: u64,
        privilege: PrivilegeLevel,
        vector: usize,
        syndrome: u64,
        fault_addr: u64,
    ) -> Self {
        let mut frame = Self::new(arch, privilege).with_cause(vector, syndrome, fault_addr);
        let count = arch.gpr_count().min(gprs.len());
        frame.gprs[..count].copy_from_slice(&gprs[..count]);
        frame.pc = pc;
        frame.sp = sp;
        frame.status = status;
        frame
    }
}

impl fmt::Debug for TrapFrame {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TrapFrame({}, {} mode, vector {})", self.arch, self.privilege, self.vector)?;
        writeln!(f, " pc : {:016x}  sp : {:016x}  st : {:016x}", self.pc, self.sp, self.status)?;
        writeln!(f, " syn: {:016x}  far: {:016x}", self.syndrome, self.fault_addr)?;
        for (i, chunk) in self.gprs().chunks(3).enumerate() {
            write!(f, " ")?;
            for (j, reg) in chunk.iter().enumerate() {
                write!(f, " r{:<2}: {:016x}", i * 3 + j, reg)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_frame_is_clean() {
        let frame = TrapFrame::new(Arch::Riscv64, PrivilegeLevel::User).with_pc(0x1000);
        assert!(!frame.is_modified());
        assert_eq!(frame.gprs().len(), 31);
        assert_eq!(TrapFrame::new(Arch::X86_64, PrivilegeLevel::User).gprs().len(), 15);
    }

    #[test]
    fn test_return_value_marks_dirty() {
        let mut frame = TrapFrame::new(Arch::Aarch64, PrivilegeLevel::User);
        frame.set_return_value(13);
        assert_eq!(frame.gpr(0), 13);
        assert_eq!(frame.dirty(), Dirty::RETURN_VALUE);
    }

    #[test]
    fn test_zero_advance_is_not_a_mutation() {
        let mut frame = TrapFrame::new(Arch::X86_64, PrivilegeLevel::User).with_pc(0x40_1000);
        frame.advance_pc(0);
        assert!(!frame.is_modified());
        frame.advance_pc(4);
        assert_eq!(frame.pc(), 0x40_1004);
        assert!(frame.dirty().contains(Dirty::PC));
    }

    #[test]
    fn test_out_of_range_gpr_reads_zero() {
        let frame = TrapFrame::new(Arch::X86_64, PrivilegeLevel::Kernel).with_gpr(20, 7);
        assert_eq!(frame.gpr(20), 0);
    }
}
