//! Architecture-specific trap encodings.
//!
//! Each architecture module is deliberately narrow: it knows how its raw
//! register snapshot is laid out, how the hardware cause is encoded, which
//! registers carry syscall arguments, and what its vector table looks like.
//! Everything past [`decode`] is architecture neutral.
//!
//! All three encodings build on every host. Only the instructions that touch
//! real control registers and the assembly trampolines are restricted to the
//! matching bare-metal target.

use core::fmt;

use crate::frame::TrapFrame;
use crate::mm::{AccessKind, AddressLayout, VirtAddr};
use crate::privilege::PrivilegeLevel;
use crate::vector::{TrapClass, VectorTable, VectorTableEntry};

pub mod aarch64;
pub mod riscv64;
pub mod x86_64;

/// Supported instruction-set architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// x86_64 (long mode)
    X86_64,
    /// AArch64 (ARMv8-A)
    Aarch64,
    /// RV64 with the S extension
    Riscv64,
}

impl Arch {
    /// All supported architectures.
    pub const ALL: [Arch; 3] = [Arch::X86_64, Arch::Aarch64, Arch::Riscv64];

    /// Architecture the crate is being compiled for, if supported.
    pub const fn current() -> Option<Arch> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::Aarch64)
        } else if cfg!(target_arch = "riscv64") {
            Some(Arch::Riscv64)
        } else {
            None
        }
    }

    /// Number of general-purpose registers saved in a trap frame.
    pub const fn gpr_count(self) -> usize {
        match self {
            Arch::X86_64 => x86_64::GPR_COUNT,
            Arch::Aarch64 => aarch64::GPR_COUNT,
            Arch::Riscv64 => riscv64::GPR_COUNT,
        }
    }

    /// Index of the syscall return register in the normalized GPR order.
    pub const fn return_register(self) -> usize {
        match self {
            Arch::X86_64 => x86_64::REG_RAX,
            Arch::Aarch64 => 0,
            Arch::Riscv64 => riscv64::REG_A0,
        }
    }

    /// Virtual address layout.
    pub const fn layout(self) -> AddressLayout {
        AddressLayout::for_arch(self)
    }

    /// Number of slots in the hardware vector table.
    pub const fn vector_count(self) -> usize {
        match self {
            Arch::X86_64 => x86_64::VECTOR_COUNT,
            Arch::Aarch64 => aarch64::VECTOR_COUNT,
            Arch::Riscv64 => riscv64::VECTOR_COUNT,
        }
    }

    /// Distance in bytes between consecutive trampoline entry points.
    ///
    /// Zero means every vector enters through the same address.
    pub const fn vector_stride(self) -> usize {
        match self {
            Arch::X86_64 => x86_64::STUB_STRIDE,
            Arch::Aarch64 => aarch64::VECTOR_STRIDE,
            Arch::Riscv64 => 0,
        }
    }

    /// Static description of vector `v`.
    pub fn vector_info(self, v: usize) -> VectorInfo {
        match self {
            Arch::X86_64 => x86_64::vector_info(v),
            Arch::Aarch64 => aarch64::vector_info(v),
            Arch::Riscv64 => riscv64::vector_info(v),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86_64 => write!(f, "x86_64"),
            Arch::Aarch64 => write!(f, "aarch64"),
            Arch::Riscv64 => write!(f, "riscv64"),
        }
    }
}

/// Static properties of one vector slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorInfo {
    /// Handler class.
    pub class: TrapClass,
    /// Lowest privilege allowed to raise the vector with an instruction.
    pub min_privilege: PrivilegeLevel,
    /// Whether the vector has a defined meaning on this architecture.
    pub assigned: bool,
}

impl VectorInfo {
    pub(crate) const fn assigned(class: TrapClass, min_privilege: PrivilegeLevel) -> Self {
        Self {
            class,
            min_privilege,
            assigned: true,
        }
    }

    pub(crate) const fn unassigned() -> Self {
        Self {
            class: TrapClass::Exception,
            min_privilege: PrivilegeLevel::Kernel,
            assigned: false,
        }
    }
}

/// Register mapping of one syscall calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallAbi {
    /// GPR index holding the syscall number.
    pub number: usize,
    /// GPR indices of the six argument registers, in order.
    pub args: [usize; 6],
    /// GPR index receiving the return value.
    pub ret: usize,
    /// Bytes the PC must advance to step past the trapping instruction.
    pub pc_advance: u64,
}

impl SyscallAbi {
    /// Read the syscall number from a frame.
    #[inline]
    pub fn number(&self, frame: &TrapFrame) -> usize {
        frame.gpr(self.number) as usize
    }

    /// Read the six raw argument registers from a frame.
    #[inline]
    pub fn args(&self, frame: &TrapFrame) -> [usize; 6] {
        self.args.map(|reg| frame.gpr(reg) as usize)
    }
}

/// CPU-detected fault kinds after architecture decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    /// Integer divide by zero
    DivideByZero,
    /// Debug trap or single step
    Debug,
    /// Software breakpoint
    Breakpoint,
    /// Undefined or illegal instruction
    IllegalInstruction,
    /// Protection violation not caused by paging
    GeneralProtection,
    /// Translation or permission fault
    PageFault {
        /// Faulting virtual address
        addr: VirtAddr,
        /// Access that faulted
        access: AccessKind,
    },
    /// Misaligned access or PC/SP
    Alignment,
    /// Floating-point or SIMD exception
    FloatingPoint,
    /// Fault while delivering a fault
    DoubleFault,
    /// Hardware error (machine check, SError, external abort)
    MachineCheck,
    /// Anything else, with the raw cause
    Other(u64),
}

impl ExceptionKind {
    /// Faults that are fatal to the kernel regardless of origin.
    #[inline]
    pub const fn is_always_fatal(&self) -> bool {
        matches!(self, Self::DoubleFault | Self::MachineCheck)
    }
}

/// Result of classifying a trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    /// CPU exception
    Exception(ExceptionKind),
    /// Hardware interrupt; the controller identifies the line
    Irq,
    /// System call with the ABI used to raise it
    Syscall(SyscallAbi),
    /// Vector with no defined meaning
    Unassigned,
}

/// Bytes to step over the breakpoint instruction that trapped.
///
/// `int3` reports the address after itself; `brk` and `ebreak` report
/// their own address. RISC-V breakpoints may be the 2-byte `c.ebreak`, so
/// their length comes from the parcel carried in the trap value.
pub fn breakpoint_advance(frame: &TrapFrame) -> u64 {
    match frame.arch() {
        Arch::X86_64 => 0,
        Arch::Aarch64 => 4,
        Arch::Riscv64 => riscv64::instruction_length(frame.fault_addr() as u16),
    }
}

/// Decode the cause of a trap taken through `entry`.
///
/// Unassigned entries and software traps raised from below the entry's
/// minimum privilege are decided here; everything else is left to the
/// architecture encoding.
pub fn decode(frame: &TrapFrame, entry: &VectorTableEntry) -> TrapCause {
    if !entry.assigned {
        return TrapCause::Unassigned;
    }

    if entry.class == TrapClass::SoftwareTrap && frame.privilege() < entry.min_privilege {
        return TrapCause::Exception(ExceptionKind::GeneralProtection);
    }

    match frame.arch() {
        Arch::X86_64 => x86_64::decode(frame, entry),
        Arch::Aarch64 => aarch64::decode(frame, entry),
        Arch::Riscv64 => riscv64::decode(frame, entry),
    }
}

/// Address of the first trampoline entry for the running architecture.
pub fn trampoline_base() -> usize {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    return x86_64::trampoline_base();

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    return aarch64::trampoline_base();

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    return riscv64::trampoline_base();

    #[cfg(not(target_os = "none"))]
    return hosted_trampoline as usize;
}

/// Run `f` with interrupts masked on the executing CPU, then restore the
/// previous mask.
///
/// Locks that interrupt handlers also take must only be held under this.
/// Hosted builds take no interrupts and just call `f`.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    return ::x86_64::instructions::interrupts::without_interrupts(f);

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    return aarch64::without_interrupts(f);

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    return riscv64::without_interrupts(f);

    #[cfg(all(not(target_os = "none"), test))]
    return crate::testing::masked(f);

    #[cfg(all(not(target_os = "none"), not(test)))]
    return f();
}

/// Stand-in entry point on hosted builds, where no trap ever arrives.
#[cfg(not(target_os = "none"))]
extern "C" fn hosted_trampoline() {}

/// Write the table base into the architecture's vector base register.
///
/// On hosted builds there is no such register and this only logs.
pub fn install_vector_table(table: &VectorTable) {
    match table.arch() {
        Arch::X86_64 => x86_64::install(table),
        Arch::Aarch64 => aarch64::install(table),
        Arch::Riscv64 => riscv64::install(table),
    }
}
