//! RISC-V (RV64, S-mode) Trap Encoding
//!
//! `stvec` runs in direct mode: every trap enters the same trampoline and the
//! vector is recovered from `scause`. Exception code `c` maps to vector `c`,
//! interrupt code `i` to vector `16 + i`, giving a 32-entry table.

use bitflags::bitflags;
use log::debug;

use super::{ExceptionKind, SyscallAbi, TrapCause, VectorInfo};
use crate::frame::{Dirty, TrapFrame};
use crate::mm::{AccessKind, VirtAddr};
use crate::privilege::PrivilegeLevel;
use crate::vector::{TrapClass, VectorTable, VectorTableEntry};

/// Saved general-purpose registers x1..x31 (x0 is hardwired to zero).
pub const GPR_COUNT: usize = 31;
/// Exception codes and interrupt codes, 16 each.
pub const VECTOR_COUNT: usize = 32;
/// First vector used for interrupts.
pub const INTERRUPT_VECTOR_BASE: usize = 16;

/// Normalized index of a0 (x10).
pub const REG_A0: usize = 9;
/// Normalized index of a7 (x17).
pub const REG_A7: usize = 16;

// {m,s}cause register flags
const CAUSE_IRQ_FLAG_MASK: u64 = 1 << 63;

/// `ecall` convention: a7; a0..a5; return a0. `sepc` points at the ecall.
pub const ECALL_ABI: SyscallAbi = SyscallAbi {
    number: REG_A7,
    args: [REG_A0, REG_A0 + 1, REG_A0 + 2, REG_A0 + 3, REG_A0 + 4, REG_A0 + 5],
    ret: REG_A0,
    pc_advance: 4,
};

/// Possible exception causes on a RISC-V CPU.
#[repr(usize)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ExceptionCause {
    /// Instruction address misaligned
    InstrAddrMisaligned = 0,
    /// Instruction access fault
    InstrAccessFault = 1,
    /// Illegal instruction
    IllegalInstr = 2,
    /// Breakpoint (`ebreak`)
    Breakpoint = 3,
    /// Load address misaligned
    LoadAddrMisaligned = 4,
    /// Load access fault
    LoadAccessFault = 5,
    /// Store/AMO address misaligned
    StoreAddrMisaligned = 6,
    /// Store/AMO access fault
    StoreAccessFault = 7,
    /// `ecall` from U-mode
    EnvCallFromU = 8,
    /// `ecall` from S-mode
    EnvCallFromS = 9,
    /// Instruction page fault
    InstrPageFault = 12,
    /// Load page fault
    LoadPageFault = 13,
    /// Store/AMO page fault
    StorePageFault = 15,
}

impl ExceptionCause {
    /// Decode an exception code; `None` for reserved codes.
    pub const fn from_code(code: usize) -> Option<Self> {
        use ExceptionCause::*;

        Some(match code {
            0 => InstrAddrMisaligned,
            1 => InstrAccessFault,
            2 => IllegalInstr,
            3 => Breakpoint,
            4 => LoadAddrMisaligned,
            5 => LoadAccessFault,
            6 => StoreAddrMisaligned,
            7 => StoreAccessFault,
            8 => EnvCallFromU,
            9 => EnvCallFromS,
            12 => InstrPageFault,
            13 => LoadPageFault,
            15 => StorePageFault,
            _ => return None,
        })
    }
}

/// Supervisor interrupt causes.
#[repr(usize)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum IrqCause {
    /// Supervisor software interrupt
    SSoft = 1,
    /// Supervisor timer interrupt
    STimer = 5,
    /// Supervisor external interrupt (PLIC)
    SExternal = 9,
}

bitflags! {
    /// `sstatus` bits the dispatch core cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SstatusFlags: u64 {
        /// Supervisor interrupt enable
        const SIE = 1 << 1;
        /// Previous SIE
        const SPIE = 1 << 5;
        /// Previous privilege was S-mode
        const SPP = 1 << 8;
        /// Supervisor may access user pages
        const SUM = 1 << 18;
    }
}

/// Length of the instruction whose lowest parcel is `parcel`.
///
/// Only the 16- and 32-bit encodings exist in RV64GC.
pub const fn instruction_length(parcel: u16) -> u64 {
    if parcel & 0b11 == 0b11 {
        4
    } else {
        2
    }
}

/// Vector number for a raw `scause` value.
///
/// Causes beyond the table map to [`VECTOR_COUNT`], which has no entry.
pub const fn vector_for_cause(scause: u64) -> usize {
    let code = (scause & !CAUSE_IRQ_FLAG_MASK) as usize;
    let base = if scause & CAUSE_IRQ_FLAG_MASK != 0 {
        INTERRUPT_VECTOR_BASE
    } else {
        0
    };
    if code < INTERRUPT_VECTOR_BASE {
        base + code
    } else {
        VECTOR_COUNT
    }
}

/// Information stored by the trap handler.
///
/// Note: the order of the fields in this structure **must** match the order
/// in which registers are stored by the trampoline in `trap.S`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Riscv64TrapFrame {
    /// x1..x31 (ra, sp, gp, tp, t0-t2, s0-s1, a0-a7, s2-s11, t3-t6)
    pub regs: [u64; GPR_COUNT],
    /// Exception program counter
    pub sepc: u64,
    /// Supervisor status
    pub sstatus: u64,
    /// Trap cause
    pub scause: u64,
    /// Trap value (faulting address)
    pub stval: u64,
    /// Instruction parcel at `sepc`, read for breakpoints only
    pub parcel: u64,
}

impl Riscv64TrapFrame {
    /// Privilege level the trap was taken from.
    #[inline]
    pub fn privilege(&self) -> PrivilegeLevel {
        if SstatusFlags::from_bits_truncate(self.sstatus).contains(SstatusFlags::SPP) {
            PrivilegeLevel::Kernel
        } else {
            PrivilegeLevel::User
        }
    }

    /// Build the generic view.
    ///
    /// A breakpoint reports its instruction parcel as the trap value.
    pub fn capture(&self) -> TrapFrame {
        let trap_value = if self.scause == ExceptionCause::Breakpoint as u64 {
            self.parcel
        } else {
            self.stval
        };
        TrapFrame::from_raw(
            super::Arch::Riscv64,
            &self.regs,
            self.sepc,
            self.regs[1],
            self.sstatus,
            self.privilege(),
            vector_for_cause(self.scause),
            self.scause,
            trap_value,
        )
    }

    /// Write back whatever the dispatch core changed.
    pub fn restore(&mut self, frame: &TrapFrame) {
        let dirty = frame.dirty();

        if dirty.contains(Dirty::CONTEXT) {
            self.regs.copy_from_slice(frame.gprs());
            self.regs[1] = frame.sp();
            self.sepc = frame.pc();
            let mut status = SstatusFlags::from_bits_retain(frame.status());
            status.set(SstatusFlags::SPP, frame.privilege() != PrivilegeLevel::User);
            self.sstatus = status.bits();
            return;
        }

        if dirty.contains(Dirty::RETURN_VALUE) {
            self.regs[REG_A0] = frame.gpr(REG_A0);
        }
        if dirty.contains(Dirty::PC) {
            self.sepc = frame.pc();
        }
    }
}

/// Static description of cause-indexed slot `v`.
pub fn vector_info(v: usize) -> VectorInfo {
    use ExceptionCause::*;

    if v >= INTERRUPT_VECTOR_BASE {
        let code = v - INTERRUPT_VECTOR_BASE;
        return if code == IrqCause::SSoft as usize
            || code == IrqCause::STimer as usize
            || code == IrqCause::SExternal as usize
        {
            VectorInfo::assigned(TrapClass::HardwareIrq, PrivilegeLevel::Kernel)
        } else {
            VectorInfo::unassigned()
        };
    }

    match ExceptionCause::from_code(v) {
        Some(EnvCallFromU) => VectorInfo::assigned(TrapClass::SoftwareTrap, PrivilegeLevel::User),
        Some(Breakpoint) => VectorInfo::assigned(TrapClass::Exception, PrivilegeLevel::User),
        Some(EnvCallFromS) | None => VectorInfo::unassigned(),
        Some(_) => VectorInfo::assigned(TrapClass::Exception, PrivilegeLevel::Kernel),
    }
}

/// Decode an assigned RISC-V trap.
pub fn decode(frame: &TrapFrame, entry: &VectorTableEntry) -> TrapCause {
    use ExceptionCause::*;

    match entry.class {
        TrapClass::HardwareIrq => return TrapCause::Irq,
        TrapClass::SoftwareTrap => return TrapCause::Syscall(ECALL_ABI),
        TrapClass::Exception => {}
    }

    let page_fault = |access| ExceptionKind::PageFault {
        addr: VirtAddr::new(frame.fault_addr() as usize),
        access,
    };

    let kind = match ExceptionCause::from_code(entry.vector) {
        Some(InstrAddrMisaligned | LoadAddrMisaligned | StoreAddrMisaligned) => {
            ExceptionKind::Alignment
        }
        Some(InstrAccessFault | LoadAccessFault | StoreAccessFault) => {
            ExceptionKind::GeneralProtection
        }
        Some(IllegalInstr) => ExceptionKind::IllegalInstruction,
        Some(Breakpoint) => ExceptionKind::Breakpoint,
        Some(InstrPageFault) => page_fault(AccessKind::Execute),
        Some(LoadPageFault) => page_fault(AccessKind::Read),
        Some(StorePageFault) => page_fault(AccessKind::Write),
        Some(EnvCallFromU | EnvCallFromS) | None => ExceptionKind::Other(frame.syndrome()),
    };
    TrapCause::Exception(kind)
}

/// Configures the trap vector used to handle traps in S-mode.
pub fn install(table: &VectorTable) {
    let base = table.base();
    debug!("riscv64: stvec <- {:#x} (direct)", base);

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: the base is the 4-byte aligned trampoline from trap.S; mode
    // bits 1:0 stay zero (direct mode).
    unsafe {
        core::arch::asm!("csrw stvec, {}", in(reg) base & !0b11, options(nostack));
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(include_str!("trap.S"));

/// Address of the direct-mode trampoline.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn trampoline_base() -> usize {
    extern "C" {
        fn riscv64_trap_vector();
    }
    riscv64_trap_vector as usize
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[no_mangle]
extern "C" fn riscv64_trap_entry(raw: &mut Riscv64TrapFrame) {
    if raw.scause == ExceptionCause::Breakpoint as u64 {
        // SAFETY: sepc points at the ebreak that just executed, so the page
        // is mapped; SUM is held only for the one load.
        raw.parcel = unsafe { read_parcel(raw.sepc) };
    }
    let mut frame = raw.capture();
    crate::dispatch::enter(&mut frame);
    raw.restore(&frame);
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
unsafe fn read_parcel(pc: u64) -> u64 {
    let sum = SstatusFlags::SUM.bits();
    // SAFETY: caller guarantees `pc` is a mapped, 2-byte aligned code address.
    unsafe {
        core::arch::asm!("csrs sstatus, {}", in(reg) sum, options(nostack));
        let parcel = core::ptr::read_volatile(pc as *const u16);
        core::arch::asm!("csrc sstatus, {}", in(reg) sum, options(nostack));
        parcel as u64
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub(super) fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let sstatus: u64;
    // SAFETY: clearing SIE is always allowed in S-mode.
    unsafe { core::arch::asm!("csrrci {}, sstatus, 2", out(reg) sstatus, options(nostack)) };
    let result = f();
    if SstatusFlags::from_bits_truncate(sstatus).contains(SstatusFlags::SIE) {
        // SAFETY: SIE was set on entry.
        unsafe { core::arch::asm!("csrsi sstatus, 2", options(nostack)) };
    }
    result
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
static CPU_INDICES: crate::dispatch::CpuIndexMap = crate::dispatch::CpuIndexMap::new();

/// CPU operations on real hardware.
///
/// The hart id is expected in `tp`, as left by the boot code.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub struct HardwareCpu;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
impl crate::dispatch::CpuOps for HardwareCpu {
    fn cpu_id(&self) -> usize {
        let hart: u64;
        // SAFETY: reading tp has no side effects.
        unsafe { core::arch::asm!("mv {}, tp", out(reg) hart, options(nomem, nostack)) };
        CPU_INDICES
            .index_of(hart)
            .unwrap_or(crate::dispatch::MAX_CPUS)
    }

    fn enable_interrupts(&self) {
        // SAFETY: stvec has been initialized by `install`.
        unsafe { core::arch::asm!("csrsi sstatus, 2", options(nomem, nostack)) };
    }

    fn disable_interrupts(&self) {
        // SAFETY: clearing SIE is always allowed in S-mode.
        unsafe { core::arch::asm!("csrci sstatus, 2", options(nomem, nostack)) };
    }

    fn cycles(&self) -> u64 {
        let time: u64;
        // SAFETY: the time CSR is readable from S-mode.
        unsafe { core::arch::asm!("rdtime {}", out(reg) time, options(nomem, nostack)) };
        time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{self, Arch};

    fn ecall_frame() -> Riscv64TrapFrame {
        let mut raw = Riscv64TrapFrame {
            sepc: 0x1_0000,
            scause: ExceptionCause::EnvCallFromU as u64,
            ..Default::default()
        };
        raw.regs[1] = 0x3f_fff0;
        raw.regs[REG_A7] = 4;
        raw.regs[REG_A0] = 0xa0;
        raw
    }

    #[test]
    fn test_cause_to_vector() {
        assert_eq!(vector_for_cause(8), 8);
        assert_eq!(vector_for_cause(CAUSE_IRQ_FLAG_MASK | 5), 21);
        assert_eq!(vector_for_cause(CAUSE_IRQ_FLAG_MASK | 9), 25);
        assert_eq!(vector_for_cause(24), VECTOR_COUNT);
    }

    #[test]
    fn test_table_assignment() {
        assert_eq!(vector_info(8).class, TrapClass::SoftwareTrap);
        assert!(!vector_info(9).assigned);
        assert!(!vector_info(14).assigned);
        assert!(vector_info(16 + 5).assigned);
        assert!(!vector_info(16 + 3).assigned);
    }

    #[test]
    fn test_ecall_advances_pc() {
        let table = VectorTable::build(Arch::Riscv64, 0x8020_0000);
        let raw = ecall_frame();
        let frame = raw.capture();
        let entry = table.lookup_vector(frame.vector()).unwrap();

        let TrapCause::Syscall(abi) = arch::decode(&frame, &entry) else {
            panic!("ecall not decoded as syscall");
        };
        assert_eq!(abi.number(&frame), 4);
        assert_eq!(abi.pc_advance, 4);

        let mut frame = frame;
        frame.set_return_value(1234);
        frame.advance_pc(abi.pc_advance);
        let mut restored = raw;
        restored.restore(&frame);
        assert_eq!(restored.sepc, 0x1_0004);
        assert_eq!(restored.regs[REG_A0], 1234);
        assert_eq!(restored.regs[1], raw.regs[1]);
    }

    #[test]
    fn test_store_page_fault() {
        let table = VectorTable::build(Arch::Riscv64, 0x8020_0000);
        let raw = Riscv64TrapFrame {
            scause: ExceptionCause::StorePageFault as u64,
            stval: 0x2000_0008,
            ..Default::default()
        };
        let frame = raw.capture();
        let entry = table.lookup_vector(frame.vector()).unwrap();
        assert_eq!(
            arch::decode(&frame, &entry),
            TrapCause::Exception(ExceptionKind::PageFault {
                addr: VirtAddr::new(0x2000_0008),
                access: AccessKind::Write,
            })
        );
    }

    #[test]
    fn test_instruction_length() {
        // c.ebreak
        assert_eq!(instruction_length(0x9002), 2);
        // ebreak, low parcel of 0x0010_0073
        assert_eq!(instruction_length(0x0073), 4);
    }

    #[test]
    fn test_breakpoint_reports_parcel() {
        let raw = Riscv64TrapFrame {
            sepc: 0x1_0000,
            scause: ExceptionCause::Breakpoint as u64,
            stval: 0x1_0000,
            parcel: 0x9002,
            ..Default::default()
        };
        let frame = raw.capture();
        assert_eq!(frame.fault_addr(), 0x9002);
        assert_eq!(arch::breakpoint_advance(&frame), 2);
    }
}
