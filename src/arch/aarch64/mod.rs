//! AArch64 Trap Encoding
//!
//! # Exception Levels
//! - EL0: User applications
//! - EL1: Kernel (where we run)
//! - EL2/EL3: Hypervisor / secure monitor
//!
//! # Vector Table
//! 16 entries of 0x80 bytes behind VBAR_EL1, in four groups of
//! Sync / IRQ / FIQ / SError:
//! - Current EL with SP_EL0 (unassigned, the kernel never runs on SP_EL0)
//! - Current EL with SP_ELx (kernel)
//! - Lower EL, AArch64 (user)
//! - Lower EL, AArch32 (unassigned, no 32-bit user support)
//!
//! Sync entries are exceptions until the ESR says otherwise; an SVC is
//! refined into a system call here.

use log::{debug, error};

use super::{ExceptionKind, SyscallAbi, TrapCause, VectorInfo};
use crate::frame::{Dirty, TrapFrame};
use crate::mm::{AccessKind, VirtAddr};
use crate::privilege::PrivilegeLevel;
use crate::vector::{TrapClass, VectorTable, VectorTableEntry};

/// Saved general-purpose registers x0..x30.
pub const GPR_COUNT: usize = 31;
/// Entries in the VBAR_EL1 table.
pub const VECTOR_COUNT: usize = 16;
/// Distance between vector entries.
pub const VECTOR_STRIDE: usize = 0x80;
/// Required alignment of the table base.
pub const TABLE_ALIGN: usize = 0x800;

/// Vector of the synchronous entry for lower-EL AArch64.
pub const LOWER_EL_SYNC: usize = 8;
/// Vector of the IRQ entry for lower-EL AArch64.
pub const LOWER_EL_IRQ: usize = 9;
/// Vector of the synchronous entry for current EL with SP_ELx.
pub const CURRENT_EL_SYNC: usize = 4;
/// Vector of the IRQ entry for current EL with SP_ELx.
pub const CURRENT_EL_IRQ: usize = 5;

/// `svc #0` convention: x8; x0..x5; return x0. ELR already points past the SVC.
pub const SVC_ABI: SyscallAbi = SyscallAbi {
    number: 8,
    args: [0, 1, 2, 3, 4, 5],
    ret: 0,
    pc_advance: 0,
};

/// Position of an entry within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionType {
    /// Synchronous exception
    Sync,
    /// IRQ interrupt
    Irq,
    /// FIQ interrupt
    Fiq,
    /// System error
    SError,
}

impl ExceptionType {
    /// Type of vector table entry `v`.
    pub const fn of_vector(v: usize) -> Self {
        match v % 4 {
            0 => Self::Sync,
            1 => Self::Irq,
            2 => Self::Fiq,
            _ => Self::SError,
        }
    }
}

/// Exception class extracted from ESR_EL1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionClass {
    /// Unknown reason (undefined instruction)
    Unknown = 0x00,
    /// Trapped WFI/WFE
    WfiWfe = 0x01,
    /// Illegal execution state
    IllegalExecution = 0x0E,
    /// SVC from AArch64
    SvcAarch64 = 0x15,
    /// Instruction abort from a lower EL
    InstructionAbortLowerEl = 0x20,
    /// Instruction abort from the same EL
    InstructionAbortSameEl = 0x21,
    /// PC alignment fault
    PcAlignment = 0x22,
    /// Data abort from a lower EL
    DataAbortLowerEl = 0x24,
    /// Data abort from the same EL
    DataAbortSameEl = 0x25,
    /// SP alignment fault
    SpAlignment = 0x26,
    /// Trapped floating-point exception
    FpException = 0x2C,
    /// SError interrupt
    SError = 0x2F,
    /// Hardware breakpoint from a lower EL
    BreakpointLowerEl = 0x30,
    /// Hardware breakpoint from the same EL
    BreakpointSameEl = 0x31,
    /// Software step from a lower EL
    SoftwareStepLowerEl = 0x32,
    /// Software step from the same EL
    SoftwareStepSameEl = 0x33,
    /// Watchpoint from a lower EL
    WatchpointLowerEl = 0x34,
    /// Watchpoint from the same EL
    WatchpointSameEl = 0x35,
    /// BRK instruction
    Brk = 0x3C,
    /// Anything else
    Other = 0xFF,
}

impl From<u64> for ExceptionClass {
    fn from(esr: u64) -> Self {
        let ec = ((esr >> 26) & 0x3F) as u8;
        match ec {
            0x00 => ExceptionClass::Unknown,
            0x01 => ExceptionClass::WfiWfe,
            0x0E => ExceptionClass::IllegalExecution,
            0x15 => ExceptionClass::SvcAarch64,
            0x20 => ExceptionClass::InstructionAbortLowerEl,
            0x21 => ExceptionClass::InstructionAbortSameEl,
            0x22 => ExceptionClass::PcAlignment,
            0x24 => ExceptionClass::DataAbortLowerEl,
            0x25 => ExceptionClass::DataAbortSameEl,
            0x26 => ExceptionClass::SpAlignment,
            0x2C => ExceptionClass::FpException,
            0x2F => ExceptionClass::SError,
            0x30 => ExceptionClass::BreakpointLowerEl,
            0x31 => ExceptionClass::BreakpointSameEl,
            0x32 => ExceptionClass::SoftwareStepLowerEl,
            0x33 => ExceptionClass::SoftwareStepSameEl,
            0x34 => ExceptionClass::WatchpointLowerEl,
            0x35 => ExceptionClass::WatchpointSameEl,
            0x3C => ExceptionClass::Brk,
            _ => ExceptionClass::Other,
        }
    }
}

/// ESR_EL1 ISS fields for aborts.
mod iss {
    /// Fault status code mask (DFSC / IFSC)
    pub const FSC_MASK: u64 = 0x3F;
    /// Write not Read
    pub const WNR: u64 = 1 << 6;
    /// Alignment fault status code
    pub const FSC_ALIGNMENT: u64 = 0b10_0001;
    /// Synchronous external abort, not on translation table walk
    pub const FSC_EXTERNAL: u64 = 0b01_0000;
}

/// SPSR_EL1 M[3:2]: exception level the trap was taken from.
const SPSR_EL_SHIFT: u64 = 2;

/// Exception context saved on the stack.
///
/// Field order must match the store order in `trap.S`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aarch64TrapFrame {
    /// General purpose registers x0-x30
    pub gpr: [u64; 31],
    /// SP_EL0 at the time of the trap
    pub sp: u64,
    /// Exception Link Register (return address)
    pub elr: u64,
    /// Saved Program Status Register
    pub spsr: u64,
    /// Exception Syndrome Register
    pub esr: u64,
    /// Fault Address Register
    pub far: u64,
    /// Vector table entry that was taken
    pub vector: u64,
    _pad: u64,
}

impl Default for Aarch64TrapFrame {
    fn default() -> Self {
        Self {
            gpr: [0; 31],
            sp: 0,
            elr: 0,
            spsr: 0,
            esr: 0,
            far: 0,
            vector: 0,
            _pad: 0,
        }
    }
}

impl Aarch64TrapFrame {
    /// Get the exception class from ESR
    #[inline]
    pub fn exception_class(&self) -> ExceptionClass {
        ExceptionClass::from(self.esr)
    }

    /// Privilege level the trap was taken from.
    #[inline]
    pub fn privilege(&self) -> PrivilegeLevel {
        PrivilegeLevel::from_arm_el(((self.spsr >> SPSR_EL_SHIFT) & 0b11) as u8)
    }

    /// Build the generic view.
    pub fn capture(&self) -> TrapFrame {
        TrapFrame::from_raw(
            super::Arch::Aarch64,
            &self.gpr,
            self.elr,
            self.sp,
            self.spsr,
            self.privilege(),
            self.vector as usize,
            self.esr,
            self.far,
        )
    }

    /// Write back whatever the dispatch core changed.
    pub fn restore(&mut self, frame: &TrapFrame) {
        let dirty = frame.dirty();

        if dirty.contains(Dirty::CONTEXT) {
            self.gpr.copy_from_slice(frame.gprs());
            self.elr = frame.pc();
            self.sp = frame.sp();
            let el = match frame.privilege() {
                PrivilegeLevel::User => 0,
                _ => 1,
            };
            self.spsr = (frame.status() & !(0b11 << SPSR_EL_SHIFT)) | (el << SPSR_EL_SHIFT);
            return;
        }

        if dirty.contains(Dirty::RETURN_VALUE) {
            self.gpr[0] = frame.gpr(0);
        }
        if dirty.contains(Dirty::PC) {
            self.elr = frame.pc();
        }
    }
}

/// Static description of VBAR slot `v`.
pub fn vector_info(v: usize) -> VectorInfo {
    let group = v / 4;
    let min_privilege = match group {
        1 => PrivilegeLevel::Kernel,
        2 => PrivilegeLevel::User,
        _ => return VectorInfo::unassigned(),
    };

    match ExceptionType::of_vector(v) {
        ExceptionType::Sync => VectorInfo::assigned(TrapClass::Exception, min_privilege),
        ExceptionType::Irq | ExceptionType::Fiq => {
            VectorInfo::assigned(TrapClass::HardwareIrq, PrivilegeLevel::Kernel)
        }
        ExceptionType::SError => VectorInfo::assigned(TrapClass::Exception, PrivilegeLevel::Kernel),
    }
}

/// Decode an assigned AArch64 trap.
pub fn decode(frame: &TrapFrame, entry: &VectorTableEntry) -> TrapCause {
    match ExceptionType::of_vector(entry.vector) {
        ExceptionType::Irq | ExceptionType::Fiq => TrapCause::Irq,
        ExceptionType::SError => TrapCause::Exception(ExceptionKind::MachineCheck),
        ExceptionType::Sync => decode_sync(frame),
    }
}

fn decode_sync(frame: &TrapFrame) -> TrapCause {
    let esr = frame.syndrome();
    let kind = match ExceptionClass::from(esr) {
        ExceptionClass::SvcAarch64 => return TrapCause::Syscall(SVC_ABI),
        ExceptionClass::Unknown | ExceptionClass::IllegalExecution => {
            ExceptionKind::IllegalInstruction
        }
        ExceptionClass::DataAbortLowerEl | ExceptionClass::DataAbortSameEl => {
            let access = if esr & iss::WNR != 0 {
                AccessKind::Write
            } else {
                AccessKind::Read
            };
            abort_kind(frame, access)
        }
        ExceptionClass::InstructionAbortLowerEl | ExceptionClass::InstructionAbortSameEl => {
            abort_kind(frame, AccessKind::Execute)
        }
        ExceptionClass::PcAlignment | ExceptionClass::SpAlignment => ExceptionKind::Alignment,
        ExceptionClass::FpException => ExceptionKind::FloatingPoint,
        ExceptionClass::SError => ExceptionKind::MachineCheck,
        ExceptionClass::Brk => ExceptionKind::Breakpoint,
        ExceptionClass::BreakpointLowerEl
        | ExceptionClass::BreakpointSameEl
        | ExceptionClass::SoftwareStepLowerEl
        | ExceptionClass::SoftwareStepSameEl
        | ExceptionClass::WatchpointLowerEl
        | ExceptionClass::WatchpointSameEl => ExceptionKind::Debug,
        ExceptionClass::WfiWfe | ExceptionClass::Other => ExceptionKind::Other(esr),
    };
    TrapCause::Exception(kind)
}

fn abort_kind(frame: &TrapFrame, access: AccessKind) -> ExceptionKind {
    let fsc = frame.syndrome() & iss::FSC_MASK;
    match fsc {
        // translation, access flag and permission faults, levels 0..=3
        0b00_0100..=0b00_1111 => ExceptionKind::PageFault {
            addr: VirtAddr::new(frame.fault_addr() as usize),
            access,
        },
        iss::FSC_ALIGNMENT => ExceptionKind::Alignment,
        iss::FSC_EXTERNAL => ExceptionKind::MachineCheck,
        _ => ExceptionKind::GeneralProtection,
    }
}

/// Point VBAR_EL1 at the table.
pub fn install(table: &VectorTable) {
    let base = table.base();
    if base % TABLE_ALIGN != 0 {
        error!("aarch64: vector base {:#x} is not 2 KiB aligned, not installed", base);
        return;
    }
    debug!("aarch64: VBAR_EL1 <- {:#x}", base);

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    // SAFETY: the base is the 2 KiB aligned table from trap.S and writing
    // VBAR_EL1 is valid at EL1.
    unsafe {
        core::arch::asm!(
            "msr vbar_el1, {v}",
            "isb",
            v = in(reg) base as u64,
            options(nostack, preserves_flags)
        );
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
core::arch::global_asm!(include_str!("trap.S"));

/// Address of the VBAR_EL1 table.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn trampoline_base() -> usize {
    extern "C" {
        static aarch64_trap_vectors: u8;
    }
    // SAFETY: only the address of the symbol is taken.
    unsafe { core::ptr::addr_of!(aarch64_trap_vectors) as usize }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
#[no_mangle]
extern "C" fn aarch64_trap_entry(raw: &mut Aarch64TrapFrame) {
    let mut frame = raw.capture();
    crate::dispatch::enter(&mut frame);
    raw.restore(&frame);
}

/// CPU operations on real hardware.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub struct HardwareCpu;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub(super) fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let daif: u64;
    // SAFETY: DAIF is readable at EL1 and masking IRQs is always allowed.
    unsafe {
        core::arch::asm!("mrs {}, daif", out(reg) daif, options(nostack));
        core::arch::asm!("msr daifset, #2", options(nostack));
    }
    let result = f();
    // SAFETY: puts back the mask read above.
    unsafe { core::arch::asm!("msr daif, {}", in(reg) daif, options(nostack)) };
    result
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
static CPU_INDICES: crate::dispatch::CpuIndexMap = crate::dispatch::CpuIndexMap::new();

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
impl crate::dispatch::CpuOps for HardwareCpu {
    fn cpu_id(&self) -> usize {
        let mpidr: u64;
        // SAFETY: MPIDR_EL1 is readable at EL1.
        unsafe { core::arch::asm!("mrs {}, mpidr_el1", out(reg) mpidr, options(nomem, nostack)) };
        // Aff3..Aff0
        let affinity = (mpidr & 0xFF_FFFF) | ((mpidr >> 8) & 0xFF00_0000);
        CPU_INDICES
            .index_of(affinity)
            .unwrap_or(crate::dispatch::MAX_CPUS)
    }

    fn enable_interrupts(&self) {
        // SAFETY: unmasking IRQs at EL1 once the table is installed.
        unsafe { core::arch::asm!("msr daifclr, #2", options(nomem, nostack)) };
    }

    fn disable_interrupts(&self) {
        // SAFETY: masking IRQs is always allowed at EL1.
        unsafe { core::arch::asm!("msr daifset, #2", options(nomem, nostack)) };
    }

    fn cycles(&self) -> u64 {
        let count: u64;
        // SAFETY: the virtual counter is readable at EL1.
        unsafe { core::arch::asm!("mrs {}, cntvct_el0", out(reg) count, options(nomem, nostack)) };
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{self, Arch};

    const ESR_SVC: u64 = 0x15 << 26;
    const ESR_DABT_LOWER: u64 = 0x24 << 26;

    fn user_frame(vector: usize, esr: u64) -> Aarch64TrapFrame {
        let mut raw = Aarch64TrapFrame {
            elr: 0x40_0100,
            sp: 0x7f_f000,
            spsr: 0x0,
            esr,
            vector: vector as u64,
            ..Default::default()
        };
        for (i, reg) in raw.gpr.iter_mut().enumerate() {
            *reg = 0x100 + i as u64;
        }
        raw
    }

    #[test]
    fn test_vector_groups() {
        assert!(!vector_info(0).assigned);
        assert!(!vector_info(13).assigned);
        assert_eq!(vector_info(LOWER_EL_SYNC).min_privilege, PrivilegeLevel::User);
        assert_eq!(vector_info(CURRENT_EL_IRQ).class, TrapClass::HardwareIrq);
    }

    #[test]
    fn test_svc_is_syscall() {
        let table = VectorTable::build(Arch::Aarch64, 0x4008_0800);
        let entry = table.lookup_vector(LOWER_EL_SYNC).unwrap();
        let raw = user_frame(LOWER_EL_SYNC, ESR_SVC);
        let frame = raw.capture();

        let TrapCause::Syscall(abi) = arch::decode(&frame, &entry) else {
            panic!("SVC not decoded as syscall");
        };
        assert_eq!(abi.number(&frame), 0x108);
        assert_eq!(abi.args(&frame), [0x100, 0x101, 0x102, 0x103, 0x104, 0x105]);
    }

    #[test]
    fn test_data_abort_is_page_fault() {
        let table = VectorTable::build(Arch::Aarch64, 0x4008_0800);
        let entry = table.lookup_vector(LOWER_EL_SYNC).unwrap();
        // level 3 translation fault on a write
        let mut raw = user_frame(LOWER_EL_SYNC, ESR_DABT_LOWER | iss::WNR | 0b00_0111);
        raw.far = 0x4000_2000;

        assert_eq!(
            arch::decode(&raw.capture(), &entry),
            TrapCause::Exception(ExceptionKind::PageFault {
                addr: VirtAddr::new(0x4000_2000),
                access: AccessKind::Write,
            })
        );
    }

    #[test]
    fn test_restore_writes_only_x0() {
        let raw = user_frame(LOWER_EL_SYNC, ESR_SVC);
        let mut frame = raw.capture();
        frame.set_return_value(7);

        let mut restored = raw;
        restored.restore(&frame);
        assert_eq!(restored.gpr[0], 7);
        assert_eq!(restored.gpr[1..], raw.gpr[1..]);
        assert_eq!(restored.elr, raw.elr);
        assert_eq!(restored.spsr, raw.spsr);
    }
}
