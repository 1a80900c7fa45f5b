//! x86_64 Trap Encoding
//!
//! # Vector Layout
//! - 0..=31: CPU exceptions (9, 15, 22..=27 and 31 are reserved)
//! - 32..=255: hardware interrupts (IRQ = vector - 32)
//! - 0x80: legacy `int 0x80` system call gate, DPL 3
//!
//! The `syscall` instruction does not go through the IDT. Its entry stub
//! builds the same raw frame with vector 0x80 and error code
//! [`SYSCALL_INSTRUCTION_TAG`], so both conventions meet in one dispatch path
//! and are told apart only by the register ABI.
//!
//! # Raw Frame
//! Each IDT stub pushes a zero error code where the CPU does not, then the
//! vector number, and jumps to the common trampoline. The trampoline pushes
//! all GPRs and CR2 so that the stack matches [`X86TrapFrame`].

use bitflags::bitflags;
use log::debug;
use spin::Once;

use super::{ExceptionKind, SyscallAbi, TrapCause, VectorInfo};
use crate::frame::{Dirty, TrapFrame};
use crate::mm::{AccessKind, VirtAddr};
use crate::privilege::PrivilegeLevel;
use crate::vector::{TrapClass, VectorTable, VectorTableEntry};

/// Saved general-purpose registers: rax, rbx, rcx, rdx, rsi, rdi, rbp, r8..r15.
pub const GPR_COUNT: usize = 15;
/// IDT size.
pub const VECTOR_COUNT: usize = 256;
/// Distance between generated IDT stubs.
pub const STUB_STRIDE: usize = 16;
/// First hardware interrupt vector.
pub const IRQ_BASE: usize = 32;
/// Legacy system call gate.
pub const SYSCALL_VECTOR: usize = 0x80;
/// Error-code tag set by the `syscall` instruction entry stub.
pub const SYSCALL_INSTRUCTION_TAG: u64 = 1;

/// Normalized index of rax.
pub const REG_RAX: usize = 0;
const REG_RBX: usize = 1;
const REG_RCX: usize = 2;
const REG_RDX: usize = 3;
const REG_RSI: usize = 4;
const REG_RDI: usize = 5;
const REG_RBP: usize = 6;
const REG_R8: usize = 7;
const REG_R9: usize = 8;
const REG_R10: usize = 9;

/// Kernel code selector.
pub const KERNEL_CS: u64 = 0x08;
/// Kernel data selector.
pub const KERNEL_SS: u64 = 0x10;
/// User data selector (RPL 3), laid out for `sysret`.
pub const USER_SS: u64 = 0x1B;
/// User code selector (RPL 3), laid out for `sysret`.
pub const USER_CS: u64 = 0x23;

/// Exception vectors with a defined meaning.
#[allow(missing_docs)]
pub mod vectors {
    pub const DIVIDE_ERROR: usize = 0;
    pub const DEBUG: usize = 1;
    pub const NMI: usize = 2;
    pub const BREAKPOINT: usize = 3;
    pub const OVERFLOW: usize = 4;
    pub const BOUND_RANGE: usize = 5;
    pub const INVALID_OPCODE: usize = 6;
    pub const DEVICE_NOT_AVAILABLE: usize = 7;
    pub const DOUBLE_FAULT: usize = 8;
    pub const INVALID_TSS: usize = 10;
    pub const SEGMENT_NOT_PRESENT: usize = 11;
    pub const STACK_SEGMENT: usize = 12;
    pub const GENERAL_PROTECTION: usize = 13;
    pub const PAGE_FAULT: usize = 14;
    pub const X87_FLOATING_POINT: usize = 16;
    pub const ALIGNMENT_CHECK: usize = 17;
    pub const MACHINE_CHECK: usize = 18;
    pub const SIMD_FLOATING_POINT: usize = 19;
    pub const VIRTUALIZATION: usize = 20;
    pub const CONTROL_PROTECTION: usize = 21;
    pub const HYPERVISOR_INJECTION: usize = 28;
    pub const VMM_COMMUNICATION: usize = 29;
    pub const SECURITY: usize = 30;
}

/// `syscall` convention: rax; rdi, rsi, rdx, r10, r8, r9.
///
/// The CPU saves the address of the next instruction, so no PC adjustment.
pub const SYSCALL_ABI: SyscallAbi = SyscallAbi {
    number: REG_RAX,
    args: [REG_RDI, REG_RSI, REG_RDX, REG_R10, REG_R8, REG_R9],
    ret: REG_RAX,
    pc_advance: 0,
};

/// Legacy `int 0x80` convention: rax; rbx, rcx, rdx, rsi, rdi, rbp.
pub const INT80_ABI: SyscallAbi = SyscallAbi {
    number: REG_RAX,
    args: [REG_RBX, REG_RCX, REG_RDX, REG_RSI, REG_RDI, REG_RBP],
    ret: REG_RAX,
    pc_advance: 0,
};

bitflags! {
    /// Page fault error code pushed by the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultErrorCode: u64 {
        /// Protection violation (clear: page not present)
        const PROTECTION_VIOLATION = 1 << 0;
        /// Caused by a write
        const CAUSED_BY_WRITE = 1 << 1;
        /// Raised while CPL was 3
        const USER_MODE = 1 << 2;
        /// Reserved bit set in a paging structure
        const MALFORMED_TABLE = 1 << 3;
        /// Caused by an instruction fetch
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

bitflags! {
    /// RFLAGS bits the dispatch core cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RFlags: u64 {
        /// Always-one reserved bit
        const RESERVED_1 = 1 << 1;
        /// Single-step trap
        const TRAP = 1 << 8;
        /// Interrupt enable
        const INTERRUPT = 1 << 9;
        /// String operations count down
        const DIRECTION = 1 << 10;
    }
}

/// Flags cleared by `syscall` until the entry stub is on the kernel stack.
pub const SYSCALL_MASKED_FLAGS: RFlags = RFlags::TRAP
    .union(RFlags::INTERRUPT)
    .union(RFlags::DIRECTION);

/// STAR selector bases: `sysret` loads SS from base + 8 and CS from
/// base + 16, `syscall` loads CS from its base and SS from base + 8.
pub const fn star_bases() -> (u16, u16) {
    ((USER_SS - 8) as u16, KERNEL_CS as u16)
}

/// Register state as laid out on the stack by the trampoline.
///
/// Field order must match the push order in `trap.S`.
#[allow(missing_docs)]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86TrapFrame {
    pub cr2: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl X86TrapFrame {
    fn gprs(&self) -> [u64; GPR_COUNT] {
        [
            self.rax, self.rbx, self.rcx, self.rdx, self.rsi, self.rdi, self.rbp, self.r8,
            self.r9, self.r10, self.r11, self.r12, self.r13, self.r14, self.r15,
        ]
    }

    fn set_gprs(&mut self, gprs: &[u64]) {
        let [rax, rbx, rcx, rdx, rsi, rdi, rbp, r8, r9, r10, r11, r12, r13, r14, r15] = gprs else {
            return;
        };
        self.rax = *rax;
        self.rbx = *rbx;
        self.rcx = *rcx;
        self.rdx = *rdx;
        self.rsi = *rsi;
        self.rdi = *rdi;
        self.rbp = *rbp;
        self.r8 = *r8;
        self.r9 = *r9;
        self.r10 = *r10;
        self.r11 = *r11;
        self.r12 = *r12;
        self.r13 = *r13;
        self.r14 = *r14;
        self.r15 = *r15;
    }

    /// Privilege level the trap was taken from.
    #[inline]
    pub fn privilege(&self) -> PrivilegeLevel {
        PrivilegeLevel::from_x86_cpl((self.cs & 0b11) as u8)
    }

    /// Build the generic view.
    pub fn capture(&self) -> TrapFrame {
        TrapFrame::from_raw(
            super::Arch::X86_64,
            &self.gprs(),
            self.rip,
            self.rsp,
            self.rflags,
            self.privilege(),
            self.vector as usize,
            self.error_code,
            self.cr2,
        )
    }

    /// Write back whatever the dispatch core changed.
    pub fn restore(&mut self, frame: &TrapFrame) {
        let dirty = frame.dirty();

        if dirty.contains(Dirty::CONTEXT) {
            self.set_gprs(frame.gprs());
            self.rip = frame.pc();
            self.rsp = frame.sp();
            self.rflags = frame.status() | RFlags::RESERVED_1.bits();
            let (cs, ss) = match frame.privilege() {
                PrivilegeLevel::User => (USER_CS, USER_SS),
                _ => (KERNEL_CS, KERNEL_SS),
            };
            self.cs = cs;
            self.ss = ss;
            return;
        }

        if dirty.contains(Dirty::RETURN_VALUE) {
            self.rax = frame.gpr(REG_RAX);
        }
        if dirty.contains(Dirty::PC) {
            self.rip = frame.pc();
        }
    }
}

/// Static description of IDT slot `v`.
pub fn vector_info(v: usize) -> VectorInfo {
    use vectors::*;

    match v {
        BREAKPOINT | OVERFLOW => VectorInfo::assigned(TrapClass::Exception, PrivilegeLevel::User),
        9 | 15 | 22..=27 | 31 => VectorInfo::unassigned(),
        0..=31 => VectorInfo::assigned(TrapClass::Exception, PrivilegeLevel::Kernel),
        SYSCALL_VECTOR => VectorInfo::assigned(TrapClass::SoftwareTrap, PrivilegeLevel::User),
        IRQ_BASE..=255 => VectorInfo::assigned(TrapClass::HardwareIrq, PrivilegeLevel::Kernel),
        _ => VectorInfo::unassigned(),
    }
}

/// Decode an assigned x86_64 trap.
pub fn decode(frame: &TrapFrame, entry: &VectorTableEntry) -> TrapCause {
    match entry.class {
        TrapClass::HardwareIrq => TrapCause::Irq,
        TrapClass::SoftwareTrap => {
            if frame.syndrome() == SYSCALL_INSTRUCTION_TAG {
                TrapCause::Syscall(SYSCALL_ABI)
            } else {
                TrapCause::Syscall(INT80_ABI)
            }
        }
        TrapClass::Exception => TrapCause::Exception(decode_exception(frame)),
    }
}

fn decode_exception(frame: &TrapFrame) -> ExceptionKind {
    use vectors::*;

    match frame.vector() {
        DIVIDE_ERROR => ExceptionKind::DivideByZero,
        DEBUG => ExceptionKind::Debug,
        BREAKPOINT => ExceptionKind::Breakpoint,
        INVALID_OPCODE => ExceptionKind::IllegalInstruction,
        DEVICE_NOT_AVAILABLE | X87_FLOATING_POINT | SIMD_FLOATING_POINT => {
            ExceptionKind::FloatingPoint
        }
        DOUBLE_FAULT => ExceptionKind::DoubleFault,
        INVALID_TSS | SEGMENT_NOT_PRESENT | STACK_SEGMENT | GENERAL_PROTECTION
        | CONTROL_PROTECTION => ExceptionKind::GeneralProtection,
        PAGE_FAULT => {
            let code = PageFaultErrorCode::from_bits_truncate(frame.syndrome());
            let access = if code.contains(PageFaultErrorCode::INSTRUCTION_FETCH) {
                AccessKind::Execute
            } else if code.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
                AccessKind::Write
            } else {
                AccessKind::Read
            };
            ExceptionKind::PageFault {
                addr: VirtAddr::new(frame.fault_addr() as usize),
                access,
            }
        }
        ALIGNMENT_CHECK => ExceptionKind::Alignment,
        MACHINE_CHECK => ExceptionKind::MachineCheck,
        v => ExceptionKind::Other(v as u64),
    }
}

bitflags! {
    /// Type and attribute byte of an IDT gate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GateAttributes: u8 {
        /// 64-bit interrupt gate (clears IF on entry)
        const INTERRUPT_GATE = 0x0E;
        /// DPL bit 0
        const DPL_LOW = 1 << 5;
        /// DPL bit 1
        const DPL_HIGH = 1 << 6;
        /// Present
        const PRESENT = 1 << 7;
    }
}

impl GateAttributes {
    /// Present interrupt gate with the given DPL.
    pub fn interrupt_gate(dpl: u8) -> Self {
        let dpl = Self::from_bits_truncate((dpl & 0b11) << 5);
        Self::PRESENT | Self::INTERRUPT_GATE | dpl
    }

    /// Descriptor privilege level.
    pub fn dpl(self) -> u8 {
        (self.bits() >> 5) & 0b11
    }
}

/// One 16-byte IDT gate descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    attributes: u8,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl IdtEntry {
    /// Encode a present interrupt gate.
    pub fn new(target: usize, selector: u16, dpl: u8) -> Self {
        let target = target as u64;
        Self {
            offset_low: target as u16,
            selector,
            ist: 0,
            attributes: GateAttributes::interrupt_gate(dpl).bits(),
            offset_mid: (target >> 16) as u16,
            offset_high: (target >> 32) as u32,
            reserved: 0,
        }
    }

    /// Handler address.
    pub fn target(&self) -> usize {
        (self.offset_low as u64 | (self.offset_mid as u64) << 16 | (self.offset_high as u64) << 32)
            as usize
    }

    /// Gate attributes.
    pub fn attributes(&self) -> GateAttributes {
        GateAttributes::from_bits_truncate(self.attributes)
    }

    /// Code segment selector.
    pub fn selector(&self) -> u16 {
        self.selector
    }
}

/// The interrupt descriptor table.
#[repr(C, align(16))]
pub struct Idt(pub [IdtEntry; VECTOR_COUNT]);

/// Encode every table slot as a present interrupt gate.
///
/// Unassigned vectors get a gate too; their stub leads to the default fault
/// handler.
pub fn encode_idt(table: &VectorTable) -> Idt {
    let mut idt = Idt([IdtEntry::default(); VECTOR_COUNT]);
    for entry in table.entries() {
        idt.0[entry.vector] = IdtEntry::new(
            entry.target,
            KERNEL_CS as u16,
            entry.min_privilege.x86_dpl(),
        );
    }
    idt
}

static IDT: Once<Idt> = Once::new();

/// Encode the IDT once and load it into IDTR.
pub fn install(table: &VectorTable) {
    let idt = IDT.call_once(|| encode_idt(table));
    debug!(
        "x86_64: IDT at {:p}, {} gates",
        idt as *const Idt,
        VECTOR_COUNT
    );

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: the IDT lives in a static that is never freed or moved, and
    // every gate points into the stub block of trap.S.
    unsafe {
        load_idt(idt);
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
unsafe fn load_idt(idt: &'static Idt) {
    use ::x86_64::instructions::tables::lidt;
    use ::x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
    use ::x86_64::registers::rflags::RFlags as CpuFlags;
    use ::x86_64::structures::DescriptorTablePointer;

    let pointer = DescriptorTablePointer {
        limit: (core::mem::size_of::<Idt>() - 1) as u16,
        base: ::x86_64::VirtAddr::new(idt as *const Idt as u64),
    };

    extern "C" {
        fn x86_syscall_entry();
    }

    // SAFETY: caller guarantees the table outlives its use.
    unsafe { lidt(&pointer) };

    let (sysret, syscall) = star_bases();
    // SAFETY: the selectors match the GDT layout the boot code loads, and
    // SFMASK keeps interrupts off until the entry stub has switched stacks.
    unsafe {
        Star::write_raw(sysret, syscall);
        SFMask::write(CpuFlags::from_bits_truncate(SYSCALL_MASKED_FLAGS.bits()));
        LStar::write(::x86_64::VirtAddr::new(x86_syscall_entry as usize as u64));
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
core::arch::global_asm!(include_str!("trap.S"));

/// Address of the first generated IDT stub.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn trampoline_base() -> usize {
    extern "C" {
        static x86_trap_stubs: u8;
    }
    // SAFETY: only the address of the symbol is taken.
    unsafe { core::ptr::addr_of!(x86_trap_stubs) as usize }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[no_mangle]
extern "C" fn x86_trap_entry(raw: &mut X86TrapFrame) {
    let mut frame = raw.capture();
    crate::dispatch::enter(&mut frame);
    raw.restore(&frame);
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
static CPU_INDICES: crate::dispatch::CpuIndexMap = crate::dispatch::CpuIndexMap::new();

/// CPU operations on real hardware.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub struct HardwareCpu;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
impl crate::dispatch::CpuOps for HardwareCpu {
    fn cpu_id(&self) -> usize {
        // SAFETY: CPUID leaf 1 exists on every x86_64 CPU.
        let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
        let apic_id = u64::from(leaf.ebx >> 24);
        CPU_INDICES
            .index_of(apic_id)
            .unwrap_or(crate::dispatch::MAX_CPUS)
    }

    fn enable_interrupts(&self) {
        ::x86_64::instructions::interrupts::enable();
    }

    fn disable_interrupts(&self) {
        ::x86_64::instructions::interrupts::disable();
    }

    fn cycles(&self) -> u64 {
        // SAFETY: RDTSC has no side effects.
        unsafe { core::arch::x86_64::_rdtsc() }
    }
}
