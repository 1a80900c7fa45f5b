//! Interrupt Controller Abstraction
//!
//! One trait over the four controller families the kernel runs on:
//!
//! | Family      | Arch    | Identify            | Ack          | EOI            |
//! |-------------|---------|---------------------|--------------|----------------|
//! | 8259 PIC    | x86_64  | vector - 32         | (INTA cycle) | OCW2 to 1 or 2 |
//! | APIC        | x86_64  | vector - 32         | (automatic)  | LAPIC EOI      |
//! | GICv2 / v3  | AArch64 | HPPIR peek, IAR     | IAR read     | EOIR           |
//! | CLINT/PLIC  | RISC-V  | scause, PLIC claim  | claim / SSIP | PLIC complete  |
//!
//! Drivers only touch the registers needed for mask, unmask, acknowledge,
//! EOI and priority. Everything else (bring-up, routing, affinity) belongs
//! to platform code.
//!
//! Register access goes through [`RegisterIo`], so every controller can be
//! driven against plain memory in tests.

use core::fmt;

pub mod ack;
pub mod apic;
pub mod gic;
pub mod pic;
pub mod plic;
pub mod registry;

pub use ack::AckGuard;
pub use registry::{
    DriverId, HandlerRegistry, InterruptHandler, InterruptHandlerEntry, RegistrationHandle,
    RegistryError,
};

/// Size of the handler arena: 1024 controller lines plus 16 CPU-local lines.
pub const MAX_IRQS: usize = 1040;

/// Controller-level interrupt line number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrqNumber(pub u32);

impl IrqNumber {
    /// Wrap a raw line number.
    #[inline]
    pub const fn new(irq: u32) -> Self {
        Self(irq)
    }

    /// Line number as an arena index.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for IrqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IRQ{}", self.0)
    }
}

/// How a line signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Latched on a transition; acknowledged after the handler
    Edge,
    /// Asserted while the device needs service; acknowledged before the handler
    Level,
}

/// Errors reported by controller drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerError {
    /// The controller has no per-line priorities
    PriorityUnsupported,
    /// The line does not exist on this controller
    InvalidIrq(IrqNumber),
    /// Priority outside the controller's range
    InvalidPriority(u8),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PriorityUnsupported => write!(f, "per-line priority not supported"),
            Self::InvalidIrq(irq) => write!(f, "{} does not exist on this controller", irq),
            Self::InvalidPriority(level) => write!(f, "priority {} out of range", level),
        }
    }
}

/// Uniform interface over the platform interrupt controller.
pub trait InterruptController: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Signalling mode of a line.
    fn trigger_mode(&self, irq: IrqNumber) -> TriggerMode;

    /// Identify the line behind a hardware IRQ vector.
    ///
    /// `None` means the interrupt was spurious and needs no EOI.
    fn pending(&self, vector: usize) -> Option<IrqNumber>;

    /// Stop the line from being delivered.
    fn mask(&self, irq: IrqNumber);

    /// Allow the line to be delivered.
    fn unmask(&self, irq: IrqNumber);

    /// Acknowledge the interrupt at the device side of the controller.
    fn acknowledge(&self, irq: IrqNumber);

    /// Signal end of interrupt.
    fn end_of_interrupt(&self, irq: IrqNumber);

    /// Set the delivery priority of a line.
    fn set_priority(&self, irq: IrqNumber, level: u8) -> Result<(), ControllerError>;
}

/// Access to a block of controller registers.
///
/// Offsets are relative to the block (bytes for MMIO, port numbers for x86
/// port I/O).
pub trait RegisterIo: Send + Sync {
    /// Read a 32-bit register.
    fn read32(&self, offset: usize) -> u32;

    /// Write a 32-bit register.
    fn write32(&self, offset: usize, value: u32);

    /// Read an 8-bit register.
    fn read8(&self, offset: usize) -> u8 {
        let shift = (offset & 3) * 8;
        (self.read32(offset & !3) >> shift) as u8
    }

    /// Write an 8-bit register.
    fn write8(&self, offset: usize, value: u8) {
        let shift = (offset & 3) * 8;
        let word = self.read32(offset & !3) & !(0xFF << shift);
        self.write32(offset & !3, word | (value as u32) << shift);
    }
}

/// Memory-mapped register block.
#[derive(Debug)]
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// Create a register block at `base`.
    ///
    /// # Safety
    /// `base` must be the virtual address of a mapped device register block
    /// that is not accessed through any other path, and it must stay mapped
    /// for as long as the returned value is used.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    /// Base address of the block.
    pub const fn base(&self) -> usize {
        self.base
    }
}

// SAFETY: device registers are accessed with single volatile operations.
unsafe impl Send for Mmio {}
// SAFETY: same as above.
unsafe impl Sync for Mmio {}

impl RegisterIo for Mmio {
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: `new` requires a mapped register block.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: `new` requires a mapped register block.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    fn read8(&self, offset: usize) -> u8 {
        // SAFETY: `new` requires a mapped register block.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u8) }
    }

    fn write8(&self, offset: usize, value: u8) {
        // SAFETY: `new` requires a mapped register block.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u8, value) }
    }
}

/// x86 I/O port block.
#[cfg(target_arch = "x86_64")]
#[derive(Debug)]
pub struct PortIo {
    base: u16,
}

#[cfg(target_arch = "x86_64")]
impl PortIo {
    /// Create a port block starting at port `base`.
    ///
    /// # Safety
    /// The ports must belong to the device this block is handed to and must
    /// not be driven from anywhere else.
    pub const unsafe fn new(base: u16) -> Self {
        Self { base }
    }

    fn port(&self, offset: usize) -> u16 {
        self.base.wrapping_add(offset as u16)
    }
}

#[cfg(target_arch = "x86_64")]
impl RegisterIo for PortIo {
    fn read32(&self, offset: usize) -> u32 {
        let mut port = ::x86_64::instructions::port::Port::<u32>::new(self.port(offset));
        // SAFETY: `new` requires exclusive ownership of the ports.
        unsafe { port.read() }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut port = ::x86_64::instructions::port::Port::<u32>::new(self.port(offset));
        // SAFETY: `new` requires exclusive ownership of the ports.
        unsafe { port.write(value) }
    }

    fn read8(&self, offset: usize) -> u8 {
        let mut port = ::x86_64::instructions::port::Port::<u8>::new(self.port(offset));
        // SAFETY: `new` requires exclusive ownership of the ports.
        unsafe { port.read() }
    }

    fn write8(&self, offset: usize, value: u8) {
        let mut port = ::x86_64::instructions::port::Port::<u8>::new(self.port(offset));
        // SAFETY: `new` requires exclusive ownership of the ports.
        unsafe { port.write(value) }
    }
}
