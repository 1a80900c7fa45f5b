//! Local APIC + I/O APIC
//!
//! External lines are routed by the I/O APIC redirection table to vectors
//! `IRQ_BASE + line`. The local APIC only takes part at EOI time.
//!
//! The I/O APIC is accessed indirectly: the register index goes to IOREGSEL,
//! the data through IOWIN. The select/window pair is serialized by a lock so
//! that two CPUs masking lines cannot interleave. Dispatch masks lines from
//! interrupt context, so the lock is only held with local interrupts off.

use spin::Mutex;

use super::{ControllerError, InterruptController, IrqNumber, RegisterIo, TriggerMode};
use crate::arch::without_interrupts;

/// Vector of redirection entry 0.
pub const IRQ_BASE: usize = 32;
/// Vector programmed as the local APIC spurious vector.
pub const SPURIOUS_VECTOR: usize = 0xFF;
/// Redirection entries on a standard I/O APIC.
pub const IOAPIC_LINES: u32 = 24;

/// Local APIC register offsets.
pub mod lapic {
    /// End of interrupt
    pub const EOI: usize = 0xB0;
}

/// I/O APIC register offsets and indices.
pub mod ioapic {
    /// Register select
    pub const IOREGSEL: usize = 0x00;
    /// Data window
    pub const IOWIN: usize = 0x10;
    /// Index of the low half of redirection entry 0
    pub const REDTBL_BASE: u32 = 0x10;
    /// Redirection entry: masked
    pub const MASKED: u32 = 1 << 16;
    /// Redirection entry: level triggered
    pub const LEVEL: u32 = 1 << 15;
}

/// APIC interrupt controller.
pub struct Apic<L, I> {
    lapic: L,
    ioapic: Mutex<I>,
}

impl<L: RegisterIo, I: RegisterIo> Apic<L, I> {
    /// Driver over the local APIC and I/O APIC register blocks.
    pub const fn new(lapic: L, ioapic: I) -> Self {
        Self {
            lapic,
            ioapic: Mutex::new(ioapic),
        }
    }

    fn redirection_index(irq: IrqNumber) -> u32 {
        ioapic::REDTBL_BASE + 2 * irq.0
    }

    fn read_redirection(&self, irq: IrqNumber) -> u32 {
        without_interrupts(|| {
            let io = self.ioapic.lock();
            io.write32(ioapic::IOREGSEL, Self::redirection_index(irq));
            io.read32(ioapic::IOWIN)
        })
    }

    fn update_redirection(&self, irq: IrqNumber, f: impl FnOnce(u32) -> u32) {
        without_interrupts(|| {
            let io = self.ioapic.lock();
            io.write32(ioapic::IOREGSEL, Self::redirection_index(irq));
            let entry = io.read32(ioapic::IOWIN);
            io.write32(ioapic::IOWIN, f(entry));
        })
    }
}

impl<L: RegisterIo, I: RegisterIo> InterruptController for Apic<L, I> {
    fn name(&self) -> &'static str {
        "apic"
    }

    fn trigger_mode(&self, irq: IrqNumber) -> TriggerMode {
        if irq.0 >= IOAPIC_LINES {
            return TriggerMode::Edge;
        }
        if self.read_redirection(irq) & ioapic::LEVEL != 0 {
            TriggerMode::Level
        } else {
            TriggerMode::Edge
        }
    }

    fn pending(&self, vector: usize) -> Option<IrqNumber> {
        if vector == SPURIOUS_VECTOR {
            return None;
        }
        vector
            .checked_sub(IRQ_BASE)
            .map(|irq| IrqNumber(irq as u32))
    }

    fn mask(&self, irq: IrqNumber) {
        if irq.0 < IOAPIC_LINES {
            self.update_redirection(irq, |entry| entry | ioapic::MASKED);
        }
    }

    fn unmask(&self, irq: IrqNumber) {
        if irq.0 < IOAPIC_LINES {
            self.update_redirection(irq, |entry| entry & !ioapic::MASKED);
        }
    }

    fn acknowledge(&self, _irq: IrqNumber) {
        // delivery to the local APIC is the acknowledgment
    }

    fn end_of_interrupt(&self, _irq: IrqNumber) {
        self.lapic.write32(lapic::EOI, 0);
    }

    fn set_priority(&self, _irq: IrqNumber, _level: u8) -> Result<(), ControllerError> {
        // priority is the vector number's upper nibble, fixed by routing
        Err(ControllerError::PriorityUnsupported)
    }
}
