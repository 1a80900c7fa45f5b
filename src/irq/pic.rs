//! Legacy 8259 PIC pair
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐
//! │   PIC 1     │     │   PIC 2     │
//! │  (Master)   │◀────│  (Slave)    │
//! │ IRQ 0-7     │     │ IRQ 8-15    │
//! └─────────────┘     └─────────────┘
//!       │
//!       ▼
//!     CPU
//! ```
//!
//! Both chips are expected to be remapped by platform code so that IRQ 0-15
//! arrive on vectors `offset..offset + 16`. All lines are edge-triggered and
//! there is no per-line priority.
//!
//! IRQ 7 and IRQ 15 are raised spuriously when a line drops before the CPU
//! acknowledges it. They are recognised by an empty in-service bit; a
//! spurious IRQ 15 still needs an EOI on the master, which forwarded it.

use log::warn;

use super::{ControllerError, InterruptController, IrqNumber, RegisterIo, TriggerMode};

/// Default vector of IRQ 0 after remapping.
pub const PIC_OFFSET: usize = 32;
/// Lines served by the pair.
pub const PIC_LINES: u32 = 16;

/// I/O ports of the pair.
pub mod ports {
    /// Master command
    pub const MASTER_COMMAND: usize = 0x20;
    /// Master data (interrupt mask)
    pub const MASTER_DATA: usize = 0x21;
    /// Slave command
    pub const SLAVE_COMMAND: usize = 0xA0;
    /// Slave data (interrupt mask)
    pub const SLAVE_DATA: usize = 0xA1;
}

/// Non-specific end of interrupt (OCW2).
const CMD_EOI: u8 = 0x20;
/// Read the in-service register on the next command port read (OCW3).
const CMD_READ_ISR: u8 = 0x0B;
/// Master input the slave is cascaded on.
const CASCADE_IRQ: u32 = 2;

/// Chained master/slave 8259 pair.
pub struct Pic8259<R> {
    io: R,
    offset: usize,
}

impl<R: RegisterIo> Pic8259<R> {
    /// Driver for a pair remapped to vectors `offset..offset + 16`.
    ///
    /// `io` addresses the legacy ports with offsets equal to port numbers.
    pub const fn new(io: R, offset: usize) -> Self {
        Self { io, offset }
    }

    fn data_port(irq: u32) -> (usize, u8) {
        if irq < 8 {
            (ports::MASTER_DATA, irq as u8)
        } else {
            (ports::SLAVE_DATA, (irq - 8) as u8)
        }
    }

    fn in_service(&self, command: usize, bit: u8) -> bool {
        self.io.write8(command, CMD_READ_ISR);
        self.io.read8(command) & (1 << bit) != 0
    }
}

impl<R: RegisterIo> InterruptController for Pic8259<R> {
    fn name(&self) -> &'static str {
        "8259"
    }

    fn trigger_mode(&self, _irq: IrqNumber) -> TriggerMode {
        TriggerMode::Edge
    }

    fn pending(&self, vector: usize) -> Option<IrqNumber> {
        let irq = vector.checked_sub(self.offset)? as u32;
        if irq >= PIC_LINES {
            return None;
        }

        match irq {
            7 if !self.in_service(ports::MASTER_COMMAND, 7) => {
                warn!("8259: spurious IRQ7");
                None
            }
            15 if !self.in_service(ports::SLAVE_COMMAND, 7) => {
                warn!("8259: spurious IRQ15");
                self.io.write8(ports::MASTER_COMMAND, CMD_EOI);
                None
            }
            _ => Some(IrqNumber(irq)),
        }
    }

    fn mask(&self, irq: IrqNumber) {
        if irq.0 >= PIC_LINES {
            return;
        }
        let (port, bit) = Self::data_port(irq.0);
        let imr = self.io.read8(port);
        self.io.write8(port, imr | 1 << bit);
    }

    fn unmask(&self, irq: IrqNumber) {
        if irq.0 >= PIC_LINES {
            return;
        }
        let (port, bit) = Self::data_port(irq.0);
        let imr = self.io.read8(port);
        self.io.write8(port, imr & !(1 << bit));
        if irq.0 >= 8 {
            // the cascade input must be open for slave lines to arrive
            let master = self.io.read8(ports::MASTER_DATA);
            self.io.write8(ports::MASTER_DATA, master & !(1 << CASCADE_IRQ));
        }
    }

    fn acknowledge(&self, _irq: IrqNumber) {
        // acknowledged by the INTA cycle
    }

    fn end_of_interrupt(&self, irq: IrqNumber) {
        if irq.0 >= 8 {
            self.io.write8(ports::SLAVE_COMMAND, CMD_EOI);
        }
        self.io.write8(ports::MASTER_COMMAND, CMD_EOI);
    }

    fn set_priority(&self, _irq: IrqNumber, _level: u8) -> Result<(), ControllerError> {
        Err(ControllerError::PriorityUnsupported)
    }
}
