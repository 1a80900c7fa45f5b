//! PL011 UART console
//!
//! Output-only driver for the ARM PrimeCell UART, enough to carry log lines
//! on AArch64 boards. The UART is expected to be set up by firmware.

use spin::Mutex;

use super::Console;
use crate::arch::without_interrupts;
use crate::irq::RegisterIo;

/// PL011 Register offsets
pub mod regs {
    /// Data Register - read/write data
    pub const DR: usize = 0x00;
    /// Flag Register - status flags
    pub const FR: usize = 0x18;
}

/// Flag Register bits
pub mod flags {
    /// Transmit FIFO full
    pub const TXFF: u32 = 1 << 5;
}

/// PL011 UART driver
pub struct Pl011<R> {
    io: Mutex<R>,
}

impl<R: RegisterIo> Pl011<R> {
    /// Driver over the UART register block.
    pub const fn new(io: R) -> Self {
        Self { io: Mutex::new(io) }
    }

    fn write_byte(io: &R, byte: u8) {
        // Wait for transmit FIFO to have space
        while io.read32(regs::FR) & flags::TXFF != 0 {
            core::hint::spin_loop();
        }
        io.write32(regs::DR, byte as u32);
    }
}

impl<R: RegisterIo> Console for Pl011<R> {
    fn puts(&self, s: &str) {
        // trap handlers log too
        without_interrupts(|| {
            let io = self.io.lock();
            for byte in s.bytes() {
                if byte == b'\n' {
                    Self::write_byte(&io, b'\r');
                }
                Self::write_byte(&io, byte);
            }
        })
    }
}
