//! ARM Generic Interrupt Controller (GICv2 / GICv3)
//!
//! The distributor programming is shared between versions. What differs is
//! the CPU interface (memory-mapped GICC on v2, `ICC_*_EL1` system registers
//! on v3) and where SGIs/PPIs are enabled (GICD on v2, the redistributor's
//! SGI frame on v3).
//!
//! The CPU interface is reached through [`RegisterIo`] on both versions; on
//! v3, [`SysRegCpuInterface`] maps the v2 register offsets onto the system
//! registers, so the driver body is version agnostic.

use log::warn;

use super::{ControllerError, InterruptController, IrqNumber, RegisterIo, TriggerMode};

/// INTID returned by IAR/HPPIR when nothing is pending.
pub const SPURIOUS_INTID: u32 = 1023;
/// First shared peripheral interrupt; below are SGIs (0-15) and PPIs (16-31).
pub const SPI_BASE: u32 = 32;
/// Largest INTID the driver accepts.
pub const MAX_INTID: u32 = 1019;

const INTID_MASK: u32 = 0x3FF;

/// Distributor register offsets.
pub mod gicd {
    /// Interrupt set-enable
    pub const ISENABLER: usize = 0x100;
    /// Interrupt clear-enable
    pub const ICENABLER: usize = 0x180;
    /// Interrupt priority (one byte per INTID)
    pub const IPRIORITYR: usize = 0x400;
    /// Interrupt configuration (two bits per INTID)
    pub const ICFGR: usize = 0xC00;
}

/// CPU interface register offsets (GICC layout).
pub mod gicc {
    /// Interrupt acknowledge
    pub const IAR: usize = 0x0C;
    /// End of interrupt
    pub const EOIR: usize = 0x10;
    /// Highest priority pending interrupt
    pub const HPPIR: usize = 0x18;
}

/// Offset of the SGI/PPI frame inside a GICv3 redistributor.
pub const GICR_SGI_BASE: usize = 0x1_0000;

/// GIC architecture version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GicVersion {
    /// GICv2, memory-mapped CPU interface
    V2,
    /// GICv3, system-register CPU interface and redistributors
    V3,
}

/// GIC driver for the calling CPU.
pub struct Gic<D, C> {
    version: GicVersion,
    dist: D,
    redist: Option<D>,
    cpu: C,
}

impl<D: RegisterIo, C: RegisterIo> Gic<D, C> {
    /// GICv2 with distributor and memory-mapped CPU interface.
    pub const fn v2(dist: D, cpu: C) -> Self {
        Self {
            version: GicVersion::V2,
            dist,
            redist: None,
            cpu,
        }
    }

    /// GICv3 with distributor, this CPU's redistributor and its CPU interface.
    pub const fn v3(dist: D, redist: D, cpu: C) -> Self {
        Self {
            version: GicVersion::V3,
            dist,
            redist: Some(redist),
            cpu,
        }
    }

    /// Architecture version.
    pub fn version(&self) -> GicVersion {
        self.version
    }

    /// Highest priority pending INTID, without acknowledging it.
    pub fn peek(&self) -> Option<IrqNumber> {
        let intid = self.cpu.read32(gicc::HPPIR) & INTID_MASK;
        (intid != SPURIOUS_INTID).then_some(IrqNumber(intid))
    }

    /// Register block and base offset holding the banked registers of `irq`.
    fn bank(&self, irq: IrqNumber) -> (&D, usize) {
        match &self.redist {
            Some(redist) if irq.0 < SPI_BASE => (redist, GICR_SGI_BASE),
            _ => (&self.dist, 0),
        }
    }

    fn write_enable_bit(&self, irq: IrqNumber, reg: usize) {
        let (io, base) = self.bank(irq);
        let offset = base + reg + 4 * (irq.0 as usize / 32);
        io.write32(offset, 1 << (irq.0 % 32));
    }
}

impl<D: RegisterIo, C: RegisterIo> InterruptController for Gic<D, C> {
    fn name(&self) -> &'static str {
        match self.version {
            GicVersion::V2 => "gicv2",
            GicVersion::V3 => "gicv3",
        }
    }

    fn trigger_mode(&self, irq: IrqNumber) -> TriggerMode {
        if irq.0 < 16 {
            // SGIs are always edge-triggered
            return TriggerMode::Edge;
        }
        let (io, base) = self.bank(irq);
        let offset = base + gicd::ICFGR + 4 * (irq.0 as usize / 16);
        let shift = 2 * (irq.0 % 16) + 1;
        if io.read32(offset) & (1 << shift) != 0 {
            TriggerMode::Edge
        } else {
            TriggerMode::Level
        }
    }

    /// HPPIR is checked first so that an empty poll does not touch IAR; the
    /// IAR read then activates the interrupt at the CPU interface.
    fn pending(&self, _vector: usize) -> Option<IrqNumber> {
        self.peek()?;
        let intid = self.cpu.read32(gicc::IAR) & INTID_MASK;
        if intid == SPURIOUS_INTID {
            warn!("{}: spurious interrupt", self.name());
            return None;
        }
        Some(IrqNumber(intid))
    }

    fn mask(&self, irq: IrqNumber) {
        if irq.0 <= MAX_INTID {
            self.write_enable_bit(irq, gicd::ICENABLER);
        }
    }

    fn unmask(&self, irq: IrqNumber) {
        if irq.0 <= MAX_INTID {
            self.write_enable_bit(irq, gicd::ISENABLER);
        }
    }

    fn acknowledge(&self, _irq: IrqNumber) {
        // already active since the IAR read in `pending`
    }

    fn end_of_interrupt(&self, irq: IrqNumber) {
        self.cpu.write32(gicc::EOIR, irq.0);
    }

    fn set_priority(&self, irq: IrqNumber, level: u8) -> Result<(), ControllerError> {
        if irq.0 > MAX_INTID {
            return Err(ControllerError::InvalidIrq(irq));
        }
        let (io, base) = self.bank(irq);
        let reg = base + gicd::IPRIORITYR + (irq.0 as usize & !3);
        let shift = (irq.0 & 3) * 8;
        let word = io.read32(reg) & !(0xFF << shift);
        io.write32(reg, word | (level as u32) << shift);
        Ok(())
    }
}

/// GICv3 CPU interface through the `ICC_*_EL1` system registers.
///
/// Accepts the GICC offsets used by [`Gic`]; other offsets read as zero and
/// ignore writes.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub struct SysRegCpuInterface;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
impl RegisterIo for SysRegCpuInterface {
    fn read32(&self, offset: usize) -> u32 {
        let value: u64;
        // SAFETY: the ICC registers are accessible at EL1 once the system
        // register interface is enabled by platform code.
        unsafe {
            match offset {
                gicc::IAR => core::arch::asm!("mrs {}, icc_iar1_el1", out(reg) value),
                gicc::HPPIR => core::arch::asm!("mrs {}, icc_hppir1_el1", out(reg) value),
                _ => value = 0,
            }
        }
        value as u32
    }

    fn write32(&self, offset: usize, value: u32) {
        if offset == gicc::EOIR {
            // SAFETY: as above.
            unsafe { core::arch::asm!("msr icc_eoir1_el1, {}", in(reg) value as u64) };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::vec;

    use super::*;
    use crate::testing::FakeRegisters;

    #[test]
    fn test_spi_enable_bits() {
        let gic = Gic::v2(FakeRegisters::new(), FakeRegisters::new());
        gic.mask(IrqNumber(200));
        gic.unmask(IrqNumber(200));
        assert_eq!(gic.dist.writes_to(gicd::ICENABLER + 24), vec![1 << 8]);
        assert_eq!(gic.dist.writes_to(gicd::ISENABLER + 24), vec![1 << 8]);
    }

    #[test]
    fn test_v3_private_lines_go_to_redistributor() {
        let gic = Gic::v3(FakeRegisters::new(), FakeRegisters::new(), FakeRegisters::new());
        gic.mask(IrqNumber(27));
        let redist = gic.redist.as_ref().unwrap();
        assert_eq!(redist.writes_to(GICR_SGI_BASE + gicd::ICENABLER), vec![1 << 27]);
        assert!(gic.dist.writes_to(gicd::ICENABLER).is_empty());
    }

    #[test]
    fn test_pending_reads_iar_only_when_something_is_pending() {
        let gic = Gic::v2(FakeRegisters::new(), FakeRegisters::new());
        gic.cpu.on_read(gicc::HPPIR, SPURIOUS_INTID);
        assert_eq!(gic.pending(0), None);
        assert_eq!(gic.cpu.reads_of(gicc::IAR), 0);

        gic.cpu.on_read(gicc::HPPIR, 30);
        gic.cpu.on_read(gicc::IAR, 30);
        assert_eq!(gic.pending(0), Some(IrqNumber(30)));
    }

    #[test]
    fn test_trigger_mode_from_icfgr() {
        let gic = Gic::v2(FakeRegisters::new(), FakeRegisters::new());
        // INTID 200: ICFGR word 12, field 8, edge bit 17
        gic.dist.set(gicd::ICFGR + 4 * 12, 1 << 17);
        assert_eq!(gic.trigger_mode(IrqNumber(200)), TriggerMode::Edge);
        assert_eq!(gic.trigger_mode(IrqNumber(201)), TriggerMode::Level);
        assert_eq!(gic.trigger_mode(IrqNumber(3)), TriggerMode::Edge);
    }

    #[test]
    fn test_priority_byte() {
        let gic = Gic::v2(FakeRegisters::new(), FakeRegisters::new());
        gic.dist.set(gicd::IPRIORITYR + 28, 0xA0A0_A0A0);
        gic.set_priority(IrqNumber(30), 0x80).unwrap();
        assert_eq!(gic.dist.writes_to(gicd::IPRIORITYR + 28), vec![0xA080_A0A0]);
        assert_eq!(
            gic.set_priority(IrqNumber(1020), 0),
            Err(ControllerError::InvalidIrq(IrqNumber(1020)))
        );
    }
}
