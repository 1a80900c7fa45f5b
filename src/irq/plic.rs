//! RISC-V CLINT + PLIC
//!
//! Two sources reach a supervisor-mode hart:
//! - CPU-local lines (software and timer), raised by the CLINT through
//!   firmware and reported directly in `scause`
//! - external lines, multiplexed by the PLIC behind the supervisor external
//!   interrupt and identified with a claim
//!
//! Local lines are given the numbers `LOCAL_IRQ_BASE + cause` so both sources
//! share one registry namespace. They are masked in `sie` and the software
//! line is acknowledged in `sip`; S-mode cannot reach the CLINT itself. All
//! lines are level-triggered: the PLIC gateway holds a source until it is
//! completed, and a local line stays pending until software clears it.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use super::{ControllerError, InterruptController, IrqNumber, RegisterIo, TriggerMode};
use crate::arch::riscv64::{IrqCause, INTERRUPT_VECTOR_BASE};

/// Registry number of local interrupt cause 0.
pub const LOCAL_IRQ_BASE: u32 = 1024;
/// PLIC sources; source 0 does not exist.
pub const PLIC_SOURCES: u32 = 1024;
/// Highest PLIC priority.
pub const MAX_PRIORITY: u8 = 7;

/// PLIC register layout.
pub mod plic {
    /// Source priority array, one word per source
    pub const PRIORITY: usize = 0x0000;
    /// Enable bitmaps, one block per context
    pub const ENABLE: usize = 0x2000;
    /// Size of one context's enable block
    pub const ENABLE_STRIDE: usize = 0x80;
    /// Claim/complete register of context 0
    pub const CLAIM: usize = 0x20_0004;
    /// Size of one context's threshold/claim block
    pub const CONTEXT_STRIDE: usize = 0x1000;
}

bitflags! {
    /// Local interrupt bits, laid out the same in `sie` and `sip`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SiFlags: u64 {
        /// Supervisor software interrupt
        const SSIE = 1 << 1;
        /// Supervisor timer interrupt
        const STIE = 1 << 5;
        /// Supervisor external interrupt
        const SEIE = 1 << 9;
    }
}

/// The executing hart's `sie` and `sip` CSRs.
pub trait LocalCsr: Send + Sync {
    /// Set bits in `sie`.
    fn enable(&self, flags: SiFlags);

    /// Clear bits in `sie`.
    fn disable(&self, flags: SiFlags);

    /// Clear bits in `sip`.
    fn clear_pending(&self, flags: SiFlags);
}

/// CSR access on real hardware.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub struct HartCsr;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
impl LocalCsr for HartCsr {
    fn enable(&self, flags: SiFlags) {
        // SAFETY: sie only gates delivery to this hart.
        unsafe { core::arch::asm!("csrs sie, {}", in(reg) flags.bits(), options(nostack)) };
    }

    fn disable(&self, flags: SiFlags) {
        // SAFETY: see `enable`.
        unsafe { core::arch::asm!("csrc sie, {}", in(reg) flags.bits(), options(nostack)) };
    }

    fn clear_pending(&self, flags: SiFlags) {
        // SAFETY: only SSIP is writable from S-mode; other bits are ignored.
        unsafe { core::arch::asm!("csrc sip, {}", in(reg) flags.bits(), options(nostack)) };
    }
}

/// Registry number of a local interrupt cause.
pub const fn local_irq(cause: IrqCause) -> IrqNumber {
    IrqNumber(LOCAL_IRQ_BASE + cause as u32)
}

/// Interrupt controller of one hart.
pub struct ClintPlic<P, C> {
    plic: P,
    csr: C,
    context: usize,
    local_masked: AtomicU64,
}

impl<P: RegisterIo, C: LocalCsr> ClintPlic<P, C> {
    /// Driver for the hart whose supervisor PLIC context is `context`.
    pub const fn new(plic: P, csr: C, context: usize) -> Self {
        Self {
            plic,
            csr,
            context,
            local_masked: AtomicU64::new(0),
        }
    }

    fn claim_offset(&self) -> usize {
        plic::CLAIM + plic::CONTEXT_STRIDE * self.context
    }

    fn enable_word(&self, irq: u32) -> usize {
        plic::ENABLE + plic::ENABLE_STRIDE * self.context + 4 * (irq as usize / 32)
    }

    fn local_flag(irq: IrqNumber) -> Option<SiFlags> {
        match irq.0.checked_sub(LOCAL_IRQ_BASE)? {
            cause if cause == IrqCause::SSoft as u32 => Some(SiFlags::SSIE),
            cause if cause == IrqCause::STimer as u32 => Some(SiFlags::STIE),
            _ => None,
        }
    }

    fn is_external(irq: IrqNumber) -> bool {
        irq.0 > 0 && irq.0 < PLIC_SOURCES
    }

    fn set_enable(&self, irq: IrqNumber, enabled: bool) {
        if Self::is_external(irq) {
            let reg = self.enable_word(irq.0);
            let bit = 1 << (irq.0 % 32);
            let word = self.plic.read32(reg);
            let word = if enabled { word | bit } else { word & !bit };
            self.plic.write32(reg, word);
        } else if let Some(flag) = Self::local_flag(irq) {
            if enabled {
                self.local_masked.fetch_and(!flag.bits(), Ordering::AcqRel);
                self.csr.enable(flag);
            } else {
                self.local_masked.fetch_or(flag.bits(), Ordering::AcqRel);
                self.csr.disable(flag);
            }
        }
    }

    /// Whether a local line is masked.
    pub fn is_local_masked(&self, irq: IrqNumber) -> bool {
        Self::local_flag(irq)
            .map(|flag| self.local_masked.load(Ordering::Acquire) & flag.bits() != 0)
            .unwrap_or(false)
    }

    /// A local line, unless it is masked; a trap that raced the mask is spurious.
    fn local_pending(&self, cause: IrqCause) -> Option<IrqNumber> {
        let irq = local_irq(cause);
        (!self.is_local_masked(irq)).then_some(irq)
    }
}

impl<P: RegisterIo, C: LocalCsr> InterruptController for ClintPlic<P, C> {
    fn name(&self) -> &'static str {
        "clint-plic"
    }

    fn trigger_mode(&self, _irq: IrqNumber) -> TriggerMode {
        TriggerMode::Level
    }

    fn pending(&self, vector: usize) -> Option<IrqNumber> {
        let cause = vector.checked_sub(INTERRUPT_VECTOR_BASE)?;
        if cause == IrqCause::SExternal as usize {
            // claim 0 means another hart won the race
            let claimed = self.plic.read32(self.claim_offset());
            return (claimed != 0).then_some(IrqNumber(claimed));
        }
        if cause == IrqCause::STimer as usize {
            return self.local_pending(IrqCause::STimer);
        }
        if cause == IrqCause::SSoft as usize {
            return self.local_pending(IrqCause::SSoft);
        }
        None
    }

    fn mask(&self, irq: IrqNumber) {
        self.set_enable(irq, false);
    }

    fn unmask(&self, irq: IrqNumber) {
        self.set_enable(irq, true);
    }

    fn acknowledge(&self, irq: IrqNumber) {
        // PLIC sources were acknowledged by the claim; the timer is
        // re-armed by the scheduler
        if irq == local_irq(IrqCause::SSoft) {
            self.csr.clear_pending(SiFlags::SSIE);
        }
    }

    fn end_of_interrupt(&self, irq: IrqNumber) {
        if Self::is_external(irq) {
            self.plic.write32(self.claim_offset(), irq.0);
        }
    }

    fn set_priority(&self, irq: IrqNumber, level: u8) -> Result<(), ControllerError> {
        if Self::local_flag(irq).is_some() {
            return Err(ControllerError::PriorityUnsupported);
        }
        if !Self::is_external(irq) {
            return Err(ControllerError::InvalidIrq(irq));
        }
        if level > MAX_PRIORITY {
            return Err(ControllerError::InvalidPriority(level));
        }
        self.plic.write32(plic::PRIORITY + 4 * irq.as_usize(), level as u32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::vec;

    use super::*;
    use crate::testing::{FakeCsr, FakeRegisters};

    const EXTERNAL: usize = INTERRUPT_VECTOR_BASE + 9;
    const TIMER: usize = INTERRUPT_VECTOR_BASE + 5;
    const SOFT: usize = INTERRUPT_VECTOR_BASE + 1;

    fn hart1() -> ClintPlic<FakeRegisters, FakeCsr> {
        ClintPlic::new(FakeRegisters::new(), FakeCsr::new(), 3)
    }

    #[test]
    fn test_claim_and_complete() {
        let ctl = hart1();
        let claim = plic::CLAIM + 3 * plic::CONTEXT_STRIDE;
        ctl.plic.queue_reads(claim, &[10, 0]);

        assert_eq!(ctl.pending(EXTERNAL), Some(IrqNumber(10)));
        // another hart already claimed it
        assert_eq!(ctl.pending(EXTERNAL), None);

        ctl.end_of_interrupt(IrqNumber(10));
        assert_eq!(ctl.plic.writes_to(claim), vec![10]);
    }

    #[test]
    fn test_local_lines() {
        let ctl = hart1();
        assert_eq!(ctl.pending(TIMER), Some(IrqNumber(LOCAL_IRQ_BASE + 5)));
        assert_eq!(ctl.pending(SOFT), Some(IrqNumber(LOCAL_IRQ_BASE + 1)));
        assert_eq!(ctl.pending(INTERRUPT_VECTOR_BASE + 3), None);
        assert_eq!(ctl.pending(2), None);

        ctl.acknowledge(local_irq(IrqCause::SSoft));
        assert_eq!(ctl.csr.pending_cleared(), vec![SiFlags::SSIE]);
        ctl.acknowledge(local_irq(IrqCause::STimer));
        assert_eq!(ctl.csr.pending_cleared().len(), 1);
    }

    #[test]
    fn test_mask_external_and_local() {
        let ctl = hart1();
        let enable = plic::ENABLE + 3 * plic::ENABLE_STRIDE + 4;
        ctl.plic.set(enable, 0xFFFF_FFFF);

        ctl.mask(IrqNumber(33));
        assert_eq!(ctl.plic.writes_to(enable), vec![0xFFFF_FFFD]);

        let timer = local_irq(IrqCause::STimer);
        ctl.mask(timer);
        assert!(ctl.is_local_masked(timer));
        assert!(!ctl.csr.enabled().contains(SiFlags::STIE));
        ctl.unmask(timer);
        assert!(!ctl.is_local_masked(timer));
        assert!(ctl.csr.enabled().contains(SiFlags::STIE));
    }

    #[test]
    fn test_masked_local_line_is_not_pending() {
        let ctl = hart1();
        let timer = local_irq(IrqCause::STimer);

        ctl.mask(timer);
        assert_eq!(ctl.pending(TIMER), None);
        // the other local line is unaffected
        assert_eq!(ctl.pending(SOFT), Some(local_irq(IrqCause::SSoft)));

        ctl.unmask(timer);
        assert_eq!(ctl.pending(TIMER), Some(timer));
    }

    #[test]
    fn test_priority_range() {
        let ctl = hart1();
        ctl.set_priority(IrqNumber(10), 7).unwrap();
        assert_eq!(ctl.plic.writes_to(plic::PRIORITY + 40), vec![7]);

        assert_eq!(
            ctl.set_priority(IrqNumber(10), 8),
            Err(ControllerError::InvalidPriority(8))
        );
        assert_eq!(
            ctl.set_priority(IrqNumber(0), 1),
            Err(ControllerError::InvalidIrq(IrqNumber(0)))
        );
        assert_eq!(
            ctl.set_priority(local_irq(IrqCause::STimer), 1),
            Err(ControllerError::PriorityUnsupported)
        );
    }
}
