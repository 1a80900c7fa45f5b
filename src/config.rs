//! Dispatch Configuration
//!
//! Policy knobs of the dispatch core. Everything has a `const` default so a
//! kernel can build its configuration in a `static`.

use log::LevelFilter;

use crate::irq::IrqNumber;

/// What to do with a hardware IRQ that has no enabled handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnhandledIrqPolicy {
    /// Count it, EOI it and carry on
    #[default]
    RecordAndContinue,
    /// Count it and leave the line masked after EOI
    MaskLine,
    /// Treat it as a kernel bug
    Panic,
}

/// Dispatch core configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Handling of IRQs nobody claimed.
    pub unhandled_irq_policy: UnhandledIrqPolicy,
    /// Line of the scheduler tick, if the platform has one.
    pub timer_irq: Option<IrqNumber>,
    /// Cycles a device handler may run before an overrun is reported.
    pub handler_budget_cycles: u64,
    /// Level filter for [`crate::logging::init`].
    pub log_level: LevelFilter,
}

impl DispatchConfig {
    /// Default handler budget.
    pub const DEFAULT_BUDGET_CYCLES: u64 = 100_000;

    /// Default configuration.
    pub const fn new() -> Self {
        Self {
            unhandled_irq_policy: UnhandledIrqPolicy::RecordAndContinue,
            timer_irq: None,
            handler_budget_cycles: Self::DEFAULT_BUDGET_CYCLES,
            log_level: LevelFilter::Info,
        }
    }

    /// Set the unhandled IRQ policy.
    pub const fn with_unhandled_irq_policy(mut self, policy: UnhandledIrqPolicy) -> Self {
        self.unhandled_irq_policy = policy;
        self
    }

    /// Set the scheduler tick line.
    pub const fn with_timer_irq(mut self, irq: IrqNumber) -> Self {
        self.timer_irq = Some(irq);
        self
    }

    /// Set the per-handler cycle budget. Zero disables budget checks.
    pub const fn with_handler_budget(mut self, cycles: u64) -> Self {
        self.handler_budget_cycles = cycles;
        self
    }

    /// Set the log level.
    pub const fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    /// Whether `irq` is the scheduler tick.
    #[inline]
    pub fn is_timer(&self, irq: IrqNumber) -> bool {
        self.timer_irq == Some(irq)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        const CONFIG: DispatchConfig = DispatchConfig::new()
            .with_timer_irq(IrqNumber(30))
            .with_unhandled_irq_policy(UnhandledIrqPolicy::MaskLine)
            .with_handler_budget(0);

        assert!(CONFIG.is_timer(IrqNumber(30)));
        assert!(!CONFIG.is_timer(IrqNumber(31)));
        assert_eq!(CONFIG.unhandled_irq_policy, UnhandledIrqPolicy::MaskLine);
        assert_eq!(CONFIG.handler_budget_cycles, 0);
        assert_eq!(DispatchConfig::default().log_level, LevelFilter::Info);
    }
}
