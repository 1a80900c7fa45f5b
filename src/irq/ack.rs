//! Scoped Interrupt Acknowledgment
//!
//! The guard ties controller bookkeeping to the dispatch scope instead of the
//! handler: once a line has been identified, EOI is issued when the guard is
//! dropped, whether the handler returned normally or panicked.
//!
//! | Step          | Edge             | Level       |
//! |---------------|------------------|-------------|
//! | guard created | mask             | mask, ack   |
//! | handler runs  |                  |             |
//! | guard dropped | ack, EOI, unmask | EOI, unmask |

use log::trace;

use super::{InterruptController, IrqNumber, TriggerMode};

/// Acknowledgment scope of one hardware interrupt.
#[must_use = "dropping the guard immediately ends the interrupt"]
pub struct AckGuard<'a> {
    controller: &'a dyn InterruptController,
    irq: IrqNumber,
    mode: TriggerMode,
    keep_masked: bool,
}

impl<'a> AckGuard<'a> {
    /// Mask the line and, for level-triggered lines, acknowledge it.
    pub fn new(controller: &'a dyn InterruptController, irq: IrqNumber) -> Self {
        let mode = controller.trigger_mode(irq);
        controller.mask(irq);
        if mode == TriggerMode::Level {
            controller.acknowledge(irq);
        }
        trace!("{}: {} entered ({:?})", controller.name(), irq, mode);

        Self {
            controller,
            irq,
            mode,
            keep_masked: false,
        }
    }

    /// Line being serviced.
    #[inline]
    pub fn irq(&self) -> IrqNumber {
        self.irq
    }

    /// Signalling mode read when the guard was created.
    #[inline]
    pub fn trigger_mode(&self) -> TriggerMode {
        self.mode
    }

    /// Leave the line masked after EOI.
    pub fn keep_masked(&mut self) {
        self.keep_masked = true;
    }
}

impl Drop for AckGuard<'_> {
    fn drop(&mut self) {
        if self.mode == TriggerMode::Edge {
            self.controller.acknowledge(self.irq);
        }
        self.controller.end_of_interrupt(self.irq);
        if !self.keep_masked {
            self.controller.unmask(self.irq);
        }
        trace!("{}: {} done", self.controller.name(), self.irq);
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::vec;

    use super::*;
    use crate::testing::{ControllerCall::*, FakeController};

    #[test]
    fn test_edge_sequence() {
        let ctl = FakeController::new();
        {
            let _guard = AckGuard::new(&ctl, IrqNumber(4));
            assert_eq!(ctl.calls(), vec![Mask(4)]);
        }
        assert_eq!(ctl.calls(), vec![Mask(4), Acknowledge(4), Eoi(4), Unmask(4)]);
    }

    #[test]
    fn test_level_acknowledged_before_handler() {
        let ctl = FakeController::new();
        ctl.set_level(IrqNumber(33));
        {
            let _guard = AckGuard::new(&ctl, IrqNumber(33));
            assert_eq!(ctl.calls(), vec![Mask(33), Acknowledge(33)]);
        }
        assert_eq!(
            ctl.calls(),
            vec![Mask(33), Acknowledge(33), Eoi(33), Unmask(33)]
        );
    }

    #[test]
    fn test_eoi_survives_handler_panic() {
        let ctl = FakeController::new();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = AckGuard::new(&ctl, IrqNumber(7));
            panic!("handler blew up");
        }));

        assert!(result.is_err());
        assert_eq!(ctl.eoi_count(IrqNumber(7)), 1);
        assert!(!ctl.is_masked(IrqNumber(7)));
    }

    #[test]
    fn test_keep_masked() {
        let ctl = FakeController::new();
        {
            let mut guard = AckGuard::new(&ctl, IrqNumber(12));
            guard.keep_masked();
        }
        assert_eq!(ctl.eoi_count(IrqNumber(12)), 1);
        assert!(ctl.is_masked(IrqNumber(12)));
    }
}
