//! Trap Statistics
//!
//! Lock-free counters updated on every trap. Counters only ever grow;
//! [`TrapStats::snapshot`] reads them individually, so a snapshot taken
//! while traps are in flight is not a consistent cut.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::ErrorCode;
use crate::vector::{TrapClass, MAX_VECTORS};

/// Trap counters of one dispatch core.
pub struct TrapStats {
    exceptions: AtomicU64,
    irqs: AtomicU64,
    syscalls: AtomicU64,
    unassigned: AtomicU64,
    per_vector: [AtomicU64; MAX_VECTORS],
    spurious_irqs: AtomicU64,
    unhandled_irqs: AtomicU64,
    budget_overruns: AtomicU64,
    faults_resolved: AtomicU64,
    threads_killed: AtomicU64,
    syscall_errors: [AtomicU64; ErrorCode::ALL.len()],
}

/// Point-in-time copy of [`TrapStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// CPU exceptions taken
    pub exceptions: u64,
    /// Hardware interrupts taken
    pub irqs: u64,
    /// System calls taken
    pub syscalls: u64,
    /// Traps through unassigned vectors
    pub unassigned: u64,
    /// IRQs the controller reported as spurious
    pub spurious_irqs: u64,
    /// IRQs with no enabled handler
    pub unhandled_irqs: u64,
    /// Handlers that ran past their cycle budget
    pub budget_overruns: u64,
    /// Page faults resolved by the memory manager
    pub faults_resolved: u64,
    /// Threads terminated because of a fault
    pub threads_killed: u64,
    /// System calls that returned an error
    pub syscall_errors: u64,
}

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicU64 = AtomicU64::new(0);

impl TrapStats {
    /// All counters at zero.
    pub const fn new() -> Self {
        Self {
            exceptions: ZERO,
            irqs: ZERO,
            syscalls: ZERO,
            unassigned: ZERO,
            per_vector: [ZERO; MAX_VECTORS],
            spurious_irqs: ZERO,
            unhandled_irqs: ZERO,
            budget_overruns: ZERO,
            faults_resolved: ZERO,
            threads_killed: ZERO,
            syscall_errors: [ZERO; ErrorCode::ALL.len()],
        }
    }

    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a trap through `vector` of class `class`.
    pub fn record_trap(&self, vector: usize, class: TrapClass, assigned: bool) {
        if let Some(counter) = self.per_vector.get(vector) {
            Self::bump(counter);
        }
        let counter = match (assigned, class) {
            (false, _) => &self.unassigned,
            (true, TrapClass::Exception) => &self.exceptions,
            (true, TrapClass::HardwareIrq) => &self.irqs,
            (true, TrapClass::SoftwareTrap) => &self.syscalls,
        };
        Self::bump(counter);
    }

    /// Count a spurious interrupt.
    pub fn record_spurious(&self) {
        Self::bump(&self.spurious_irqs);
    }

    /// Count an interrupt nobody handled, returning the new total.
    pub fn record_unhandled(&self) -> u64 {
        self.unhandled_irqs.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Count a handler budget overrun.
    pub fn record_overrun(&self) {
        Self::bump(&self.budget_overruns);
    }

    /// Count a page fault resolved by the memory manager.
    pub fn record_fault_resolved(&self) {
        Self::bump(&self.faults_resolved);
    }

    /// Count a thread terminated by a fault.
    pub fn record_thread_killed(&self) {
        Self::bump(&self.threads_killed);
    }

    /// Count a failed system call.
    pub fn record_syscall_error(&self, code: ErrorCode) {
        if let Some(i) = ErrorCode::ALL.iter().position(|c| *c == code) {
            Self::bump(&self.syscall_errors[i]);
        }
    }

    /// Traps taken through `vector`.
    pub fn vector_count(&self, vector: usize) -> u64 {
        self.per_vector
            .get(vector)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Failed system calls with error `code`.
    pub fn syscall_error_count(&self, code: ErrorCode) -> u64 {
        ErrorCode::ALL
            .iter()
            .position(|c| *c == code)
            .map(|i| self.syscall_errors[i].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            exceptions: load(&self.exceptions),
            irqs: load(&self.irqs),
            syscalls: load(&self.syscalls),
            unassigned: load(&self.unassigned),
            spurious_irqs: load(&self.spurious_irqs),
            unhandled_irqs: load(&self.unhandled_irqs),
            budget_overruns: load(&self.budget_overruns),
            faults_resolved: load(&self.faults_resolved),
            threads_killed: load(&self.threads_killed),
            syscall_errors: self.syscall_errors.iter().map(load).sum(),
        }
    }
}

impl Default for TrapStats {
    fn default() -> Self {
        Self::new()
    }
}
