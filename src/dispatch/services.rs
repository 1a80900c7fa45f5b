//! Kernel services the dispatch core calls out to.
//!
//! These are implemented by the embedding kernel. The dispatch core only
//! relies on the contracts documented here.

use core::sync::atomic::{AtomicU64, Ordering};

use super::MAX_CPUS;
use crate::arch::ExceptionKind;
use crate::error::ErrorCode;
use crate::frame::TrapFrame;
use crate::mm::{AccessKind, VirtAddr};
use crate::privilege::UserRange;
use crate::syscall::UserBuffer;

/// Why the scheduler is being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleReason {
    /// Periodic timer interrupt
    Tick,
    /// The thread gave up the CPU voluntarily
    Yield,
    /// The thread waits inside a blocking system call
    Blocked,
    /// The current thread is gone and must not be resumed
    Terminated,
}

/// Context to resume after a scheduler call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextContext {
    /// Resume the interrupted context
    Continue,
    /// Resume this context instead
    Switch(TrapFrame),
}

/// Scheduler entry point.
pub trait Scheduler: Send + Sync {
    /// Pick the context to run next.
    ///
    /// For [`ScheduleReason::Blocked`] the call returns once the thread has
    /// been woken up; a switch reply takes effect when the system call
    /// returns. For
    /// [`ScheduleReason::Terminated`] the reply must be a switch.
    fn tick_or_yield(&self, current: &TrapFrame, reason: ScheduleReason) -> NextContext;
}

/// Outcome of asking the memory manager about a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The mapping was fixed up; re-execute the faulting instruction
    Resolved,
    /// No valid mapping can back the access
    Unresolvable,
}

/// Memory manager entry point for recoverable faults.
pub trait MemoryManager: Send + Sync {
    /// Try to back `addr` for `access` in the current address space.
    fn try_resolve_page_fault(&self, addr: VirtAddr, access: AccessKind) -> FaultResolution;
}

/// Why the current thread ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// `exit` system call with its status
    Exit(i32),
    /// Fatal exception raised in user mode
    Fault(ExceptionKind),
}

/// Process and thread bookkeeping.
pub trait ProcessControl: Send + Sync {
    /// Identifier of the current process.
    fn current_pid(&self) -> usize;

    /// User address window of the current thread.
    fn user_range(&self) -> UserRange;

    /// Mark the current thread as finished. The dispatch core reschedules
    /// afterwards.
    fn terminate_current(&self, reason: Termination);

    /// Whether a signal is waiting for the current thread.
    fn signal_pending(&self) -> bool;
}

/// Progress of a descriptor read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoProgress {
    /// Bytes transferred
    Done(usize),
    /// Nothing available yet
    WouldBlock,
}

/// Descriptor I/O of the current process.
pub trait FileTable: Send + Sync {
    /// Write `buf` to `fd`, returning the bytes written.
    fn write(&self, fd: usize, buf: UserBuffer) -> Result<usize, ErrorCode>;

    /// Read from `fd` into `buf` without waiting.
    fn read(&self, fd: usize, buf: UserBuffer) -> Result<IoProgress, ErrorCode>;
}

/// Per-CPU primitives.
pub trait CpuOps: Send + Sync {
    /// Dense index of the executing CPU, below [`MAX_CPUS`] on a supported
    /// machine.
    fn cpu_id(&self) -> usize;

    /// Unmask interrupts on this CPU.
    fn enable_interrupts(&self);

    /// Mask interrupts on this CPU.
    fn disable_interrupts(&self);

    /// Free-running cycle counter.
    fn cycles(&self) -> u64;
}

/// Dense CPU indices handed out in the order hardware ids are first seen.
///
/// APIC ids and MPIDR affinities can be sparse; the dispatch state is not.
pub struct CpuIndexMap {
    // hardware id + 1; zero is a free slot
    ids: [AtomicU64; MAX_CPUS],
}

impl CpuIndexMap {
    /// An empty map.
    pub const fn new() -> Self {
        const FREE: AtomicU64 = AtomicU64::new(0);
        Self {
            ids: [FREE; MAX_CPUS],
        }
    }

    /// Index of `hw_id`, claiming the next free one on first sight.
    ///
    /// `None` once every index belongs to another CPU.
    pub fn index_of(&self, hw_id: u64) -> Option<usize> {
        let tag = hw_id.wrapping_add(1);
        for (index, slot) in self.ids.iter().enumerate() {
            match slot.compare_exchange(0, tag, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(index),
                Err(seen) if seen == tag => return Some(index),
                Err(_) => {}
            }
        }
        None
    }
}

impl Default for CpuIndexMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    use super::*;

    #[test]
    fn test_sparse_ids_get_dense_indices() {
        let map = CpuIndexMap::new();
        assert_eq!(map.index_of(0x10), Some(0));
        assert_eq!(map.index_of(3), Some(1));
        assert_eq!(map.index_of(0x10), Some(0));
        assert_eq!(map.index_of(0), Some(2));
    }

    #[test]
    fn test_full_map_rejects_new_ids() {
        let map = CpuIndexMap::new();
        for id in 0..MAX_CPUS as u64 {
            assert_eq!(map.index_of(id * 0x100), Some(id as usize));
        }
        assert_eq!(map.index_of(0xFFFF), None);
        assert_eq!(map.index_of(0x100), Some(1));
    }

    #[test]
    fn test_concurrent_first_sight() {
        let map = Arc::new(CpuIndexMap::new());
        let handles: Vec<_> = (0..MAX_CPUS as u64)
            .map(|id| {
                let map = map.clone();
                thread::spawn(move || map.index_of(id + 40).unwrap())
            })
            .collect();
        let mut indices: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..MAX_CPUS).collect::<Vec<_>>());
    }
}
