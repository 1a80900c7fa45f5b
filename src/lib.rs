//! trapcore - Interrupt, Exception and System Call Dispatch Core
//!
//! The architecture-independent layer of the kernel that sits between the
//! hardware trap entry and everything that wants to run because of a trap:
//! device drivers, the scheduler tick and the system call implementations.
//!
//! # Targets
//! - x86_64: IDT, legacy PIC / APIC, `syscall` and `int 0x80`
//! - AArch64: VBAR_EL1 vector table, GICv2/v3, `svc #0`
//! - RISC-V (RV64): direct-mode `stvec`, CLINT/PLIC, `ecall`
//!
//! # Architecture
//! ```text
//!  hardware event
//!       │
//!       ▼
//!  vector entry ──▶ common trampoline (arch::*) ──▶ <Arch>TrapFrame::capture
//!                                                        │
//!                                                        ▼
//!                         ┌──────────── DispatchCore::handle_trap ───────────┐
//!                         │ Exception │ HardwareIrq │ SoftwareTrap │ Unassigned│
//!                         └─────┬───────────┬──────────────┬────────────┬────┘
//!                           faults      registry        syscall table  default
//!                                           │                              fault
//!                                           ▼
//!                            <Arch>TrapFrame::restore ──▶ eret / sret / iretq
//! ```
//!
//! # Security Properties
//! - Every vector slot is populated; no trap lands on an undefined entry
//! - Syscall arguments are validated in full before a handler runs
//! - Interrupt acknowledgment is tied to the dispatch scope, not the handler
//! - Handlers can only mutate the return register of the interrupted context
//!
//! Everything except the control-register writes and the assembly
//! trampolines builds on the host, so the whole dispatch model is covered by
//! the regular test harness.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

#[cfg(test)]
extern crate std;

pub mod arch;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod irq;
pub mod logging;
pub mod mm;
pub mod privilege;
pub mod stats;
pub mod syscall;
pub mod vector;

#[cfg(test)]
mod testing;

pub use arch::Arch;
pub use config::{DispatchConfig, UnhandledIrqPolicy};
pub use dispatch::{
    Collaborators, CpuOps, DispatchCore, DispatchState, FaultResolution, FileTable, IoProgress,
    MemoryManager, NextContext, ProcessControl, ScheduleReason, Scheduler, Termination,
    TrapHandler, TrapOutcome, MAX_CPUS,
};
pub use error::ErrorCode;
pub use frame::TrapFrame;
pub use irq::{InterruptController, IrqNumber, TriggerMode};
pub use privilege::{PrivilegeGuard, PrivilegeLevel, UserRange};
pub use vector::{build_vector_table, TrapClass, VectorTable, VectorTableEntry};
