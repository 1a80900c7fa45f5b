//! Trap Dispatch Core
//!
//! Every trap on every architecture ends up in [`DispatchCore::handle_trap`]:
//!
//! ```text
//! Idle ─▶ TrapEntered ─▶ Classified ─▶ HandlerRunning ─▶ Restoring ─▶ Idle
//! ```
//!
//! # Routing
//! - Exception: interrupts stay masked. Page faults on valid user ranges go
//!   to the memory manager, breakpoints resume, everything else is fatal to
//!   the thread (user origin) or the kernel.
//! - HardwareIrq: the controller names the line, an [`AckGuard`] scopes the
//!   acknowledgment, and the registered handler runs with interrupts enabled
//!   and a cycle budget. The timer line ends in a scheduler tick.
//! - SoftwareTrap: the ABI's registers go through [`dispatch_syscall`]; the
//!   result is written back before any deferred reschedule runs.
//! - Unassigned: default fault.
//!
//! # Nesting
//! A trap may only arrive while the CPU is idle or while a handler runs with
//! interrupts enabled. Anything else means the masked part of the dispatch
//! path faulted, which is a kernel bug.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use log::{debug, error, info, trace, warn};
use spin::Once;

use crate::arch::{self, ExceptionKind, SyscallAbi, TrapCause};
use crate::config::{DispatchConfig, UnhandledIrqPolicy};
use crate::error::encode_result;
use crate::frame::TrapFrame;
use crate::irq::{AckGuard, HandlerRegistry, InterruptController, InterruptHandler, IrqNumber};
use crate::mm::{AccessKind, VirtAddr};
use crate::privilege::{PrivilegeGuard, PrivilegeLevel};
use crate::stats::TrapStats;
use crate::syscall::{dispatch_syscall, SyscallEnv, SyscallTable};
use crate::vector::{TrapClass, VectorTable};

mod services;

pub use services::{
    CpuIndexMap, CpuOps, FaultResolution, FileTable, IoProgress, MemoryManager, NextContext, ProcessControl,
    ScheduleReason, Scheduler, Termination,
};

/// CPUs with their own dispatch state.
pub const MAX_CPUS: usize = 8;

/// Per-CPU position in the dispatch path.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// No trap in progress
    Idle = 0,
    /// Frame captured, cause not known yet
    TrapEntered = 1,
    /// Cause decoded
    Classified = 2,
    /// Handler, fault resolution or syscall running
    HandlerRunning = 3,
    /// Writing the frame back
    Restoring = 4,
}

impl DispatchState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::TrapEntered,
            2 => Self::Classified,
            3 => Self::HandlerRunning,
            4 => Self::Restoring,
            _ => Self::Idle,
        }
    }
}

/// How a trap ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    /// The interrupted context continues (possibly after a fixup)
    Resumed,
    /// A device interrupt was serviced
    IrqHandled(IrqNumber),
    /// The controller had nothing pending
    Spurious,
    /// No enabled handler claimed the line
    Unhandled(IrqNumber),
    /// A system call completed with this result
    Syscall(Result<usize, crate::error::ErrorCode>),
    /// The current thread was terminated and another one scheduled
    ThreadTerminated,
}

/// Receiver of every trap taken by the architecture trampolines.
pub trait TrapHandler: Sync {
    /// Handle one trap, mutating `frame` as needed for the return.
    fn handle_trap(&self, frame: &mut TrapFrame) -> TrapOutcome;
}

static SINK: Once<&'static dyn TrapHandler> = Once::new();

/// Entry point of the architecture trampolines.
pub fn enter(frame: &mut TrapFrame) {
    match SINK.get() {
        Some(sink) => {
            sink.handle_trap(frame);
        }
        None => fatal(format_args!(
            "trap on vector {} before a dispatch core was installed",
            frame.vector()
        )),
    }
}

/// Log and panic on a kernel-fatal condition.
#[cold]
fn fatal(args: fmt::Arguments<'_>) -> ! {
    error!("{}", args);
    panic!("{}", args)
}

/// Kernel services the dispatch core calls into.
pub struct Collaborators<'a> {
    /// Platform interrupt controller
    pub controller: &'a dyn InterruptController,
    /// Device handler arena
    pub registry: &'a HandlerRegistry,
    /// System call descriptors
    pub syscalls: &'a SyscallTable,
    /// Scheduler entry point
    pub scheduler: &'a dyn Scheduler,
    /// Page fault resolution
    pub memory: &'a dyn MemoryManager,
    /// Current process bookkeeping
    pub process: &'a dyn ProcessControl,
    /// Descriptor I/O
    pub files: &'a dyn FileTable,
    /// Per-CPU primitives
    pub cpu: &'a dyn CpuOps,
}

/// Dispatch state of one CPU.
struct CpuSlot {
    state: AtomicU8,
    masked: AtomicBool,
    depth: AtomicUsize,
}

/// What a nested trap has to put back when it leaves.
struct Outer {
    state: DispatchState,
    masked: bool,
}

impl CpuSlot {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(DispatchState::Idle as u8),
            masked: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> DispatchState {
        DispatchState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: DispatchState, masked: bool) {
        self.masked.store(masked, Ordering::Release);
        self.state.store(state as u8, Ordering::Release);
    }

    fn enter(&self, cpu: usize, frame: &TrapFrame) -> Outer {
        let outer = Outer {
            state: self.state(),
            masked: self.masked.load(Ordering::Acquire),
        };
        let accepted = match outer.state {
            DispatchState::Idle => true,
            DispatchState::HandlerRunning => !outer.masked,
            _ => false,
        };
        if !accepted {
            fatal(format_args!(
                "cpu{}: trap on vector {} while {:?} with interrupts masked\n{:?}",
                cpu,
                frame.vector(),
                outer.state,
                frame
            ));
        }

        self.depth.fetch_add(1, Ordering::AcqRel);
        self.set(DispatchState::TrapEntered, true);
        outer
    }

    fn leave(&self, outer: Outer) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
        self.set(outer.state, outer.masked);
    }
}

/// The architecture-independent trap dispatcher.
pub struct DispatchCore<'a> {
    vectors: VectorTable,
    services: Collaborators<'a>,
    config: DispatchConfig,
    stats: TrapStats,
    cpus: [CpuSlot; MAX_CPUS],
}

impl<'a> DispatchCore<'a> {
    /// Create a dispatcher over a built vector table.
    pub fn new(vectors: VectorTable, services: Collaborators<'a>, config: DispatchConfig) -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const IDLE: CpuSlot = CpuSlot::new();

        debug!(
            "dispatch: {} vectors on {}, controller {}, {} syscalls",
            vectors.len(),
            vectors.arch(),
            services.controller.name(),
            services.syscalls.iter().count()
        );
        Self {
            vectors,
            services,
            config,
            stats: TrapStats::new(),
            cpus: [IDLE; MAX_CPUS],
        }
    }

    /// Trap counters.
    #[inline]
    pub fn stats(&self) -> &TrapStats {
        &self.stats
    }

    /// Active configuration.
    #[inline]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// The vector table traps are dispatched from.
    #[inline]
    pub fn vectors(&self) -> &VectorTable {
        &self.vectors
    }

    /// Dispatch state of `cpu`; CPUs past [`MAX_CPUS`] read as idle.
    pub fn state(&self, cpu: usize) -> DispatchState {
        self.cpus.get(cpu).map_or(DispatchState::Idle, CpuSlot::state)
    }

    /// Traps currently in progress on `cpu`.
    pub fn nesting_depth(&self, cpu: usize) -> usize {
        self.cpus
            .get(cpu)
            .map_or(0, |slot| slot.depth.load(Ordering::Acquire))
    }

    /// Dispatch one trap.
    pub fn handle_trap(&self, frame: &mut TrapFrame) -> TrapOutcome {
        let cpu = self.services.cpu.cpu_id();
        let Some(slot) = self.cpus.get(cpu) else {
            fatal(format_args!("trap on cpu{} beyond {} supported", cpu, MAX_CPUS));
        };

        let outer = slot.enter(cpu, frame);
        let outcome = self.route(slot, frame);
        slot.set(DispatchState::Restoring, true);
        trace!("cpu{}: vector {} -> {:?}", cpu, frame.vector(), outcome);
        slot.leave(outer);
        outcome
    }

    fn route(&self, slot: &CpuSlot, frame: &mut TrapFrame) -> TrapOutcome {
        let Some(entry) = self.vectors.lookup_vector(frame.vector()) else {
            self.stats.record_trap(frame.vector(), TrapClass::Exception, false);
            slot.set(DispatchState::Classified, true);
            return self.default_fault(slot, frame);
        };

        let cause = arch::decode(frame, &entry);
        self.stats.record_trap(entry.vector, entry.class, entry.assigned);
        slot.set(DispatchState::Classified, true);

        match cause {
            TrapCause::Exception(kind) => self.exception(slot, frame, kind),
            TrapCause::Irq => self.irq(slot, frame),
            TrapCause::Syscall(abi) => self.syscall(slot, frame, abi),
            TrapCause::Unassigned => self.default_fault(slot, frame),
        }
    }

    fn exception(&self, slot: &CpuSlot, frame: &mut TrapFrame, kind: ExceptionKind) -> TrapOutcome {
        slot.set(DispatchState::HandlerRunning, true);

        match kind {
            ExceptionKind::PageFault { addr, access } if self.resolve(frame, addr, access) => {
                self.stats.record_fault_resolved();
                TrapOutcome::Resumed
            }
            ExceptionKind::Breakpoint => {
                info!("breakpoint at {:#x} ({} mode)", frame.pc(), frame.privilege());
                frame.advance_pc(arch::breakpoint_advance(frame));
                TrapOutcome::Resumed
            }
            ExceptionKind::Debug => {
                debug!("debug trap at {:#x}", frame.pc());
                TrapOutcome::Resumed
            }
            kind => self.fatal_exception(frame, kind),
        }
    }

    /// Ask the memory manager about a fault on a user range the origin may touch.
    fn resolve(&self, frame: &TrapFrame, addr: VirtAddr, access: AccessKind) -> bool {
        let guard = PrivilegeGuard::new(self.services.process.user_range(), frame.arch().layout());
        if !guard.is_valid_user_range(addr.as_usize(), 1, frame.privilege()) {
            return false;
        }
        self.services.memory.try_resolve_page_fault(addr, access) == FaultResolution::Resolved
    }

    fn default_fault(&self, slot: &CpuSlot, frame: &mut TrapFrame) -> TrapOutcome {
        slot.set(DispatchState::HandlerRunning, true);
        warn!("trap through unassigned vector {}", frame.vector());
        self.fatal_exception(frame, ExceptionKind::Other(frame.vector() as u64))
    }

    fn fatal_exception(&self, frame: &mut TrapFrame, kind: ExceptionKind) -> TrapOutcome {
        if kind.is_always_fatal() || frame.privilege() != PrivilegeLevel::User {
            fatal(format_args!(
                "{:?} in {} mode at {:#x}\n{:?}",
                kind,
                frame.privilege(),
                frame.pc(),
                frame
            ));
        }

        let process = self.services.process;
        warn!(
            "pid {}: {:?} at {:#x}, terminating thread",
            process.current_pid(),
            kind,
            frame.pc()
        );
        process.terminate_current(Termination::Fault(kind));
        self.stats.record_thread_killed();
        self.reschedule(frame, ScheduleReason::Terminated);
        TrapOutcome::ThreadTerminated
    }

    fn irq(&self, slot: &CpuSlot, frame: &mut TrapFrame) -> TrapOutcome {
        let controller = self.services.controller;
        let Some(irq) = controller.pending(frame.vector()) else {
            self.stats.record_spurious();
            warn!("{}: spurious interrupt on vector {}", controller.name(), frame.vector());
            return TrapOutcome::Spurious;
        };

        let mut guard = AckGuard::new(controller, irq);
        let entry = self.services.registry.lookup(irq).filter(|entry| entry.enabled);
        if let Some(entry) = entry {
            self.run_handler(slot, irq, entry.handler);
        }

        let timer = self.config.is_timer(irq);
        let handled = entry.is_some() || timer;
        if !handled {
            self.unhandled(irq, &mut guard);
        }
        drop(guard);

        if timer {
            self.reschedule(frame, ScheduleReason::Tick);
        }
        if handled {
            TrapOutcome::IrqHandled(irq)
        } else {
            TrapOutcome::Unhandled(irq)
        }
    }

    fn run_handler(&self, slot: &CpuSlot, irq: IrqNumber, handler: &dyn InterruptHandler) {
        let cpu = self.services.cpu;

        slot.set(DispatchState::HandlerRunning, false);
        cpu.enable_interrupts();
        let start = cpu.cycles();
        handler.handle(irq);
        let elapsed = cpu.cycles().wrapping_sub(start);
        cpu.disable_interrupts();
        slot.set(DispatchState::HandlerRunning, true);

        let budget = self.config.handler_budget_cycles;
        if budget > 0 && elapsed > budget {
            self.stats.record_overrun();
            warn!("{}: handler ran {} cycles, budget {}", irq, elapsed, budget);
        }
    }

    fn unhandled(&self, irq: IrqNumber, guard: &mut AckGuard<'_>) {
        let total = self.stats.record_unhandled();
        if total.is_power_of_two() {
            warn!("{}: no handler ({} unhandled so far)", irq, total);
        }

        match self.config.unhandled_irq_policy {
            UnhandledIrqPolicy::RecordAndContinue => {}
            UnhandledIrqPolicy::MaskLine => {
                warn!("{}: masking line without a handler", irq);
                guard.keep_masked();
            }
            UnhandledIrqPolicy::Panic => fatal(format_args!("{} has no handler", irq)),
        }
    }

    fn syscall(&self, slot: &CpuSlot, frame: &mut TrapFrame, abi: SyscallAbi) -> TrapOutcome {
        let services = &self.services;
        let env = SyscallEnv::new(services.process, services.files, services.scheduler);
        let number = abi.number(frame);
        let args = abi.args(frame);

        slot.set(DispatchState::HandlerRunning, false);
        services.cpu.enable_interrupts();
        let result = dispatch_syscall(services.syscalls, &env, number, args, frame);
        services.cpu.disable_interrupts();
        slot.set(DispatchState::HandlerRunning, true);

        if let Err(code) = result {
            self.stats.record_syscall_error(code);
            debug!("syscall {} failed: {}", number, code);
        }
        frame.set_return_value(encode_result(result));
        frame.advance_pc(abi.pc_advance);

        if let Some(reason) = env.take_deferred() {
            self.reschedule(frame, reason);
        } else if let Some(next) = env.take_switch() {
            frame.switch_to(&next);
        }
        TrapOutcome::Syscall(result)
    }

    fn reschedule(&self, frame: &mut TrapFrame, reason: ScheduleReason) {
        match self.services.scheduler.tick_or_yield(frame, reason) {
            NextContext::Switch(next) => frame.switch_to(&next),
            NextContext::Continue if reason == ScheduleReason::Terminated => {
                fatal(format_args!("scheduler resumed a terminated thread"))
            }
            NextContext::Continue => {}
        }
    }
}

impl TrapHandler for DispatchCore<'_> {
    fn handle_trap(&self, frame: &mut TrapFrame) -> TrapOutcome {
        DispatchCore::handle_trap(self, frame)
    }
}

impl DispatchCore<'static> {
    /// Route all traps into this dispatcher and load the vector table.
    ///
    /// Only the first installed dispatcher takes effect.
    pub fn install(&'static self) {
        if SINK.get().is_some() {
            warn!("dispatch: a dispatch core is already installed");
            return;
        }
        let sink: &'static dyn TrapHandler = self;
        SINK.call_once(|| sink);
        self.vectors.install();
        debug!("dispatch: installed for {}", self.vectors.arch());
    }
}
