//! Test doubles for the hardware and kernel seams.

use std::boxed::Box;
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::vec::Vec;

use crate::dispatch::{
    CpuOps, FaultResolution, FileTable, IoProgress, MemoryManager, NextContext, ProcessControl,
    ScheduleReason, Scheduler, Termination,
};
use crate::error::ErrorCode;
use crate::frame::TrapFrame;
use crate::irq::plic::{LocalCsr, SiFlags};
use crate::irq::{ControllerError, InterruptController, IrqNumber, RegisterIo, TriggerMode};
use crate::mm::{AccessKind, VirtAddr, PAGE_SIZE};
use crate::privilege::UserRange;
use crate::syscall::UserBuffer;

std::thread_local! {
    static MASK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Hosted stand-in for masking local interrupts, tracked per test thread.
pub fn masked<R>(f: impl FnOnce() -> R) -> R {
    MASK_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let result = f();
    MASK_DEPTH.with(|depth| depth.set(depth.get() - 1));
    result
}

/// Whether the calling test thread is inside [`masked`].
pub fn interrupts_masked() -> bool {
    MASK_DEPTH.with(|depth| depth.get() > 0)
}

/// Byte-addressed register file that records every write.
#[derive(Default)]
pub struct FakeRegisters {
    mem: Mutex<BTreeMap<usize, u8>>,
    sticky_reads: Mutex<BTreeMap<usize, u32>>,
    queued_reads: Mutex<BTreeMap<usize, VecDeque<u32>>>,
    writes: Mutex<Vec<(usize, u32)>>,
    reads: Mutex<Vec<usize>>,
    unmasked: AtomicUsize,
}

impl FakeRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload a 32-bit value without recording a write.
    pub fn set(&self, offset: usize, value: u32) {
        let mut mem = self.mem.lock().unwrap();
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            mem.insert(offset + i, byte);
        }
    }

    /// Every read of `offset` returns `value` regardless of writes.
    pub fn on_read(&self, offset: usize, value: u32) {
        self.sticky_reads.lock().unwrap().insert(offset, value);
    }

    /// The next reads of `offset` return `values` in order.
    pub fn queue_reads(&self, offset: usize, values: &[u32]) {
        self.queued_reads
            .lock()
            .unwrap()
            .entry(offset)
            .or_default()
            .extend(values.iter().copied());
    }

    /// Values written exactly at `offset`, oldest first.
    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Accesses made while interrupts were not masked.
    pub fn unmasked_accesses(&self) -> usize {
        self.unmasked.load(Ordering::SeqCst)
    }

    fn note_access(&self) {
        if !interrupts_masked() {
            self.unmasked.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Number of reads of `offset`.
    pub fn reads_of(&self, offset: usize) -> usize {
        self.reads.lock().unwrap().iter().filter(|o| **o == offset).count()
    }

    fn override_for(&self, offset: usize) -> Option<u32> {
        if let Some(value) = self
            .queued_reads
            .lock()
            .unwrap()
            .get_mut(&offset)
            .and_then(VecDeque::pop_front)
        {
            return Some(value);
        }
        self.sticky_reads.lock().unwrap().get(&offset).copied()
    }

    fn load(&self, offset: usize, width: usize) -> u32 {
        self.note_access();
        self.reads.lock().unwrap().push(offset);
        if let Some(value) = self.override_for(offset) {
            return value;
        }
        let mem = self.mem.lock().unwrap();
        (0..width).fold(0, |acc, i| {
            acc | (*mem.get(&(offset + i)).unwrap_or(&0) as u32) << (8 * i)
        })
    }

    fn store(&self, offset: usize, value: u32, width: usize) {
        self.note_access();
        self.writes.lock().unwrap().push((offset, value));
        let mut mem = self.mem.lock().unwrap();
        for (i, byte) in value.to_le_bytes().into_iter().take(width).enumerate() {
            mem.insert(offset + i, byte);
        }
    }
}

impl RegisterIo for FakeRegisters {
    fn read32(&self, offset: usize) -> u32 {
        self.load(offset, 4)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.store(offset, value, 4);
    }

    fn read8(&self, offset: usize) -> u8 {
        self.load(offset, 1) as u8
    }

    fn write8(&self, offset: usize, value: u8) {
        self.store(offset, value as u32, 1);
    }
}

/// `sie`/`sip` of one hart; every local line starts enabled.
pub struct FakeCsr {
    sie: Mutex<SiFlags>,
    cleared: Mutex<Vec<SiFlags>>,
}

impl FakeCsr {
    pub fn new() -> Self {
        Self {
            sie: Mutex::new(SiFlags::all()),
            cleared: Mutex::new(Vec::new()),
        }
    }

    /// Current `sie`.
    pub fn enabled(&self) -> SiFlags {
        *self.sie.lock().unwrap()
    }

    /// Every `sip` clear, in order.
    pub fn pending_cleared(&self) -> Vec<SiFlags> {
        self.cleared.lock().unwrap().clone()
    }
}

impl LocalCsr for FakeCsr {
    fn enable(&self, flags: SiFlags) {
        self.sie.lock().unwrap().insert(flags);
    }

    fn disable(&self, flags: SiFlags) {
        self.sie.lock().unwrap().remove(flags);
    }

    fn clear_pending(&self, flags: SiFlags) {
        self.cleared.lock().unwrap().push(flags);
    }
}

/// One call into a [`FakeController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCall {
    Mask(u32),
    Unmask(u32),
    Acknowledge(u32),
    Eoi(u32),
}

/// Controller that maps `vector - irq_base` to a line and records calls.
pub struct FakeController {
    irq_base: usize,
    level: Mutex<BTreeSet<u32>>,
    masked: Mutex<BTreeSet<u32>>,
    spurious: Mutex<BTreeSet<usize>>,
    calls: Mutex<Vec<ControllerCall>>,
}

impl FakeController {
    pub fn new() -> Self {
        Self::with_base(32)
    }

    pub fn with_base(irq_base: usize) -> Self {
        Self {
            irq_base,
            level: Mutex::new(BTreeSet::new()),
            masked: Mutex::new(BTreeSet::new()),
            spurious: Mutex::new(BTreeSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_level(&self, irq: IrqNumber) {
        self.level.lock().unwrap().insert(irq.0);
    }

    pub fn set_spurious(&self, vector: usize) {
        self.spurious.lock().unwrap().insert(vector);
    }

    pub fn calls(&self) -> Vec<ControllerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn eoi_count(&self, irq: IrqNumber) -> usize {
        self.count(ControllerCall::Eoi(irq.0))
    }

    pub fn count(&self, call: ControllerCall) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == call).count()
    }

    pub fn is_masked(&self, irq: IrqNumber) -> bool {
        self.masked.lock().unwrap().contains(&irq.0)
    }

    fn record(&self, call: ControllerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl InterruptController for FakeController {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn trigger_mode(&self, irq: IrqNumber) -> TriggerMode {
        if self.level.lock().unwrap().contains(&irq.0) {
            TriggerMode::Level
        } else {
            TriggerMode::Edge
        }
    }

    fn pending(&self, vector: usize) -> Option<IrqNumber> {
        if self.spurious.lock().unwrap().contains(&vector) {
            return None;
        }
        vector
            .checked_sub(self.irq_base)
            .map(|irq| IrqNumber(irq as u32))
    }

    fn mask(&self, irq: IrqNumber) {
        self.masked.lock().unwrap().insert(irq.0);
        self.record(ControllerCall::Mask(irq.0));
    }

    fn unmask(&self, irq: IrqNumber) {
        self.masked.lock().unwrap().remove(&irq.0);
        self.record(ControllerCall::Unmask(irq.0));
    }

    fn acknowledge(&self, irq: IrqNumber) {
        self.record(ControllerCall::Acknowledge(irq.0));
    }

    fn end_of_interrupt(&self, irq: IrqNumber) {
        self.record(ControllerCall::Eoi(irq.0));
    }

    fn set_priority(&self, _irq: IrqNumber, _level: u8) -> Result<(), ControllerError> {
        Err(ControllerError::PriorityUnsupported)
    }
}

/// Scheduler that records every call and replies from a queue.
///
/// An empty queue replies [`NextContext::Continue`].
#[derive(Default)]
pub struct FakeScheduler {
    calls: Mutex<Vec<(ScheduleReason, TrapFrame)>>,
    replies: Mutex<VecDeque<NextContext>>,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, next: NextContext) {
        self.replies.lock().unwrap().push_back(next);
    }

    pub fn reasons(&self) -> Vec<ScheduleReason> {
        self.calls.lock().unwrap().iter().map(|(r, _)| *r).collect()
    }

    /// Frames as the scheduler saw them.
    pub fn frames(&self) -> Vec<TrapFrame> {
        self.calls.lock().unwrap().iter().map(|(_, f)| *f).collect()
    }
}

impl Scheduler for FakeScheduler {
    fn tick_or_yield(&self, current: &TrapFrame, reason: ScheduleReason) -> NextContext {
        self.calls.lock().unwrap().push((reason, *current));
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(NextContext::Continue)
    }
}

/// Memory manager that resolves faults on a set of pages.
#[derive(Default)]
pub struct FakeMemory {
    backed: Mutex<BTreeSet<usize>>,
    faults: Mutex<Vec<(VirtAddr, AccessKind)>>,
    on_fault: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Faults on the page holding `addr` resolve.
    pub fn back(&self, addr: usize) {
        self.backed.lock().unwrap().insert(addr & !(PAGE_SIZE - 1));
    }

    /// Run `hook` inside every resolution attempt.
    pub fn on_fault(&self, hook: impl Fn() + Send + 'static) {
        *self.on_fault.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn faults(&self) -> Vec<(VirtAddr, AccessKind)> {
        self.faults.lock().unwrap().clone()
    }
}

impl MemoryManager for FakeMemory {
    fn try_resolve_page_fault(&self, addr: VirtAddr, access: AccessKind) -> FaultResolution {
        self.faults.lock().unwrap().push((addr, access));
        if let Some(hook) = self.on_fault.lock().unwrap().as_ref() {
            hook();
        }
        if self.backed.lock().unwrap().contains(&(addr.as_usize() & !(PAGE_SIZE - 1))) {
            FaultResolution::Resolved
        } else {
            FaultResolution::Unresolvable
        }
    }
}

/// Single-process bookkeeping.
pub struct FakeProcess {
    pid: usize,
    window: UserRange,
    signal: AtomicBool,
    terminations: Mutex<Vec<Termination>>,
}

impl FakeProcess {
    pub fn new(pid: usize, window: UserRange) -> Self {
        Self {
            pid,
            window,
            signal: AtomicBool::new(false),
            terminations: Mutex::new(Vec::new()),
        }
    }

    pub fn raise_signal(&self) {
        self.signal.store(true, Ordering::SeqCst);
    }

    pub fn terminations(&self) -> Vec<Termination> {
        self.terminations.lock().unwrap().clone()
    }
}

impl ProcessControl for FakeProcess {
    fn current_pid(&self) -> usize {
        self.pid
    }

    fn user_range(&self) -> UserRange {
        self.window
    }

    fn terminate_current(&self, reason: Termination) {
        self.terminations.lock().unwrap().push(reason);
    }

    fn signal_pending(&self) -> bool {
        self.signal.load(Ordering::SeqCst)
    }
}

/// Descriptor table with stdout/stderr for writing and stdin for reading.
///
/// Buffers are dereferenced, so tests must hand in addresses of live memory.
#[derive(Default)]
pub struct FakeFiles {
    written: Mutex<Vec<(usize, Vec<u8>)>>,
    pending_reads: Mutex<VecDeque<Option<Vec<u8>>>>,
}

impl FakeFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next read returns `data`, or would block for `None`. With nothing
    /// queued, reads hit end of file.
    pub fn queue_read(&self, data: Option<&[u8]>) {
        self.pending_reads
            .lock()
            .unwrap()
            .push_back(data.map(<[u8]>::to_vec));
    }

    pub fn written(&self) -> Vec<(usize, Vec<u8>)> {
        self.written.lock().unwrap().clone()
    }
}

impl FileTable for FakeFiles {
    fn write(&self, fd: usize, buf: UserBuffer) -> Result<usize, ErrorCode> {
        if fd != 1 && fd != 2 {
            return Err(ErrorCode::Ebadf);
        }
        // SAFETY: tests pass buffers that are live host memory.
        let bytes = unsafe { buf.as_bytes() }.to_vec();
        self.written.lock().unwrap().push((fd, bytes));
        Ok(buf.len())
    }

    fn read(&self, fd: usize, buf: UserBuffer) -> Result<IoProgress, ErrorCode> {
        if fd != 0 {
            return Err(ErrorCode::Ebadf);
        }
        match self.pending_reads.lock().unwrap().pop_front() {
            None => Ok(IoProgress::Done(0)),
            Some(None) => Ok(IoProgress::WouldBlock),
            Some(Some(data)) => {
                let n = data.len().min(buf.len());
                // SAFETY: tests pass buffers that are live host memory.
                (unsafe { buf.as_bytes_mut() })[..n].copy_from_slice(&data[..n]);
                Ok(IoProgress::Done(n))
            }
        }
    }
}

/// CPU with a software interrupt flag and a stepping cycle counter.
pub struct FakeCpu {
    id: AtomicUsize,
    enabled: AtomicBool,
    now: AtomicU64,
    step: AtomicU64,
}

impl FakeCpu {
    pub fn new() -> Self {
        Self {
            id: AtomicUsize::new(0),
            enabled: AtomicBool::new(false),
            now: AtomicU64::new(0),
            step: AtomicU64::new(1),
        }
    }

    pub fn set_id(&self, id: usize) {
        self.id.store(id, Ordering::SeqCst);
    }

    /// Every read of the cycle counter advances it by `cycles`.
    pub fn set_cycle_step(&self, cycles: u64) {
        self.step.store(cycles, Ordering::SeqCst);
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl CpuOps for FakeCpu {
    fn cpu_id(&self) -> usize {
        self.id.load(Ordering::SeqCst)
    }

    fn enable_interrupts(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn disable_interrupts(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn cycles(&self) -> u64 {
        let step = self.step.load(Ordering::SeqCst);
        self.now.fetch_add(step, Ordering::SeqCst)
    }
}
