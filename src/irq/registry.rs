//! Interrupt Handler Registry
//!
//! A fixed arena indexed by IRQ number holding at most one handler per line.
//!
//! # Design
//! - One spinlock over the whole arena, held only to copy an entry in or out
//! - Writers hold it with local interrupts masked, since dispatch takes it
//!   from interrupt context
//! - `lookup` returns a copy, so handlers always run with the lock released
//! - Every registration gets a fresh generation; handles carry it, so a
//!   handle from an earlier registration of the same line is stale

use core::fmt;

use log::debug;
use spin::Mutex;

use super::{IrqNumber, MAX_IRQS};
use crate::arch::without_interrupts;

/// Device interrupt handler.
pub trait InterruptHandler: Send + Sync {
    /// Service the device behind `irq`.
    fn handle(&self, irq: IrqNumber);
}

impl<F> InterruptHandler for F
where
    F: Fn(IrqNumber) + Send + Sync,
{
    fn handle(&self, irq: IrqNumber) {
        self(irq)
    }
}

/// Identifier of the driver owning a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DriverId(pub u32);

/// One occupied slot of the arena.
#[derive(Clone, Copy)]
pub struct InterruptHandlerEntry {
    /// Line served.
    pub irq: IrqNumber,
    /// Owner.
    pub driver: DriverId,
    /// Handler to run.
    pub handler: &'static dyn InterruptHandler,
    /// Disabled entries are skipped by dispatch.
    pub enabled: bool,
    /// Registration generation.
    pub generation: u32,
}

impl fmt::Debug for InterruptHandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Handler({}, driver={}, enabled={}, gen={})",
            self.irq, self.driver.0, self.enabled, self.generation
        )
    }
}

/// Proof of a registration, needed to change or remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationHandle {
    irq: IrqNumber,
    generation: u32,
}

impl RegistrationHandle {
    /// Line the handle refers to.
    #[inline]
    pub const fn irq(&self) -> IrqNumber {
        self.irq
    }
}

/// Error type for registry operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// The line already has a handler.
    AlreadyRegistered,
    /// The handle does not name a live registration.
    NotFound,
    /// The line is outside the arena.
    InvalidIrq,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRegistered => write!(f, "line already has a handler"),
            Self::NotFound => write!(f, "no such registration"),
            Self::InvalidIrq => write!(f, "IRQ number out of range"),
        }
    }
}

struct Slots {
    entries: [Option<InterruptHandlerEntry>; MAX_IRQS],
    next_generation: u32,
}

impl Slots {
    fn live(
        &mut self,
        handle: RegistrationHandle,
    ) -> Result<&mut InterruptHandlerEntry, RegistryError> {
        self.entries
            .get_mut(handle.irq.as_usize())
            .ok_or(RegistryError::InvalidIrq)?
            .as_mut()
            .filter(|entry| entry.generation == handle.generation)
            .ok_or(RegistryError::NotFound)
    }
}

/// IRQ-indexed handler arena.
pub struct HandlerRegistry {
    inner: Mutex<Slots>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub const fn new() -> Self {
        const EMPTY: Option<InterruptHandlerEntry> = None;
        Self {
            inner: Mutex::new(Slots {
                entries: [EMPTY; MAX_IRQS],
                next_generation: 1,
            }),
        }
    }

    /// Attach `handler` to `irq`.
    ///
    /// The entry starts enabled.
    pub fn register(
        &self,
        irq: IrqNumber,
        driver: DriverId,
        handler: &'static dyn InterruptHandler,
    ) -> Result<RegistrationHandle, RegistryError> {
        let generation = without_interrupts(|| -> Result<u32, RegistryError> {
            let mut slots = self.inner.lock();
            let generation = slots.next_generation;
            let slot = slots
                .entries
                .get_mut(irq.as_usize())
                .ok_or(RegistryError::InvalidIrq)?;
            if slot.is_some() {
                return Err(RegistryError::AlreadyRegistered);
            }

            *slot = Some(InterruptHandlerEntry {
                irq,
                driver,
                handler,
                enabled: true,
                generation,
            });
            slots.next_generation = generation.wrapping_add(1).max(1);
            Ok(generation)
        })?;

        debug!("registry: {} -> driver {}", irq, driver.0);
        Ok(RegistrationHandle { irq, generation })
    }

    /// Remove the registration named by `handle`.
    pub fn unregister(&self, handle: RegistrationHandle) -> Result<(), RegistryError> {
        without_interrupts(|| -> Result<(), RegistryError> {
            let mut slots = self.inner.lock();
            slots.live(handle)?;
            slots.entries[handle.irq.as_usize()] = None;
            Ok(())
        })?;

        debug!("registry: {} released", handle.irq);
        Ok(())
    }

    /// Copy of the entry for `irq`, if any.
    pub fn lookup(&self, irq: IrqNumber) -> Option<InterruptHandlerEntry> {
        self.inner.lock().entries.get(irq.as_usize()).copied().flatten()
    }

    /// Enable or disable a registration without removing it.
    pub fn set_enabled(
        &self,
        handle: RegistrationHandle,
        enabled: bool,
    ) -> Result<(), RegistryError> {
        without_interrupts(|| -> Result<(), RegistryError> {
            self.inner.lock().live(handle)?.enabled = enabled;
            Ok(())
        })
    }

    /// Whether `irq` currently has a handler.
    pub fn is_registered(&self, irq: IrqNumber) -> bool {
        self.lookup(irq).is_some()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
