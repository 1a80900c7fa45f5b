//! Vector Table Builder
//!
//! Builds the fixed-size hardware trap table of an architecture. Every slot
//! is populated: vectors without a defined meaning are marked unassigned and
//! still lead into the common trampoline, where the dispatch core routes them
//! to the default fault handler.
//!
//! | Arch    | Slots | Entry points                              |
//! |---------|-------|-------------------------------------------|
//! | x86_64  | 256   | one 16-byte stub per vector               |
//! | AArch64 | 16    | VBAR_EL1 entries, 0x80 apart              |
//! | RISC-V  | 32    | single direct-mode `stvec` trampoline     |

use core::fmt;

use log::debug;

use crate::arch::{self, Arch};
use crate::privilege::PrivilegeLevel;

/// Largest table of any supported architecture.
pub const MAX_VECTORS: usize = 256;

/// Handler class of a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapClass {
    /// Synchronous CPU fault
    Exception,
    /// Asynchronous device interrupt
    HardwareIrq,
    /// Instruction-raised trap (system call)
    SoftwareTrap,
}

impl fmt::Display for TrapClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exception => write!(f, "exception"),
            Self::HardwareIrq => write!(f, "irq"),
            Self::SoftwareTrap => write!(f, "software trap"),
        }
    }
}

/// One slot of the vector table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorTableEntry {
    /// Vector number
    pub vector: usize,
    /// Handler class
    pub class: TrapClass,
    /// Trampoline entry address
    pub target: usize,
    /// Lowest privilege allowed to raise the vector with an instruction
    pub min_privilege: PrivilegeLevel,
    /// Whether the vector has a defined meaning
    pub assigned: bool,
}

impl VectorTableEntry {
    const EMPTY: Self = Self {
        vector: 0,
        class: TrapClass::Exception,
        target: 0,
        min_privilege: PrivilegeLevel::Kernel,
        assigned: false,
    };
}

/// The hardware trap table of one architecture.
///
/// Built once at init and never modified afterwards.
#[derive(Clone)]
pub struct VectorTable {
    arch: Arch,
    base: usize,
    len: usize,
    entries: [VectorTableEntry; MAX_VECTORS],
}

impl VectorTable {
    /// Build the table for `arch` with trampolines starting at `trampoline_base`.
    pub fn build(arch: Arch, trampoline_base: usize) -> Self {
        let len = arch.vector_count();
        let stride = arch.vector_stride();
        let mut entries = [VectorTableEntry::EMPTY; MAX_VECTORS];

        for (vector, slot) in entries.iter_mut().enumerate().take(len) {
            let info = arch.vector_info(vector);
            *slot = VectorTableEntry {
                vector,
                class: info.class,
                target: trampoline_base + vector * stride,
                min_privilege: info.min_privilege,
                assigned: info.assigned,
            };
        }

        let assigned = entries[..len].iter().filter(|e| e.assigned).count();
        debug!(
            "{}: vector table at {:#x}, {} slots, {} assigned",
            arch, trampoline_base, len, assigned
        );

        Self {
            arch,
            base: trampoline_base,
            len,
            entries,
        }
    }

    /// Entry for vector `v`, or `None` past the end of the table.
    #[inline]
    pub fn lookup_vector(&self, v: usize) -> Option<VectorTableEntry> {
        self.entries().get(v).copied()
    }

    /// All populated entries.
    #[inline]
    pub fn entries(&self) -> &[VectorTableEntry] {
        &self.entries[..self.len]
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the table has no slots (never true for a built table).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Architecture the table was built for.
    #[inline]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Address of the first trampoline entry.
    #[inline]
    pub fn base(&self) -> usize {
        self.base
    }

    /// Write the table into the architecture's vector base register.
    pub fn install(&self) {
        arch::install_vector_table(self);
    }
}

impl fmt::Debug for VectorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorTable")
            .field("arch", &self.arch)
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &self.len)
            .finish()
    }
}

/// Build the table for the architecture being compiled for.
///
/// Returns `None` on targets that are not one of the supported
/// architectures.
pub fn build_vector_table() -> Option<VectorTable> {
    Arch::current().map(|arch| VectorTable::build(arch, arch::trampoline_base()))
}
