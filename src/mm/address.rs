//! Virtual Address Types and Address Space Layouts
//!
//! Type-safe wrapper for virtual addresses plus the per-architecture split
//! between the user half and the kernel half of the address space.
//!
//! # Layouts
//! | Arch    | Paging | User top                |
//! |---------|--------|-------------------------|
//! | x86_64  | 4-level| `0x0000_8000_0000_0000` |
//! | AArch64 | 48-bit | `0x0001_0000_0000_0000` |
//! | RISC-V  | Sv39   | `0x0000_0040_0000_0000` |

use core::fmt;

use crate::arch::Arch;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// Kind of memory access that caused a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    /// Data load
    Read,
    /// Data store
    Write,
    /// Instruction fetch
    Execute,
}

/// Split of the virtual address space for one architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressLayout {
    /// First address past the user half.
    pub user_top: usize,
}

impl AddressLayout {
    /// x86_64 with 4-level paging.
    pub const X86_64: Self = Self {
        user_top: 0x0000_8000_0000_0000,
    };

    /// AArch64 with 48-bit TTBR0/TTBR1 split.
    pub const AARCH64: Self = Self {
        user_top: 0x0001_0000_0000_0000,
    };

    /// RISC-V Sv39.
    pub const RISCV64_SV39: Self = Self {
        user_top: 0x0000_0040_0000_0000,
    };

    /// Layout used on the given architecture.
    pub const fn for_arch(arch: Arch) -> Self {
        match arch {
            Arch::X86_64 => Self::X86_64,
            Arch::Aarch64 => Self::AARCH64,
            Arch::Riscv64 => Self::RISCV64_SV39,
        }
    }

    /// Check whether `[start, end)` touches the kernel half.
    ///
    /// Non-canonical holes count as kernel space: nothing in them may be
    /// handed out to user code.
    #[inline]
    pub const fn overlaps_kernel(&self, start: usize, end: usize) -> bool {
        end > self.user_top || start >= self.user_top
    }
}

/// A virtual memory address, as reported by the CPU.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Wrap a raw address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#018x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}
