//! Privilege Levels and the Privilege Guard
//!
//! Every architecture's privilege model is folded onto three ordered levels.
//!
//! | Level   | x86_64      | AArch64  | RISC-V |
//! |---------|-------------|----------|--------|
//! | User    | ring 3      | EL0      | U      |
//! | Kernel  | rings 0..=2 | EL1      | S      |
//! | Monitor | -           | EL2, EL3 | M      |
//!
//! The guard is the single place that decides whether a pointer handed over
//! from a lower privilege level may be touched. It is used both when
//! validating syscall arguments and when classifying page faults.
//!
//! # Security Principles
//! - Pure functions: no side effects, no global state
//! - Fail-secure: anything not provably inside the user window is rejected
//! - Overflow is checked before any range comparison

use core::fmt;

use crate::mm::AddressLayout;

/// Architecture-neutral privilege level, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PrivilegeLevel {
    /// Unprivileged application code
    User = 0,
    /// Supervisor / kernel
    Kernel = 1,
    /// Hypervisor or secure monitor
    Monitor = 2,
}

impl PrivilegeLevel {
    /// Map an x86_64 current privilege level (CS bits 1:0).
    #[inline]
    pub const fn from_x86_cpl(cpl: u8) -> Self {
        match cpl & 0b11 {
            3 => Self::User,
            _ => Self::Kernel,
        }
    }

    /// Map an AArch64 exception level.
    #[inline]
    pub const fn from_arm_el(el: u8) -> Self {
        match el & 0b11 {
            0 => Self::User,
            1 => Self::Kernel,
            _ => Self::Monitor,
        }
    }

    /// Map a RISC-V privilege mode encoding (U=0, S=1, M=3).
    #[inline]
    pub const fn from_riscv_mode(mode: u8) -> Self {
        match mode & 0b11 {
            0 => Self::User,
            1 => Self::Kernel,
            _ => Self::Monitor,
        }
    }

    /// x86_64 descriptor privilege level used in gates and selectors.
    #[inline]
    pub const fn x86_dpl(self) -> u8 {
        match self {
            Self::User => 3,
            Self::Kernel | Self::Monitor => 0,
        }
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Kernel => write!(f, "kernel"),
            Self::Monitor => write!(f, "monitor"),
        }
    }
}

/// The validated user address window of one thread, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRange {
    start: usize,
    end: usize,
}

impl UserRange {
    /// Create a window. An inverted range yields an empty window.
    #[inline]
    pub const fn new(start: usize, end: usize) -> Self {
        if end < start {
            Self { start, end: start }
        } else {
            Self { start, end }
        }
    }

    /// Window covering `len` bytes from `start`, clamped on overflow.
    #[inline]
    pub const fn from_base_len(start: usize, len: usize) -> Self {
        Self::new(start, start.saturating_add(len))
    }

    /// First address of the window.
    #[inline]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// First address past the window.
    #[inline]
    pub const fn end(&self) -> usize {
        self.end
    }

    /// Check whether `addr` lies inside the window.
    #[inline]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Shared predicate for user-pointer validation.
///
/// A guard value is cheap to build per trap from the current thread's window
/// and the architecture layout; holding it does not pin any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivilegeGuard {
    window: UserRange,
    layout: AddressLayout,
}

impl PrivilegeGuard {
    /// Create a guard for the given user window and address layout.
    #[inline]
    pub const fn new(window: UserRange, layout: AddressLayout) -> Self {
        Self { window, layout }
    }

    /// The user window this guard validates against.
    #[inline]
    pub const fn window(&self) -> UserRange {
        self.window
    }

    /// Check that `[ptr, ptr + len)` is a user range the requester may touch.
    ///
    /// # Checks
    /// 1. The requester is not the secure monitor
    /// 2. Pointer is not null
    /// 3. `ptr + len` does not overflow
    /// 4. The range does not reach into the kernel half
    /// 5. The range lies inside the calling thread's window
    ///
    /// Zero-length ranges are accepted when `ptr` is inside the window.
    pub fn is_valid_user_range(&self, ptr: usize, len: usize, requesting: PrivilegeLevel) -> bool {
        if requesting == PrivilegeLevel::Monitor {
            return false;
        }

        if ptr == 0 {
            return false;
        }

        let end = match ptr.checked_add(len) {
            Some(end) => end,
            None => return false,
        };

        if self.layout.overlaps_kernel(ptr, end) {
            return false;
        }

        if len == 0 {
            return self.window.contains(ptr);
        }

        ptr >= self.window.start && end <= self.window.end
    }

    /// Check that a caller at `caller` may use something requiring `required`.
    #[inline]
    pub const fn permits(caller: PrivilegeLevel, required: PrivilegeLevel) -> bool {
        caller as u8 >= required as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER_START: usize = 0x4000_0000;
    const USER_END: usize = 0x4008_0000;

    fn guard() -> PrivilegeGuard {
        PrivilegeGuard::new(UserRange::new(USER_START, USER_END), AddressLayout::AARCH64)
    }

    #[test]
    fn test_zero_length() {
        assert!(guard().is_valid_user_range(USER_START + 0x1000, 0, PrivilegeLevel::User));
        assert!(!guard().is_valid_user_range(USER_END, 0, PrivilegeLevel::User));
    }

    #[test]
    fn test_null_pointer() {
        assert!(!guard().is_valid_user_range(0, 100, PrivilegeLevel::User));
    }

    #[test]
    fn test_overflow() {
        assert!(!guard().is_valid_user_range(usize::MAX - 10, 100, PrivilegeLevel::User));
    }

    #[test]
    fn test_window_edges() {
        let g = guard();
        assert!(g.is_valid_user_range(USER_START, USER_END - USER_START, PrivilegeLevel::User));
        assert!(!g.is_valid_user_range(USER_START - 1, 2, PrivilegeLevel::User));
        assert!(!g.is_valid_user_range(USER_END - 1, 2, PrivilegeLevel::User));
    }

    #[test]
    fn test_kernel_space_rejected_even_inside_window() {
        // A misconfigured window that reaches into kernel space must not
        // widen what user pointers may cover.
        let g = PrivilegeGuard::new(UserRange::new(0x1000, usize::MAX), AddressLayout::X86_64);
        assert!(!g.is_valid_user_range(0xFFFF_8000_0000_0000, 8, PrivilegeLevel::User));
        assert!(!g.is_valid_user_range(0x0000_7FFF_FFFF_FFF8, 16, PrivilegeLevel::Kernel));
        assert!(g.is_valid_user_range(0x0000_7FFF_FFFF_FFF8, 8, PrivilegeLevel::Kernel));
    }

    #[test]
    fn test_monitor_never_consumes_user_pointers() {
        assert!(!guard().is_valid_user_range(USER_START, 16, PrivilegeLevel::Monitor));
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(PrivilegeLevel::from_x86_cpl(3), PrivilegeLevel::User);
        assert_eq!(PrivilegeLevel::from_x86_cpl(0), PrivilegeLevel::Kernel);
        assert_eq!(PrivilegeLevel::from_arm_el(0), PrivilegeLevel::User);
        assert_eq!(PrivilegeLevel::from_arm_el(1), PrivilegeLevel::Kernel);
        assert_eq!(PrivilegeLevel::from_arm_el(3), PrivilegeLevel::Monitor);
        assert_eq!(PrivilegeLevel::from_riscv_mode(1), PrivilegeLevel::Kernel);
        assert_eq!(PrivilegeLevel::from_riscv_mode(3), PrivilegeLevel::Monitor);
        assert!(PrivilegeGuard::permits(PrivilegeLevel::Kernel, PrivilegeLevel::User));
        assert!(!PrivilegeGuard::permits(PrivilegeLevel::User, PrivilegeLevel::Kernel));
    }
}
