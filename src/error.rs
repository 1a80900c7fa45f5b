//! Error Code Taxonomy
//!
//! The closed set of errors a system call can report back to user code.
//! Numeric values are stable ABI: they are returned negated in the
//! architecture's syscall return register.

use core::fmt;

/// System call error codes.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Insufficient privilege for the requested operation
    Eperm = 1,
    /// Interrupted at a yield point by a pending signal
    Eintr = 4,
    /// Bad file descriptor
    Ebadf = 9,
    /// Bad address (invalid pointer or range)
    Efault = 14,
    /// Invalid argument count or shape
    Einval = 22,
    /// Invalid system call number
    Enosys = 38,
}

impl ErrorCode {
    /// All codes, in ascending numeric order.
    pub const ALL: [ErrorCode; 6] = [
        ErrorCode::Eperm,
        ErrorCode::Eintr,
        ErrorCode::Ebadf,
        ErrorCode::Efault,
        ErrorCode::Einval,
        ErrorCode::Enosys,
    ];

    /// Positive errno value.
    #[inline]
    pub const fn errno(self) -> i64 {
        self as i64
    }

    /// Value placed in the syscall return register: `-errno`.
    #[inline]
    pub const fn encode(self) -> u64 {
        (-(self as i64)) as u64
    }

    /// Decode a raw return register value back into an error, if it is one.
    ///
    /// Only values in the top 4095 of the register range are errors; this is
    /// the convention shared by all three supported ABIs.
    pub fn decode(raw: u64) -> Option<Self> {
        let value = raw as i64;
        if !(-4095..0).contains(&value) {
            return None;
        }
        Self::ALL.iter().copied().find(|e| e.errno() == -value)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Eperm => "operation not permitted",
            Self::Eintr => "interrupted system call",
            Self::Ebadf => "bad file descriptor",
            Self::Efault => "bad address",
            Self::Einval => "invalid argument",
            Self::Enosys => "function not implemented",
        };
        write!(f, "{} (errno {})", name, self.errno())
    }
}

/// Encode a syscall result for the return register.
#[inline]
pub fn encode_result(result: Result<usize, ErrorCode>) -> u64 {
    match result {
        Ok(value) => value as u64,
        Err(err) => err.encode(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_numbers() {
        assert_eq!(ErrorCode::Enosys.errno(), 38);
        assert_eq!(ErrorCode::Efault.errno(), 14);
        assert_eq!(ErrorCode::Einval.errno(), 22);
        assert_eq!(ErrorCode::Eperm.errno(), 1);
        assert_eq!(ErrorCode::Eintr.errno(), 4);
    }

    #[test]
    fn test_negative_encoding() {
        assert_eq!(ErrorCode::Enosys.encode() as i64, -38);
        assert_eq!(ErrorCode::decode(ErrorCode::Efault.encode()), Some(ErrorCode::Efault));
        assert_eq!(ErrorCode::decode(13), None);
        assert_eq!(encode_result(Ok(13)), 13);
    }
}
