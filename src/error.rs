//! Crate-wide error type.
//!
//! Every fallible public operation returns [`Result<T>`]. There is no
//! `unwrap()`/`expect()` outside test code; violations of an internal
//! invariant (a logic bug, not an environmental failure) use `panic!`/
//! `assert!` instead of being folded into this enum.

use core::fmt;

/// Error kinds produced by the virtual-memory and filesystem cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Physical memory and swap are both exhausted (ENOMEM).
    NoMemory,
    /// Faulting address outside all regions, or a permission violation (EFAULT).
    Fault,
    /// Malformed argument: bad heap shrink, corrupt superblock magic, ... (EINVAL).
    Invalid,
    /// Unrecoverable device error during read or write (EIO).
    Io,
    /// Resource busy, e.g. unmount while files are open (EBUSY).
    Busy,
    /// Swap bitmap (or freemap) is full (ENOSPC).
    NoSpace,
    /// Device block size incompatible with the filesystem (ENXIO).
    NoDevice,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoMemory => write!(f, "out of memory"),
            Error::Fault => write!(f, "bad address"),
            Error::Invalid => write!(f, "invalid argument"),
            Error::Io => write!(f, "I/O error"),
            Error::Busy => write!(f, "resource busy"),
            Error::NoSpace => write!(f, "no space left on device"),
            Error::NoDevice => write!(f, "no such device"),
        }
    }
}

impl std::error::Error for Error {}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_text_is_distinct_per_variant() {
        let variants = [
            Error::NoMemory,
            Error::Fault,
            Error::Invalid,
            Error::Io,
            Error::Busy,
            Error::NoSpace,
            Error::NoDevice,
        ];
        let mut seen = std::collections::HashSet::new();
        for v in variants {
            assert!(seen.insert(v.to_string()), "duplicate Display text for {v:?}");
        }
    }
}
