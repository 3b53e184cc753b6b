//! Kernel error codes.
//!
//! Every fallible kernel operation returns [`KernelResult`]. The tag set is
//! closed on purpose: recovery is always local (allocators roll back partial
//! work, waiters revert their bookkeeping), and anything that cannot be
//! reported this way is a `panic!`, which prints the failing location and
//! halts the machine.

use core::fmt;

/// Closed set of kernel error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Malformed argument: unaligned address, out-of-bounds index,
    /// operation on an object in the wrong state.
    Invalid,
    /// No physical frame, virtual range or slab object available.
    OutOfMemory,
    /// The resource is held by someone else (non-blocking acquisition
    /// failed, or a wait queue is not empty on dispose).
    Busy,
    /// A blocking call was cut short: timeout expiry or a wakeup coming
    /// from outside the queue the caller was waiting on.
    Interrupted,
    /// The operation is not supported by this kernel.
    Unsupported,
    /// The caller is not allowed to perform the operation (e.g. unlocking
    /// a mutex it does not own).
    PermissionDenied,
    /// An unrecoverable condition was detected but could still be reported
    /// to the caller (e.g. waking up a zombie thread).
    Fatal,
}

/// Result alias used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::Invalid => "invalid argument",
            KernelError::OutOfMemory => "out of memory",
            KernelError::Busy => "resource busy",
            KernelError::Interrupted => "interrupted",
            KernelError::Unsupported => "operation not supported",
            KernelError::PermissionDenied => "permission denied",
            KernelError::Fatal => "fatal error",
        };
        f.write_str(msg)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_stable() {
        assert_eq!(std::format!("{}", KernelError::OutOfMemory), "out of memory");
        assert_eq!(std::format!("{}", KernelError::Busy), "resource busy");
    }
}
