// Kernel error handling and errno definitions

/// POSIX-style error numbers used by the concurrency core.
///
/// Fallible operations return `Result<T>`; the syscall boundary converts
/// an `Errno` to a negative integer with [`Errno::as_isize`].
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,       // Operation not permitted
    ENOENT = 2,      // No such entry
    ESRCH = 3,       // No such thread or thread group
    EINTR = 4,       // Interrupted wait
    ECHILD = 10,     // No child threads
    EAGAIN = 11,     // Try again / would block
    ENOMEM = 12,     // Out of memory
    EBUSY = 16,      // Resource busy
    EEXIST = 17,     // Slot already occupied
    ENODEV = 19,     // No such device / no handler
    EINVAL = 22,     // Invalid argument
    ENOTEMPTY = 39,  // Target not empty
    ENODATA = 61,    // No data available
    ETIMEDOUT = 110, // Timer-driven wake
    EALREADY = 114,  // Operation already in progress
}

pub type Result<T> = core::result::Result<T, Errno>;

impl Errno {
    /// Negative errno for the syscall return convention.
    pub fn as_isize(self) -> isize {
        -(self as i32 as isize)
    }

    /// Raw errno value stored in waiter slots (positive).
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Reconstruct an errno from a waiter error slot.
    pub fn from_i32(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Errno::EPERM),
            2 => Some(Errno::ENOENT),
            3 => Some(Errno::ESRCH),
            4 => Some(Errno::EINTR),
            10 => Some(Errno::ECHILD),
            11 => Some(Errno::EAGAIN),
            12 => Some(Errno::ENOMEM),
            16 => Some(Errno::EBUSY),
            17 => Some(Errno::EEXIST),
            19 => Some(Errno::ENODEV),
            22 => Some(Errno::EINVAL),
            39 => Some(Errno::ENOTEMPTY),
            61 => Some(Errno::ENODATA),
            110 => Some(Errno::ETIMEDOUT),
            114 => Some(Errno::EALREADY),
            _ => None,
        }
    }

    /// Get a static string description of the error
    pub fn description(self) -> &'static str {
        match self {
            Errno::EPERM => "Operation not permitted",
            Errno::ENOENT => "No such entry",
            Errno::ESRCH => "No such thread",
            Errno::EINTR => "Interrupted wait",
            Errno::ECHILD => "No child threads",
            Errno::EAGAIN => "Try again",
            Errno::ENOMEM => "Out of memory",
            Errno::EBUSY => "Resource busy",
            Errno::EEXIST => "Already exists",
            Errno::ENODEV => "No such device",
            Errno::EINVAL => "Invalid argument",
            Errno::ENOTEMPTY => "Not empty",
            Errno::ENODATA => "No data available",
            Errno::ETIMEDOUT => "Timed out",
            Errno::EALREADY => "Already in progress",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_negation() {
        assert_eq!(Errno::EINVAL.as_isize(), -22);
        assert_eq!(Errno::ESRCH.as_isize(), -3);
        assert_eq!(Errno::ETIMEDOUT.as_isize(), -110);
    }

    #[test]
    fn test_errno_round_trip() {
        for e in [
            Errno::EPERM,
            Errno::EINTR,
            Errno::EAGAIN,
            Errno::EEXIST,
            Errno::ENODATA,
            Errno::ENOTEMPTY,
            Errno::ETIMEDOUT,
        ] {
            assert_eq!(Errno::from_i32(e.as_i32()), Some(e));
        }
        assert_eq!(Errno::from_i32(0), None);
        assert_eq!(Errno::from_i32(-4), None);
    }
}
