//! Error handling for pod services.
//!
//! All fallible pod operations return small, matchable error codes. Outcomes
//! of an asynchronous wake-up (timeout, break, flush) are *not* errors; they
//! are reported through the woken thread's info mask so a single suspension
//! can be qualified after the fact.

use core::fmt;

/// Result type for pod operations.
pub type PodResult<T> = Result<T, Error>;

/// Error codes returned by pod services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Not enough memory to complete the operation
    Nomem,
    /// Invalid argument (unknown flag, empty affinity, bad period...)
    Inval,
    /// Target thread is in a conflicting state (already started...)
    Busy,
    /// Calling context or affinity forbids the operation
    Perm,
    /// A release point or deadline has been missed
    TimedOut,
    /// The operation needs a setup step that has not been done
    WouldBlock,
    /// The wait was forcibly interrupted
    Intr,
    /// The thread handle refers to a deleted thread
    Idrm,
    /// The object already exists
    Exist,
    /// The hardware timer could not be configured
    NoDev,
    /// No active pod, or the service is not available
    NoSys,
}

impl Error {
    /// The conventional negative code for this error.
    pub fn code(self) -> i32 {
        match self {
            Error::Nomem => -12,
            Error::Inval => -22,
            Error::Busy => -16,
            Error::Perm => -1,
            Error::TimedOut => -110,
            Error::WouldBlock => -11,
            Error::Intr => -4,
            Error::Idrm => -43,
            Error::Exist => -17,
            Error::NoDev => -19,
            Error::NoSys => -38,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Nomem => write!(f, "out of memory"),
            Error::Inval => write!(f, "invalid argument"),
            Error::Busy => write!(f, "conflicting thread state"),
            Error::Perm => write!(f, "operation not permitted"),
            Error::TimedOut => write!(f, "deadline missed"),
            Error::WouldBlock => write!(f, "operation would block"),
            Error::Intr => write!(f, "wait interrupted"),
            Error::Idrm => write!(f, "thread identity removed"),
            Error::Exist => write!(f, "object already exists"),
            Error::NoDev => write!(f, "timer hardware unavailable"),
            Error::NoSys => write!(f, "no active pod"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let all = [
            Error::Nomem,
            Error::Inval,
            Error::Busy,
            Error::Perm,
            Error::TimedOut,
            Error::WouldBlock,
            Error::Intr,
            Error::Idrm,
            Error::Exist,
            Error::NoDev,
            Error::NoSys,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }
}
