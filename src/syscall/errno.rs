/*
 * Kernel Error Codes
 *
 * This module defines the closed set of error codes surfaced at the
 * system call boundary. Every fallible kernel call returns
 * Result<T, Errno>; the numeric codes match their Unix namesakes so the
 * values printed in logs look familiar.
 */

use core::fmt;

/// Error codes returned by kernel calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Errno {
    /// Operation not permitted (e.g. killing init)
    Eperm,
    /// Invalid argument or state mismatch (self-join, detached thread)
    Einval,
    /// Bad file id
    Ebadf,
    /// Process file table full
    Emfile,
    /// System-wide table full (process or thread slots exhausted)
    Enfile,
    /// No waitable child
    Echild,
    /// A timed wait expired
    Etimedout,
    /// Operation not supported on this stream
    Espipe,
    /// No such process or thread
    Enoent,
}

impl Errno {
    /// Numeric code, matching the Unix value of the same name
    pub fn code(&self) -> i32 {
        match self {
            Errno::Eperm => 1,
            Errno::Enoent => 2,
            Errno::Ebadf => 9,
            Errno::Echild => 10,
            Errno::Einval => 22,
            Errno::Enfile => 23,
            Errno::Emfile => 24,
            Errno::Espipe => 29,
            Errno::Etimedout => 110,
        }
    }

    /// Symbolic name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Errno::Eperm => "EPERM",
            Errno::Einval => "EINVAL",
            Errno::Ebadf => "EBADF",
            Errno::Emfile => "EMFILE",
            Errno::Enfile => "ENFILE",
            Errno::Echild => "ECHILD",
            Errno::Etimedout => "ETIMEDOUT",
            Errno::Espipe => "ESPIPE",
            Errno::Enoent => "ENOENT",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let all = [
            Errno::Eperm,
            Errno::Einval,
            Errno::Ebadf,
            Errno::Emfile,
            Errno::Enfile,
            Errno::Echild,
            Errno::Etimedout,
            Errno::Espipe,
            Errno::Enoent,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }

    #[test]
    fn display_includes_name_and_code() {
        assert_eq!(format!("{}", Errno::Echild), "ECHILD (10)");
    }
}
