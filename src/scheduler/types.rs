/*
 * Scheduler Type Definitions
 *
 * This module defines the core types used throughout the scheduler subsystem.
 * These types are designed to be lightweight, Copy-able, and suitable for
 * use in both policy and mechanism layers.
 */

use core::fmt;
use core::time::Duration;

/// Core identifier
///
/// Represents one simulated CPU core. Each core is hosted by one worker
/// thread of the machine and is addressed by its index in `[0, ncores)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CoreId(pub usize);

impl CoreId {
    /// Bootstrap core (core 0)
    pub const BSP: CoreId = CoreId(0);

    /// Get the core ID as a usize for indexing
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core{}", self.0)
    }
}

/// Thread identifier
///
/// A thread id is a slot index into the thread table plus a generation
/// counter. The generation is bumped every time a slot is reused, so a
/// stale id held after the thread was reclaimed can never resolve to an
/// unrelated thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({}.{})", self.index, self.generation)
    }
}

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub usize);

impl ProcessId {
    /// Reserved "no process" id (pid 0)
    pub const NOPROC: ProcessId = ProcessId(0);

    /// The init process (pid 1), ancestor of every other process
    pub const INIT: ProcessId = ProcessId(1);

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// Thread state
///
/// Lifecycle: Init -> Ready -> Running -> (Ready | Stopped | Exited).
/// A Stopped thread sits on at most one wait queue until woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Init = 0,
    Ready = 1,
    Running = 2,
    Stopped = 3,
    Exited = 4,
}

impl ThreadState {
    pub(crate) fn from_u8(v: u8) -> ThreadState {
        match v {
            0 => ThreadState::Init,
            1 => ThreadState::Ready,
            2 => ThreadState::Running,
            3 => ThreadState::Stopped,
            4 => ThreadState::Exited,
            _ => unreachable!("corrupt thread state {}", v),
        }
    }
}

/// Context phase of a thread
///
/// Dirty means the thread's saved context is not current: some core is
/// still running (or switching away from) it. Only Clean threads may be
/// resumed or placed on the ready queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextPhase {
    Clean = 0,
    Dirty = 1,
}

impl ContextPhase {
    pub(crate) fn from_u8(v: u8) -> ContextPhase {
        match v {
            0 => ContextPhase::Clean,
            1 => ContextPhase::Dirty,
            _ => unreachable!("corrupt context phase {}", v),
        }
    }
}

/// Thread kind
///
/// Each core owns exactly one Idle thread. Idle threads never enter the
/// ready queue; the scheduler falls back to them when nothing is runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Idle,
    Normal,
}

/// Reason a thread entered the scheduler
///
/// Every scheduling decision is tagged with the event that caused it.
/// Policies may use the cause history (`current_cause`, `last_cause`) to
/// classify threads, e.g. to favour interactive ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cause {
    /// Fresh thread, never scheduled before
    Init = 0,
    /// The quantum expired (alarm interrupt)
    Quantum = 1,
    /// Voluntary yield from a condition variable or semaphore
    User = 2,
    /// Spin-yield inside a contended mutex
    Mutex = 3,
    /// Waiting for another thread to exit
    Join = 4,
    /// Blocked on device I/O
    Io = 5,
    /// Blocked on a pipe
    Pipe = 6,
    /// Blocked in a poll/select style wait
    Poll = 7,
    /// The idle thread gave the core back
    Idle = 8,
    /// The thread exited
    Exit = 9,
}

impl Cause {
    pub(crate) fn from_u8(v: u8) -> Cause {
        match v {
            0 => Cause::Init,
            1 => Cause::Quantum,
            2 => Cause::User,
            3 => Cause::Mutex,
            4 => Cause::Join,
            5 => Cause::Io,
            6 => Cause::Pipe,
            7 => Cause::Poll,
            8 => Cause::Idle,
            9 => Cause::Exit,
            _ => unreachable!("corrupt scheduling cause {}", v),
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Cause::Init => "INIT",
            Cause::Quantum => "QUANTUM",
            Cause::User => "USER",
            Cause::Mutex => "MUTEX",
            Cause::Join => "JOIN",
            Cause::Io => "IO",
            Cause::Pipe => "PIPE",
            Cause::Poll => "POLL",
            Cause::Idle => "IDLE",
            Cause::Exit => "EXIT",
        }
    }
}

/// A task body run by a process main thread or an extra thread.
///
/// The argument slice is the process-owned copy of the bytes passed to
/// exec / create-thread.
pub type Task = Box<dyn FnOnce(&[u8]) -> i32 + Send + 'static>;

/// Scheduling quantum: the longest a thread runs uninterrupted on a core
pub const QUANTUM: Duration = Duration::from_millis(10);

/// Thread stack size (128 KiB per thread)
pub const THREAD_STACK_SIZE: usize = 128 * 1024;

/// Maximum number of simulated cores
pub const MAX_CORES: usize = 32;

/// Maximum number of serial devices
pub const MAX_TERMINALS: usize = 4;

/// Number of process table slots (pid 0 is reserved)
pub const MAX_PROC: usize = 256;

/// Maximum number of live threads across the whole kernel
pub const MAX_THREADS: usize = 4096;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_state_round_trips() {
        for s in [
            ThreadState::Init,
            ThreadState::Ready,
            ThreadState::Running,
            ThreadState::Stopped,
            ThreadState::Exited,
        ] {
            assert_eq!(ThreadState::from_u8(s as u8), s);
        }
    }

    #[test]
    fn cause_names_are_distinct() {
        let names: Vec<&str> = (0..=9).map(|v| Cause::from_u8(v).name()).collect();
        for (i, a) in names.iter().enumerate() {
            for b in &names[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
