/*
 * Preemption-Aware Mutex
 *
 * A test-and-set lock with no owner, no recursion and no queue, usable
 * from both scheduling domains:
 *
 * - In the preemptive domain (normal thread context, interrupts enabled)
 *   a contended lock spins briefly and then yields to the scheduler with
 *   cause MUTEX, so the holder gets CPU time to finish its critical
 *   section.
 * - In the non-preemptive domain (interrupt handlers, scheduler
 *   internals) yielding is forbidden, so the lock spins until the holder
 *   releases it. Critical sections there are bounded by construction.
 *
 * Unlock is a plain release store, so the lock may be released by a
 * different code path than the one that acquired it. The wait queue layer
 * depends on exactly that to release a caller's mutex while it blocks.
 */

use core::sync::atomic::{AtomicBool, Ordering};

use crate::scheduler;
use crate::scheduler::types::Cause;

/// Failed acquisition attempts before considering a scheduler yield
const SPIN_LIMIT: u32 = 64;

pub struct Mutex {
    locked: AtomicBool,
}

impl Mutex {
    pub const fn new() -> Mutex {
        Mutex {
            locked: AtomicBool::new(false),
        }
    }

    /// Attempt the lock once.
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire the lock, spinning and (when preemption is on for this
    /// core) yielding between rounds of attempts.
    pub fn lock(&self) {
        loop {
            let mut spins = 0;
            while spins < SPIN_LIMIT {
                if self.try_lock() {
                    return;
                }
                core::hint::spin_loop();
                spins += 1;
            }
            // The slow path is an interrupt delivery point; a no-op while
            // interrupts are off.
            crate::machine::intr_poll();
            if scheduler::can_spin_yield() {
                scheduler::yield_to(Cause::Mutex);
            } else {
                // Non-preemptive context: keep spinning. Stepping off the
                // host CPU briefly lets the holder's carrier run.
                std::thread::yield_now();
            }
        }
    }

    /// Release the lock.
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Mutex::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_lock_unlock() {
        let m = Mutex::new();
        assert!(m.try_lock());
        assert!(!m.try_lock());
        m.unlock();
        m.lock();
        m.unlock();
    }
}
