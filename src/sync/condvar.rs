/*
 * Condition Variables
 *
 * A condition variable is a wait queue bound to a user mutex, with Mesa
 * wakeup semantics: signal makes one waiter runnable, broadcast all of
 * them, and a woken waiter always re-acquires the mutex before returning.
 * Callers therefore re-check their predicate in a loop.
 */

use std::time::Duration;

use crate::scheduler::types::Cause;

use super::wait_queue::{WaitChannel, WaitQueue};
use super::Mutex;

pub struct CondVar {
    queue: WaitQueue,
}

impl CondVar {
    pub const fn new() -> CondVar {
        CondVar {
            queue: WaitQueue::new(WaitChannel {
                cause: Cause::User,
                name: "cv",
            }),
        }
    }

    /// Release `mutex`, wait for a signal, re-acquire `mutex`.
    ///
    /// Returns true when woken by signal/broadcast, false when the wait
    /// was cancelled out from under us.
    pub fn wait(&self, mutex: &Mutex) -> bool {
        self.queue.wait(Some(mutex), None)
    }

    /// Like wait, but gives up after `timeout`. A zero timeout returns
    /// immediately with false.
    pub fn timed_wait(&self, mutex: &Mutex, timeout: Duration) -> bool {
        self.queue.wait(Some(mutex), Some(timeout))
    }

    /// Wake one waiter, if any.
    pub fn signal(&self) {
        self.queue.signal();
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        self.queue.broadcast();
    }
}

impl Default for CondVar {
    fn default() -> Self {
        CondVar::new()
    }
}
