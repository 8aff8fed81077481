/*
 * Wait Queues
 *
 * A wait queue is a FIFO of blocked threads attached to a named channel.
 * Threads link themselves at the tail and suspend; signallers remove the
 * head and make it runnable again. Every STOPPED thread is linked in at
 * most one wait queue at any time.
 *
 * Mesa semantics: a signalled waiter is made runnable, not run
 * immediately, so callers re-check their predicate after waking. A timed
 * wait reports whether it was woken by a signal (true) or by the timeout
 * or a forced cancellation (false).
 *
 * SIGNAL / TIMEOUT RACE:
 * ======================
 *
 * A waiter that times out stays linked until it unlinks itself after
 * resuming. A signal that pops such a thread fails to wake it (it is
 * already runnable) and moves on to the next waiter, so no signal is ever
 * consumed by a thread that already gave up.
 */

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::scheduler;
use crate::scheduler::thread::{Thread, ThreadManager};
use crate::scheduler::types::{Cause, ThreadState};
use crate::syscall;

use super::Mutex;

/// Constant descriptor of what a queue waits for, used for diagnostics
/// and to tag the scheduling cause of waits on the queue.
#[derive(Debug, Clone, Copy)]
pub struct WaitChannel {
    pub cause: Cause,
    pub name: &'static str,
}

pub struct WaitQueue {
    channel: WaitChannel,
    waiters: spin::Mutex<VecDeque<Arc<Thread>>>,
}

impl WaitQueue {
    pub const fn new(channel: WaitChannel) -> WaitQueue {
        WaitQueue {
            channel,
            waiters: spin::Mutex::new(VecDeque::new()),
        }
    }

    pub fn channel(&self) -> &WaitChannel {
        &self.channel
    }

    /// Block the calling thread on this queue.
    ///
    /// The given mutex (if any) is released after the thread is committed
    /// to sleeping and re-acquired before returning, so a holder of the
    /// mutex that signals after we released it can never miss us. A zero
    /// timeout returns immediately without sleeping.
    ///
    /// Returns true when woken by signal/broadcast, false on timeout or
    /// forced cancellation.
    pub fn wait(&self, mutex: Option<&Mutex>, timeout: Option<Duration>) -> bool {
        if timeout == Some(Duration::ZERO) {
            return false;
        }

        let me = ThreadManager::current();
        let was = scheduler::preempt_off();

        // Committed to sleeping before becoming visible in the queue:
        // a signaller can only pop us once we are already STOPPED.
        scheduler::prepare_sleep(&me, ThreadState::Stopped, timeout);
        self.waiters.lock().push_back(me.clone());
        if let Some(m) = mutex {
            m.unlock();
        }

        // A kill posted before we committed to sleeping has already spent
        // its cancel wake; un-sleep ourselves so the safe point below runs
        // instead of stranding this thread on the queue.
        if me.kill_flag().load(core::sync::atomic::Ordering::Acquire) && !me.exiting() {
            scheduler::wakeup(&me);
        }

        scheduler::yield_to(self.channel.cause);
        scheduler::preempt_restore(was);

        // On a timeout or cancel wake we are still linked; drop the link.
        self.waiters.lock().retain(|t| t.id() != me.id());

        // A pending kill takes effect here, before the mutex is retaken.
        syscall::kill_checkpoint();

        // A cancelled wait reports failure even if a signal also raced in.
        let signalled = me.take_wait_signalled() && !me.cancel_pending();
        if let Some(m) = mutex {
            m.lock();
        }
        signalled
    }

    /// Wake the first waiter that is still asleep. If the head lost a race
    /// against its timeout, keep going so the signal is not lost.
    pub fn signal(&self) {
        let mut q = self.waiters.lock();
        while let Some(t) = q.pop_front() {
            if scheduler::wakeup_signalled(&t) {
                break;
            }
        }
    }

    /// Wake every waiter currently linked.
    pub fn broadcast(&self) {
        let mut q = self.waiters.lock();
        while let Some(t) = q.pop_front() {
            scheduler::wakeup_signalled(&t);
        }
    }

    /// Number of linked waiters, for diagnostics.
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}
