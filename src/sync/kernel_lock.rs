/*
 * The Kernel Lock
 *
 * Kernel code in the preemptive domain runs under one logical big kernel
 * lock, implemented as a counting semaphore (initial value 1) protected
 * by a mutex and a FIFO wait queue. The semaphore form matters: a thread
 * that must block while holding the kernel lock releases it (increment +
 * signal), sleeps, and re-acquires it afterwards, so the lock is never
 * held across a long wait and other cores keep doing kernel work.
 */

use core::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use crate::scheduler;

use super::wait_queue::WaitQueue;
use super::Mutex;
use crate::scheduler::types::Cause;
use crate::sync::wait_queue::WaitChannel;

pub struct KernelLock {
    mutex: Mutex,
    /// Semaphore counter. Mutated only under `mutex`; atomic so it can be
    /// shared without a data-holding lock type.
    tokens: AtomicI32,
    queue: WaitQueue,
}

/// The one kernel lock
static KERNEL_LOCK: KernelLock = KernelLock::new();

impl KernelLock {
    pub const fn new() -> KernelLock {
        KernelLock {
            mutex: Mutex::new(),
            tokens: AtomicI32::new(1),
            queue: WaitQueue::new(WaitChannel {
                cause: Cause::User,
                name: "kernel-sem",
            }),
        }
    }

    fn acquire(&self) {
        self.mutex.lock();
        while self.tokens.load(Ordering::Relaxed) <= 0 {
            self.queue.wait(Some(&self.mutex), None);
        }
        self.tokens.fetch_sub(1, Ordering::Relaxed);
        self.mutex.unlock();
    }

    fn release(&self) {
        self.mutex.lock();
        self.tokens.fetch_add(1, Ordering::Relaxed);
        self.queue.signal();
        self.mutex.unlock();
    }

    fn timed_wait(&self, queue: &WaitQueue, timeout: Option<Duration>) -> bool {
        // Preemption is forced on across the wait: the caller may have come
        // in from a non-preemptive section, but a sleeping thread must be
        // preemptible or the core could never be shared while it waits.
        let was = scheduler::set_core_preemption(true);

        self.mutex.lock();
        self.tokens.fetch_add(1, Ordering::Relaxed);
        self.queue.signal();

        let signalled = queue.wait(Some(&self.mutex), timeout);

        while self.tokens.load(Ordering::Relaxed) <= 0 {
            self.queue.wait(Some(&self.mutex), None);
        }
        self.tokens.fetch_sub(1, Ordering::Relaxed);
        self.mutex.unlock();

        scheduler::set_core_preemption(was);
        signalled
    }
}

/// Enter the preemptive kernel domain.
pub fn kernel_lock() {
    KERNEL_LOCK.acquire();
}

/// Leave the preemptive kernel domain.
pub fn kernel_unlock() {
    KERNEL_LOCK.release();
}

/// Atomically release the kernel lock, wait on `queue` (optionally with a
/// timeout), then re-acquire the kernel lock. Returns true when woken by
/// a signal, false on timeout or cancellation.
pub fn kernel_timedwait(queue: &WaitQueue, timeout: Option<Duration>) -> bool {
    KERNEL_LOCK.timed_wait(queue, timeout)
}

/// Wake one thread waiting under the kernel lock on `queue`.
pub fn kernel_signal(queue: &WaitQueue) {
    queue.signal();
}

/// Wake every thread waiting under the kernel lock on `queue`.
pub fn kernel_broadcast(queue: &WaitQueue) {
    queue.broadcast();
}

/// Reset the lock to its boot state. Called once per machine boot, before
/// any thread can hold it.
pub(crate) fn kernel_lock_reset() {
    KERNEL_LOCK.tokens.store(1, Ordering::Relaxed);
}
