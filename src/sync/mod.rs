/*
 * Kernel Synchronization Primitives
 *
 * This module contains the locking and waiting primitives the kernel is
 * built on, layered bottom-up:
 *
 * - mutex: a preemption-aware spin-yield lock (no owner, no queue)
 * - wait_queue: FIFO queues of blocked threads, with timeouts
 * - condvar: Mesa-style condition variables over a wait queue
 * - kernel_lock: the big kernel lock, a counting semaphore that is
 *   released around every long wait
 */

pub mod condvar;
pub mod kernel_lock;
pub mod mutex;
pub mod wait_queue;

pub use condvar::CondVar;
pub use kernel_lock::{kernel_broadcast, kernel_lock, kernel_signal, kernel_timedwait, kernel_unlock};
pub use mutex::Mutex;
pub use wait_queue::{WaitChannel, WaitQueue};
