/*
 * Scheduling Policy Trait
 *
 * This trait separates scheduling policy from mechanism. The mechanism
 * (scheduler/mod.rs) owns thread states, context switching and timers;
 * the policy owns the ready structures and decides which thread runs
 * next and for how long. Swapping the algorithm touches nothing outside
 * the policies directory.
 *
 * All methods are called with the scheduler lock held, in non-preemptive
 * context, so implementations must not block or allocate unboundedly.
 */

use std::sync::Arc;
use std::time::Duration;

use super::thread::Thread;
use super::types::QUANTUM;

pub trait SchedPolicy: Send {
    /// Policy name for logging
    fn name(&self) -> &'static str;

    /// A thread became runnable: take it into the ready structures.
    /// Only Ready threads with a clean context are ever offered here,
    /// and never idle threads.
    fn thread_ready(&mut self, thread: Arc<Thread>);

    /// Choose the next thread for the core that `current` is leaving.
    ///
    /// Contract: return a thread from the ready structures, or `current`
    /// itself if it is still Ready and nothing else is runnable, or
    /// `idle` as the last resort. The returned thread is removed from the
    /// ready structures.
    fn select(&mut self, current: &Arc<Thread>, idle: &Arc<Thread>) -> Arc<Thread>;

    /// The time slice to grant a thread being put on a core.
    fn quantum_for(&self, _thread: &Arc<Thread>) -> Duration {
        QUANTUM
    }

    /// Whether any thread is waiting in the ready structures.
    fn has_ready(&self) -> bool;
}
