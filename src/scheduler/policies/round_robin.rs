/*
 * Round-Robin Scheduling Policy
 *
 * A single global FIFO of ready threads. Threads are appended as they
 * become runnable and dispatched from the front, so every ready thread
 * gets the core within one full rotation. All threads receive the same
 * default quantum.
 */

use std::collections::VecDeque;
use std::sync::Arc;

use crate::scheduler::thread::Thread;
use crate::scheduler::traits::SchedPolicy;
use crate::scheduler::types::ThreadState;

pub struct RoundRobinPolicy {
    ready: VecDeque<Arc<Thread>>,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        RoundRobinPolicy {
            ready: VecDeque::new(),
        }
    }
}

impl SchedPolicy for RoundRobinPolicy {
    fn name(&self) -> &'static str {
        "Round-Robin"
    }

    fn thread_ready(&mut self, thread: Arc<Thread>) {
        debug_assert_eq!(thread.state(), ThreadState::Ready);
        self.ready.push_back(thread);
    }

    fn select(&mut self, current: &Arc<Thread>, idle: &Arc<Thread>) -> Arc<Thread> {
        while let Some(next) = self.ready.pop_front() {
            // Anything queued should be Ready; tolerate a torn-down entry.
            if next.state() == ThreadState::Ready {
                return next;
            }
            log::warn!("ready queue held {} in state {:?}", next.id(), next.state());
        }
        if current.state() == ThreadState::Ready {
            return current.clone();
        }
        idle.clone()
    }

    fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}
