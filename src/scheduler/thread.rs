/*
 * Thread Management
 *
 * This module defines the thread control block (Thread), the thread table
 * (an arena addressed by index + generation), and the ThreadManager with
 * the thread lifecycle operations: spawn, exit, join, detach.
 *
 * REFERENCE COUNTING:
 * ===================
 *
 * A thread control block outlives the thread itself: joiners read the
 * exit value after the thread is gone. Each Thread carries a refcount:
 *
 * - one reference for the scheduler, dropped on the first context switch
 *   after the thread exits;
 * - one "join" reference, dropped by the first successful join, by
 *   detach, or by the exiting thread itself when it is detached;
 * - transient references held by in-flight joiners.
 *
 * When the count reaches zero the table slot is freed (bumping its
 * generation) and the context carrier is retired.
 */

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once, Weak};
use std::time::Duration;

use crate::machine::CpuContext;
use crate::scheduler;
use crate::scheduler::process::ProcessManager;
use crate::sync;
use crate::sync::wait_queue::{WaitChannel, WaitQueue};
use crate::syscall::Errno;

use super::types::{
    Cause, ContextPhase, ProcessId, Task, ThreadId, ThreadKind, ThreadState, MAX_THREADS,
    THREAD_STACK_SIZE,
};

/// Sentinel for "no timed wakeup armed"
const NO_WAKEUP: u64 = u64::MAX;

/// Unwind payload of a deliberate thread exit, caught at the trampoline.
pub(crate) struct ExitToken {
    pub code: i32,
}

/// Unwind payload used when a parked thread is retired at machine
/// teardown; the trampoline terminates without running the exit protocol.
pub(crate) struct RetireToken;

/// Thread control block
pub struct Thread {
    id: ThreadId,
    kind: ThreadKind,
    owner: Option<ProcessId>,
    name: String,

    state: AtomicU8,
    phase: AtomicU8,

    // Timed waits
    wakeup_at_us: AtomicU64,
    cancel: AtomicBool,
    wait_signalled: AtomicBool,

    // Per-quantum accounting
    initial_slice_us: AtomicU64,
    remaining_slice_us: AtomicU64,
    current_cause: AtomicU8,
    last_cause: AtomicU8,

    // Exit / join
    exit_value: AtomicI32,
    finished: AtomicBool,
    detached: AtomicBool,
    exiting: AtomicBool,
    refs: AtomicU32,
    join_ref_dropped: AtomicBool,
    join_queue: WaitQueue,

    /// Kill bit shared with the owning process, polled at safe points
    kill_flag: Arc<AtomicBool>,

    ctx: CpuContext,
}

impl Thread {
    fn new(
        id: ThreadId,
        kind: ThreadKind,
        owner: Option<ProcessId>,
        name: String,
        kill_flag: Arc<AtomicBool>,
        ctx: CpuContext,
        initial_state: ThreadState,
        initial_refs: u32,
    ) -> Thread {
        Thread {
            id,
            kind,
            owner,
            name,
            state: AtomicU8::new(initial_state as u8),
            phase: AtomicU8::new(ContextPhase::Clean as u8),
            wakeup_at_us: AtomicU64::new(NO_WAKEUP),
            cancel: AtomicBool::new(false),
            wait_signalled: AtomicBool::new(false),
            initial_slice_us: AtomicU64::new(0),
            remaining_slice_us: AtomicU64::new(0),
            current_cause: AtomicU8::new(Cause::Init as u8),
            last_cause: AtomicU8::new(Cause::Init as u8),
            exit_value: AtomicI32::new(0),
            finished: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            refs: AtomicU32::new(initial_refs),
            join_ref_dropped: AtomicBool::new(false),
            join_queue: WaitQueue::new(WaitChannel {
                cause: Cause::Join,
                name: "join",
            }),
            kill_flag,
            ctx,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    pub fn owner(&self) -> Option<ProcessId> {
        self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: ThreadState) {
        self.state.store(s as u8, Ordering::Release);
    }

    pub fn phase(&self) -> ContextPhase {
        ContextPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, p: ContextPhase) {
        self.phase.store(p as u8, Ordering::Release);
    }

    pub(crate) fn ctx(&self) -> &CpuContext {
        &self.ctx
    }

    pub(crate) fn kill_flag(&self) -> &Arc<AtomicBool> {
        &self.kill_flag
    }

    // ------------------------------------------------------------------
    // Quantum accounting
    // ------------------------------------------------------------------

    /// Record a scheduling event: shift the cause history and remember how
    /// much of the slice was left when the thread came off the core.
    pub(crate) fn record_yield(&self, cause: Cause, remaining: Duration) {
        self.remaining_slice_us
            .store(remaining.as_micros() as u64, Ordering::Relaxed);
        let prev = self.current_cause.swap(cause as u8, Ordering::Relaxed);
        self.last_cause.store(prev, Ordering::Relaxed);
    }

    pub(crate) fn set_initial_slice(&self, slice: Duration) {
        self.initial_slice_us
            .store(slice.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn last_cause(&self) -> Cause {
        Cause::from_u8(self.last_cause.load(Ordering::Relaxed))
    }

    pub fn initial_slice(&self) -> Duration {
        Duration::from_micros(self.initial_slice_us.load(Ordering::Relaxed))
    }

    pub fn remaining_slice(&self) -> Duration {
        Duration::from_micros(self.remaining_slice_us.load(Ordering::Relaxed))
    }

    // ------------------------------------------------------------------
    // Timed waits
    // ------------------------------------------------------------------

    pub(crate) fn arm_wakeup(&self, at_us: u64) {
        self.wakeup_at_us.store(at_us, Ordering::Release);
    }

    pub(crate) fn clear_wakeup(&self) {
        self.wakeup_at_us.store(NO_WAKEUP, Ordering::Release);
    }

    /// True if a timed wakeup is armed for exactly this deadline. Used to
    /// reject stale timeout entries after the thread was woken early.
    pub(crate) fn wakeup_matches(&self, at_us: u64) -> bool {
        self.wakeup_at_us.load(Ordering::Acquire) == at_us
    }

    pub(crate) fn reset_wait_flags(&self) {
        self.cancel.store(false, Ordering::Release);
        self.wait_signalled.store(false, Ordering::Release);
    }

    pub(crate) fn mark_signalled(&self) {
        self.wait_signalled.store(true, Ordering::Release);
    }

    pub(crate) fn take_wait_signalled(&self) -> bool {
        self.wait_signalled.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn post_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Whether this thread was forcibly cancelled out of its current wait
    pub fn cancel_pending(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Exit / join state
    // ------------------------------------------------------------------

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    /// Suppress further kill safe points on this thread; it is committed
    /// to the exit path.
    pub(crate) fn begin_exiting(&self) {
        self.exiting.store(true, Ordering::Release);
    }

    pub fn exit_value(&self) -> i32 {
        self.exit_value.load(Ordering::Acquire)
    }

    fn ref_inc(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }
}

// ============================================================================
// THREAD TABLE
// ============================================================================

struct Slot {
    generation: u32,
    thread: Option<Arc<Thread>>,
}

/// Arena of thread control blocks. Ids are slot index + generation; a
/// freed slot bumps its generation so stale ids stop resolving.
pub(crate) struct ThreadTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl ThreadTable {
    pub(crate) fn new() -> ThreadTable {
        ThreadTable {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Reserve a slot and hand out its id. The slot stays empty until
    /// `install` fills it.
    pub(crate) fn reserve(&mut self) -> Result<ThreadId, Errno> {
        if let Some(index) = self.free.pop() {
            return Ok(ThreadId {
                index: index as u32,
                generation: self.slots[index].generation,
            });
        }
        if self.slots.len() >= MAX_THREADS {
            return Err(Errno::Enfile);
        }
        self.slots.push(Slot {
            generation: 0,
            thread: None,
        });
        Ok(ThreadId {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        })
    }

    pub(crate) fn install(&mut self, thread: Arc<Thread>) {
        let slot = &mut self.slots[thread.id().index as usize];
        debug_assert!(slot.thread.is_none(), "thread slot double install");
        debug_assert_eq!(slot.generation, thread.id().generation);
        slot.thread = Some(thread);
    }

    pub(crate) fn get(&self, id: ThreadId) -> Option<Arc<Thread>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.thread.clone()
    }

    pub(crate) fn remove(&mut self, id: ThreadId) -> Option<Arc<Thread>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let t = slot.thread.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index as usize);
        Some(t)
    }

    /// Remove every thread. Used at machine teardown to retire carriers
    /// that never got reclaimed (e.g. threads of unreaped zombies).
    pub(crate) fn drain_all(&mut self) -> Vec<Arc<Thread>> {
        let mut out = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(t) = slot.thread.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index);
                out.push(t);
            }
        }
        out
    }
}

// ============================================================================
// THREAD MANAGER
// ============================================================================

thread_local! {
    static CURRENT_THREAD: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
}

static PANIC_FILTER: Once = Once::new();

/// Thread lifecycle operations
///
/// ThreadManager is a zero-sized type grouping the thread operations
/// under one namespace. Lifecycle calls that touch shared process state
/// (exit, join, detach) expect the kernel lock conventions documented on
/// each method.
pub struct ThreadManager;

impl ThreadManager {
    /// The thread control block of the calling thread.
    pub fn current() -> Arc<Thread> {
        Self::try_current().expect("no current thread on this core")
    }

    pub fn try_current() -> Option<Arc<Thread>> {
        CURRENT_THREAD.with(|c| c.borrow().clone())
    }

    pub(crate) fn set_current(t: Arc<Thread>) {
        CURRENT_THREAD.with(|c| *c.borrow_mut() = Some(t));
    }

    /// Install a panic hook that keeps deliberate exit unwinds quiet.
    /// Idempotent.
    pub(crate) fn install_panic_filter() {
        PANIC_FILTER.call_once(|| {
            let previous = panic::take_hook();
            panic::set_hook(Box::new(move |info| {
                let payload = info.payload();
                if payload.is::<ExitToken>() || payload.is::<RetireToken>() {
                    return;
                }
                previous(info);
            }));
        });
    }

    /// Adopt the calling host thread as a core's idle thread.
    pub(crate) fn adopt_idle(id: ThreadId, core_name: String) -> Arc<Thread> {
        let idle = Arc::new(Thread::new(
            id,
            ThreadKind::Idle,
            None,
            core_name,
            Arc::new(AtomicBool::new(false)),
            CpuContext::adopt(),
            ThreadState::Running,
            1,
        ));
        Self::set_current(idle.clone());
        idle
    }

    /// Allocate a thread control block and stack for a new kernel thread
    /// of `owner`, prepared to run `body(&args)`. The thread starts in
    /// state Init and does not run until someone wakes it.
    ///
    /// Caller holds the kernel lock.
    pub(crate) fn spawn(
        owner: ProcessId,
        kill_flag: Arc<AtomicBool>,
        name: String,
        body: Task,
        args: Arc<[u8]>,
    ) -> Result<Arc<Thread>, Errno> {
        let id = scheduler::reserve_thread_slot()?;

        let thread = Arc::new_cyclic(|weak: &Weak<Thread>| {
            let weak = weak.clone();
            let ctx = CpuContext::spawn(format!("{}", id), THREAD_STACK_SIZE, move |_core| {
                let Some(me) = weak.upgrade() else { return };
                Self::trampoline(me, body, args);
            });
            Thread::new(
                id,
                ThreadKind::Normal,
                Some(owner),
                name,
                kill_flag,
                ctx,
                ThreadState::Init,
                2,
            )
        });

        scheduler::install_thread(thread.clone());
        log::debug!("spawned {} ('{}') for {}", id, thread.name(), owner);
        Ok(thread)
    }

    /// First code run by a fresh thread once a core resumes it. Runs the
    /// body, translating a deliberate exit unwind or a stray panic into an
    /// exit value, then performs the exit protocol.
    fn trampoline(me: Arc<Thread>, body: Task, args: Arc<[u8]>) {
        Self::set_current(me.clone());
        scheduler::gain_finalize();
        scheduler::preempt_on();

        let code = match panic::catch_unwind(AssertUnwindSafe(move || body(&args))) {
            Ok(code) => code,
            Err(payload) => {
                if let Some(token) = payload.downcast_ref::<ExitToken>() {
                    token.code
                } else if payload.is::<RetireToken>() {
                    // Machine teardown while this thread was parked.
                    return;
                } else {
                    log::error!("{} ('{}') panicked, exiting -1", me.id(), me.name());
                    -1
                }
            }
        };
        Self::exit_current(code);
    }

    /// The exit path of the calling thread: store the exit value, tell
    /// the owning process, wake joiners, then leave the core for good.
    /// Returns only when the control block is retired.
    fn exit_current(code: i32) {
        let me = Self::current();
        me.exiting.store(true, Ordering::Release);
        me.exit_value.store(code, Ordering::Release);

        sync::kernel_lock();
        me.finished.store(true, Ordering::Release);
        ProcessManager::on_thread_exit(&me);
        sync::kernel_broadcast(&me.join_queue);
        if me.detached() {
            Self::drop_join_ref(&me);
        }
        sync::kernel_unlock();

        log::debug!("{} ('{}') exited with {}", me.id(), me.name(), code);
        scheduler::sleep_releasing(ThreadState::Exited, None, Cause::Exit, None);
    }

    /// Exit the calling thread with `code` via the trampoline.
    pub(crate) fn exit_unwind(code: i32) -> ! {
        panic::panic_any(ExitToken { code });
    }

    /// Wait for thread `tid` of the calling thread's process to exit and
    /// return its exit value.
    ///
    /// Caller holds the kernel lock.
    pub(crate) fn join(tid: ThreadId) -> Result<i32, Errno> {
        let me = Self::current();
        let target = scheduler::lookup_thread(tid).ok_or(Errno::Enoent)?;
        if target.id() == me.id() {
            return Err(Errno::Einval);
        }
        if target.owner() != me.owner() {
            return Err(Errno::Enoent);
        }
        if target.detached() {
            return Err(Errno::Einval);
        }

        target.ref_inc();
        let mut outcome = Ok(());
        while !target.finished() {
            if target.detached() {
                outcome = Err(Errno::Einval);
                break;
            }
            sync::kernel_timedwait(&target.join_queue, None);
        }
        let result = outcome.map(|()| target.exit_value());
        if result.is_ok() {
            Self::drop_join_ref(&target);
        }
        Self::release_ref(&target);
        result
    }

    /// Mark thread `tid` detached: joiners are turned away and the thread
    /// reclaims itself on exit.
    ///
    /// Caller holds the kernel lock.
    pub(crate) fn detach(tid: ThreadId) -> Result<(), Errno> {
        let me = Self::current();
        let target = scheduler::lookup_thread(tid).ok_or(Errno::Enoent)?;
        if target.owner() != me.owner() {
            return Err(Errno::Enoent);
        }
        if target.finished() {
            return Err(Errno::Einval);
        }
        target.detached.store(true, Ordering::Release);
        sync::kernel_broadcast(&target.join_queue);
        Self::drop_join_ref(&target);
        Ok(())
    }

    /// Drop the join reference exactly once, no matter how many parties
    /// (joiner, detacher, exiting thread) try.
    pub(crate) fn drop_join_ref(t: &Arc<Thread>) {
        if t.join_ref_dropped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Self::release_ref(t);
        }
    }

    /// Drop one reference; the last one frees the table slot and retires
    /// the context carrier.
    pub(crate) fn release_ref(t: &Arc<Thread>) {
        if t.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            scheduler::release_thread(t.id());
            t.ctx().retire();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_thread(id: ThreadId) -> Arc<Thread> {
        Arc::new(Thread::new(
            id,
            ThreadKind::Normal,
            Some(ProcessId(1)),
            "t".into(),
            Arc::new(AtomicBool::new(false)),
            CpuContext::adopt(),
            ThreadState::Init,
            1,
        ))
    }

    #[test]
    fn stale_ids_stop_resolving_after_reuse() {
        let mut table = ThreadTable::new();
        let id = table.reserve().unwrap();
        table.install(dummy_thread(id));
        assert!(table.get(id).is_some());

        table.remove(id).unwrap();
        assert!(table.get(id).is_none());

        let id2 = table.reserve().unwrap();
        assert_eq!(id2.index, id.index);
        assert_ne!(id2.generation, id.generation);
        table.install(dummy_thread(id2));
        assert!(table.get(id).is_none());
        assert!(table.get(id2).is_some());
    }

    #[test]
    fn cause_history_shifts_on_yield() {
        let t = dummy_thread(ThreadId {
            index: 0,
            generation: 0,
        });
        t.record_yield(Cause::Quantum, Duration::from_millis(3));
        t.record_yield(Cause::User, Duration::from_millis(1));
        assert_eq!(t.last_cause(), Cause::Quantum);
        assert_eq!(t.remaining_slice(), Duration::from_millis(1));
    }
}
