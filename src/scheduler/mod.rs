/*
 * Preemptive Multicore Scheduler
 *
 * This module is the mechanism layer of the scheduler. It owns thread
 * states and the context-switch protocol; the pluggable policy
 * (scheduler/policies) owns the ready structures and picks who runs next.
 *
 * STATES AND THE READY QUEUE:
 * ===========================
 *
 * A thread is in the policy's ready structures exactly when it is Ready,
 * its saved context is Clean, and it is not an idle thread. Running
 * threads are never queued. A thread whose context is still Dirty (the
 * core it ran on has not finished switching away) is not queued even if
 * it was already made Ready again; the switch finalization enqueues it.
 *
 * CONTEXT SWITCH:
 * ===============
 *
 * yield_to() runs with interrupts off. Under the scheduler lock it
 * accounts the leftover quantum, marks the outgoing thread Dirty, asks
 * the policy for the next thread, programs the core timer and transfers
 * control. The incoming thread finishes the switch (gain_finalize):
 * it marks the previous thread Clean and either re-queues it (Ready),
 * leaves it to its wait queue (Stopped) or drops the scheduler's
 * reference (Exited).
 *
 * TIMED WAITS:
 * ============
 *
 * Sleeping threads with a deadline are registered in a min-heap keyed on
 * the absolute wakeup time. Every alarm interrupt drains the expired
 * entries before ending the quantum. Entries are invalidated lazily: a
 * thread woken early clears its deadline and the stale heap entry is
 * skipped when it surfaces.
 */

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use lazy_static::lazy_static;

use crate::machine;
use crate::machine::{CpuContext, Intr, Wakeup};
use crate::sync;

pub mod policies;
pub mod process;
pub mod thread;
pub mod traits;
pub mod types;

pub use policies::RoundRobinPolicy;
pub use process::{ProcState, Process, ProcessManager};
pub use thread::{Thread, ThreadManager};
pub use traits::SchedPolicy;
pub use types::{Cause, ContextPhase, CoreId, ProcessId, Task, ThreadId, ThreadKind, ThreadState};

use thread::{RetireToken, ThreadTable};
use types::MAX_CORES;

/// Per-core scheduling state
struct CoreState {
    /// Thread currently owning the core
    current: Arc<Thread>,
    /// Outgoing thread of an in-flight switch, finalized by the incoming
    /// thread
    prev: Option<Arc<Thread>>,
    /// This core's idle thread; never enters the ready structures
    idle: Arc<Thread>,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct TimeoutEntry {
    at_us: u64,
    tid: ThreadId,
}

/// Scheduler state shared by all cores
struct Scheduler {
    cores: Vec<Option<CoreState>>,
    policy: Box<dyn SchedPolicy>,
    threads: ThreadTable,
    timeouts: BinaryHeap<Reverse<TimeoutEntry>>,
}

impl Scheduler {
    fn new(ncores: usize, policy: Box<dyn SchedPolicy>) -> Scheduler {
        log::info!(
            "scheduler: {} core(s), policy {}",
            ncores,
            policy.name()
        );
        Scheduler {
            cores: (0..ncores).map(|_| None).collect(),
            policy,
            threads: ThreadTable::new(),
            timeouts: BinaryHeap::new(),
        }
    }
}

/// Global scheduler singleton, present while a machine is booted
static SCHEDULER: spin::Mutex<Option<Scheduler>> = spin::Mutex::new(None);

/// Per-core preemption flags. Preemption is on by default; the flag is
/// cleared inside non-preemptive sections.
static PREEMPT: [AtomicBool; MAX_CORES] = [const { AtomicBool::new(true) }; MAX_CORES];

/// Exit value of init, delivered to boot()'s caller
static INIT_EXIT: AtomicI32 = AtomicI32::new(0);

/// The init task, stashed for the boot core to pick up
static BOOT_TASK: spin::Mutex<Option<(Task, Option<Vec<u8>>)>> = spin::Mutex::new(None);

lazy_static! {
    /// Serializes whole machine boots: there is one simulated machine.
    static ref BOOT_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
}

// ============================================================================
// BOOT AND SHUTDOWN
// ============================================================================

/// Boot the kernel on a fresh machine of `ncores` cores and `nserial`
/// serial devices, run `init_task` as the init process (pid 1), and
/// return init's exit value once the machine has shut down.
pub fn boot(ncores: usize, nserial: usize, init_task: Task, args: Option<&[u8]>) -> i32 {
    let _guard = BOOT_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    crate::utils::logger::init();
    ThreadManager::install_panic_filter();

    *SCHEDULER.lock() = Some(Scheduler::new(ncores, Box::new(RoundRobinPolicy::new())));
    ProcessManager::reset();
    sync::kernel_lock::kernel_lock_reset();
    INIT_EXIT.store(0, Ordering::SeqCst);
    for flag in PREEMPT.iter().take(ncores) {
        flag.store(true, Ordering::SeqCst);
    }
    *BOOT_TASK.lock() = Some((init_task, args.map(<[u8]>::to_vec)));

    machine::vm_boot(ncores, nserial, boot_core);

    // Whatever is still in the thread table was parked forever: threads
    // of unreaped zombies, or threads blocked with nobody left to wake
    // them. Retire their carriers before declaring the boot over.
    let leftovers = SCHEDULER
        .lock()
        .as_mut()
        .map(|s| s.threads.drain_all())
        .unwrap_or_default();
    for t in leftovers {
        t.ctx().retire();
    }
    *SCHEDULER.lock() = None;

    INIT_EXIT.load(Ordering::SeqCst)
}

/// Per-core kernel boot, run by every machine worker. Installs the
/// interrupt handlers, turns the boot thread into the core's idle thread
/// and enters the idle loop. The boot core additionally creates init.
fn boot_core(core: CoreId) {
    machine::install_intr_handler(Intr::Alarm, alarm_handler);
    machine::install_intr_handler(Intr::Ici, ici_handler);

    {
        let mut guard = SCHEDULER.lock();
        let s = guard.as_mut().expect("boot: scheduler missing");
        let id = s.threads.reserve().expect("boot: thread table full");
        let idle = ThreadManager::adopt_idle(id, format!("idle-{}", core.as_usize()));
        s.threads.install(idle.clone());
        s.cores[core.as_usize()] = Some(CoreState {
            current: idle.clone(),
            prev: None,
            idle,
        });
    }
    machine::rendezvous();

    if core == CoreId::BSP {
        let (task, args) = BOOT_TASK.lock().take().expect("boot: no init task");
        sync::kernel_lock();
        ProcessManager::spawn_init(task, args.as_deref());
        sync::kernel_unlock();
    }

    idle_loop();
}

/// The idle thread's body: halt the core until an interrupt arrives, then
/// offer the core back to the scheduler. Leaves once shutdown begins.
fn idle_loop() {
    loop {
        if machine::shutting_down() {
            break;
        }
        machine::halt_core();
        if machine::shutting_down() {
            break;
        }
        yield_to(Cause::Idle);
    }
    log::debug!("{}: idle loop done", machine::current_core());
}

pub(crate) fn record_init_exit(value: i32) {
    INIT_EXIT.store(value, Ordering::SeqCst);
}

// ============================================================================
// PREEMPTION CONTROL
// ============================================================================

/// Enter a non-preemptive section on this core: interrupts off, then the
/// preemption flag cleared. Returns the previous flag so nested sections
/// can restore it.
pub fn preempt_off() -> bool {
    machine::interrupts_disable();
    match machine::try_current_core() {
        Some(core) => PREEMPT[core.as_usize()].swap(false, Ordering::AcqRel),
        None => true,
    }
}

/// Leave a non-preemptive section: the preemption flag set, then
/// interrupts on (draining anything pending). Returns the previous flag.
pub fn preempt_on() -> bool {
    let prev = match machine::try_current_core() {
        Some(core) => PREEMPT[core.as_usize()].swap(true, Ordering::AcqRel),
        None => true,
    };
    machine::interrupts_enable();
    prev
}

/// Restore the preemption state returned by a matching preempt_off().
pub fn preempt_restore(prev: bool) {
    if prev {
        preempt_on();
    }
}

/// Set the core preemption flag to `on`, returning the previous value.
pub fn set_core_preemption(on: bool) -> bool {
    if on { preempt_on() } else { preempt_off() }
}

/// Whether preemption is currently on for the calling core
pub fn core_preemption() -> bool {
    match machine::try_current_core() {
        Some(core) => PREEMPT[core.as_usize()].load(Ordering::Acquire),
        None => false,
    }
}

/// Whether a contended lock may yield: there is a scheduler, the caller
/// is a kernel thread on a core, and preemption is on.
pub(crate) fn can_spin_yield() -> bool {
    core_preemption()
        && machine::try_current_core().is_some()
        && ThreadManager::try_current().is_some()
        && SCHEDULER.lock().is_some()
}

// ============================================================================
// THREAD TABLE ACCESS
// ============================================================================

pub(crate) fn reserve_thread_slot() -> Result<ThreadId, crate::syscall::Errno> {
    let mut guard = SCHEDULER.lock();
    let s = guard.as_mut().expect("scheduler not running");
    s.threads.reserve()
}

pub(crate) fn install_thread(t: Arc<Thread>) {
    let mut guard = SCHEDULER.lock();
    let s = guard.as_mut().expect("scheduler not running");
    s.threads.install(t);
}

/// Resolve a thread id, if the thread still exists.
pub fn lookup_thread(tid: ThreadId) -> Option<Arc<Thread>> {
    SCHEDULER.lock().as_ref()?.threads.get(tid)
}

/// The thread currently occupying `core`, for diagnostics.
pub fn running_on(core: CoreId) -> Option<ThreadId> {
    let guard = SCHEDULER.lock();
    let s = guard.as_ref()?;
    s.cores
        .get(core.as_usize())?
        .as_ref()
        .map(|cs| cs.current.id())
}

pub(crate) fn release_thread(tid: ThreadId) {
    if let Some(s) = SCHEDULER.lock().as_mut() {
        s.threads.remove(tid);
    }
}

// ============================================================================
// SLEEP AND WAKEUP
// ============================================================================

/// Commit the calling thread to suspension before it becomes visible to
/// any waker: the state changes to `new_state` and the context is marked
/// Dirty, so a wakeup racing with the in-flight switch cannot re-queue a
/// context that is not yet saved. Armed with a deadline when `timeout`
/// is finite.
///
/// Call with preemption off; the suspension happens at the next
/// yield_to().
pub(crate) fn prepare_sleep(t: &Arc<Thread>, new_state: ThreadState, timeout: Option<Duration>) {
    debug_assert!(matches!(
        new_state,
        ThreadState::Stopped | ThreadState::Exited
    ));
    let mut guard = SCHEDULER.lock();
    let s = guard.as_mut().expect("scheduler not running");
    t.reset_wait_flags();
    // Always reset the deadline: a stale value from an earlier timed wait
    // that never slept must not revalidate an old heap entry.
    t.clear_wakeup();
    t.set_state(new_state);
    t.set_phase(ContextPhase::Dirty);
    if let Some(d) = timeout {
        let at_us = machine::clock_us() + d.as_micros() as u64;
        t.arm_wakeup(at_us);
        s.timeouts.push(Reverse(TimeoutEntry {
            at_us,
            tid: t.id(),
        }));
    }
}

/// Atomically release `mutex` (if any), suspend the calling thread in
/// `new_state`, and wake up when someone makes it runnable again.
pub(crate) fn sleep_releasing(
    new_state: ThreadState,
    mutex: Option<&sync::Mutex>,
    cause: Cause,
    timeout: Option<Duration>,
) -> Wakeup {
    let was = preempt_off();
    let me = ThreadManager::current();
    prepare_sleep(&me, new_state, timeout);
    if let Some(m) = mutex {
        m.unlock();
    }
    let wake = yield_to(cause);
    if wake == Wakeup::Resumed {
        preempt_restore(was);
    }
    wake
}

fn wakeup_locked(s: &mut Scheduler, t: &Arc<Thread>, signalled: bool) -> bool {
    // A waker may hold a link from an earlier machine boot (e.g. a static
    // wait queue): only the current occupant of the table slot is live.
    let live = s
        .threads
        .get(t.id())
        .is_some_and(|cur| Arc::ptr_eq(&cur, t));
    if !live {
        return false;
    }
    match t.state() {
        ThreadState::Init | ThreadState::Stopped => {
            if signalled {
                t.mark_signalled();
            }
            t.clear_wakeup();
            t.set_state(ThreadState::Ready);
            if t.phase() == ContextPhase::Clean && t.kind() == ThreadKind::Normal {
                s.policy.thread_ready(t.clone());
            }
            true
        }
        _ => false,
    }
}

fn wakeup_inner(t: &Arc<Thread>, signalled: bool) -> bool {
    let woke = {
        let mut guard = SCHEDULER.lock();
        match guard.as_mut() {
            Some(s) => wakeup_locked(s, t, signalled),
            None => false,
        }
    };
    if woke {
        machine::restart_one();
    }
    woke
}

/// Make a suspended or fresh thread runnable. Returns false if the thread
/// was not asleep (e.g. it already won a race against this waker).
pub(crate) fn wakeup(t: &Arc<Thread>) -> bool {
    wakeup_inner(t, false)
}

/// Like wakeup, but marks the thread as woken by a signal so its wait
/// reports success rather than a timeout.
pub(crate) fn wakeup_signalled(t: &Arc<Thread>) -> bool {
    wakeup_inner(t, true)
}

// ============================================================================
// THE CONTEXT SWITCH
// ============================================================================

/// Give the core to the scheduler with the given cause. Returns after
/// some core resumes the calling thread.
pub(crate) fn yield_to(cause: Cause) -> Wakeup {
    let was = preempt_off();
    let me = ThreadManager::current();
    let core = machine::current_core();

    let (next, slice) = {
        let mut guard = SCHEDULER.lock();
        let s = guard.as_mut().expect("scheduler not running");

        let remaining = machine::timer_cancel().unwrap_or(Duration::ZERO);
        me.record_yield(cause, remaining);
        if me.state() == ThreadState::Running {
            me.set_state(ThreadState::Ready);
        }
        me.set_phase(ContextPhase::Dirty);

        let cs = s.cores[core.as_usize()]
            .as_mut()
            .expect("core not registered with the scheduler");
        let idle = cs.idle.clone();
        let next = s.policy.select(&me, &idle);

        if Arc::ptr_eq(&next, &me) {
            // Nothing else to run: keep the core.
            me.set_state(ThreadState::Running);
            me.set_phase(ContextPhase::Clean);
            let slice = s.policy.quantum_for(&me);
            me.set_initial_slice(slice);
            drop(guard);
            machine::timer_set(slice);
            preempt_restore(was);
            return Wakeup::Resumed;
        }

        next.set_state(ThreadState::Running);
        let slice = s.policy.quantum_for(&next);
        next.set_initial_slice(slice);

        let cs = s.cores[core.as_usize()].as_mut().unwrap();
        cs.prev = Some(me.clone());
        cs.current = next.clone();
        (next, slice)
    };

    // Interrupts are still off; the alarm cannot fire before the switch.
    machine::timer_set(slice);

    let wake = CpuContext::transfer(me.ctx(), next.ctx(), core);
    match wake {
        Wakeup::Retired => {
            if me.exiting() {
                return Wakeup::Retired;
            }
            // Machine teardown caught this thread parked; unwind to the
            // trampoline without running any more kernel code.
            panic::panic_any(RetireToken);
        }
        Wakeup::Resumed => {
            gain_finalize();
            preempt_restore(was);
            Wakeup::Resumed
        }
    }
}

/// Second half of a context switch, run by the thread that just received
/// the core. Marks the outgoing thread's context Clean and disposes of it
/// according to its state.
pub(crate) fn gain_finalize() {
    let core = machine::current_core();
    let mut requeued = false;
    let mut to_release: Option<Arc<Thread>> = None;
    {
        let mut guard = SCHEDULER.lock();
        let Some(s) = guard.as_mut() else { return };
        let Some(cs) = s.cores[core.as_usize()].as_mut() else {
            return;
        };
        if let Some(prev) = cs.prev.take() {
            prev.set_phase(ContextPhase::Clean);
            match prev.state() {
                ThreadState::Ready => {
                    if prev.kind() == ThreadKind::Normal {
                        s.policy.thread_ready(prev);
                        requeued = true;
                    }
                }
                ThreadState::Exited => to_release = Some(prev),
                _ => {}
            }
        }
    }
    if let Some(t) = to_release {
        ThreadManager::release_ref(&t);
    }
    if requeued {
        machine::restart_one();
    }
}

// ============================================================================
// INTERRUPT HANDLERS
// ============================================================================

/// ALARM: wake expired timed waits, then end the quantum.
fn alarm_handler() {
    wake_expired();
    if ThreadManager::try_current().is_some() {
        yield_to(Cause::Quantum);
    }
}

/// ICI: a peer wants this core to reschedule.
fn ici_handler() {
    if ThreadManager::try_current().is_some() {
        yield_to(Cause::User);
    }
}

/// Drain the timeout heap up to the current instant, waking each expired
/// sleeper without the signal mark so its wait reports the timeout.
fn wake_expired() {
    let mut woke_any = false;
    {
        let mut guard = SCHEDULER.lock();
        let Some(s) = guard.as_mut() else { return };
        let now = machine::clock_us();
        while let Some(Reverse(top)) = s.timeouts.peek() {
            if top.at_us > now {
                break;
            }
            let Reverse(entry) = s.timeouts.pop().unwrap();
            let Some(t) = s.threads.get(entry.tid) else {
                continue;
            };
            // Entries are invalidated lazily: skip if the thread was
            // already woken (deadline cleared) or re-armed differently.
            if t.state() != ThreadState::Stopped || !t.wakeup_matches(entry.at_us) {
                continue;
            }
            if wakeup_locked(s, &t, false) {
                woke_any = true;
            }
        }
    }
    if woke_any {
        machine::restart_one();
    }
}
