/*
 * Simulated Machine
 *
 * This module hosts the simulated multicore machine the kernel runs on.
 * Each core is an ordinary host thread; an extra thread (the caller of
 * vm_boot) runs the interrupt controller multiplexer. The machine offers
 * the kernel the same surface real firmware would:
 *
 * - per-core interrupt enable/disable, an interrupt vector, and a
 *   pending-interrupt bitmap (ALARM, ICI, SERIAL_RX, SERIAL_TX)
 * - halting a core until an interrupt arrives, and restarting peers
 * - a per-core one-shot timer with microsecond deadlines
 * - serial devices with non-blocking byte I/O and per-port interrupt
 *   routing
 *
 * The machine is infallible by contract: any host OS error underneath it
 * is a fatal condition, because the simulated hardware has no way to
 * report it upward.
 */

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex as StdMutex};
use std::thread;
use std::time::{Duration, Instant};

pub mod context;
pub mod core;
pub mod pic;
pub mod serial;

pub use self::core::{CoreCtl, Intr, IntrHandler, IntrSet};
pub use context::{CpuContext, Wakeup};
pub use serial::SerialPort;

use crate::scheduler::types::{CoreId, MAX_CORES, MAX_TERMINALS, THREAD_STACK_SIZE};

/// Global handle to the running machine. Set by vm_boot, cleared when it
/// returns.
static MACHINE: spin::Mutex<Option<Arc<Machine>>> = spin::Mutex::new(None);

thread_local! {
    /// Which simulated core the calling host thread is currently executing
    /// on. usize::MAX means "not a core" (e.g. the controller thread).
    static CURRENT_CORE: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Bookkeeping for halted cores. One process-wide condition variable
/// serves every core; pokes are delivered as per-core bits so a restart
/// is never lost even if it arrives before the target parks. An
/// "any core" restart issued while no core is halted is banked in
/// `anypoke` and consumed by the next core about to halt, closing the
/// race between enqueueing work and a core going to sleep.
struct HaltState {
    halted: u64,
    poke: u64,
    anypoke: u32,
}

/// The simulated machine
pub struct Machine {
    cores: Vec<CoreCtl>,
    serial: Vec<SerialPort>,

    halt: StdMutex<HaltState>,
    halt_cv: Condvar,

    boot_at: Instant,
    clock_ms: AtomicU64,

    workers_alive: AtomicUsize,
    shutdown: AtomicBool,
    rendezvous: Barrier,
}

impl Machine {
    fn new(ncores: usize, nserial: usize) -> Self {
        Machine {
            cores: (0..ncores).map(|i| CoreCtl::new(CoreId(i))).collect(),
            serial: (0..nserial).map(|_| SerialPort::new()).collect(),
            halt: StdMutex::new(HaltState {
                halted: 0,
                poke: 0,
                anypoke: 0,
            }),
            halt_cv: Condvar::new(),
            boot_at: Instant::now(),
            clock_ms: AtomicU64::new(0),
            workers_alive: AtomicUsize::new(ncores),
            shutdown: AtomicBool::new(false),
            rendezvous: Barrier::new(ncores),
        }
    }

    /// Publish an interrupt to a core and wake it if it is halted.
    fn raise_and_wake(&self, target: CoreId, kind: Intr) {
        self.cores[target.as_usize()].raise(kind);
        // Taking the halt mutex orders the bit ahead of any parked waiter's
        // recheck, so the wakeup cannot be lost.
        let _st = self.halt.lock().unwrap();
        self.halt_cv.notify_all();
    }

    fn poke(&self, mask: u64) {
        let mut st = self.halt.lock().unwrap();
        st.poke |= mask;
        self.halt_cv.notify_all();
    }
}

fn machine() -> Arc<Machine> {
    MACHINE
        .lock()
        .clone()
        .expect("machine: no simulated machine is running")
}

fn try_machine() -> Option<Arc<Machine>> {
    MACHINE.lock().clone()
}

pub(crate) fn set_current_core(core: CoreId) {
    CURRENT_CORE.with(|c| c.set(core.as_usize()));
}

/// The core the calling host thread executes on, if any
pub fn try_current_core() -> Option<CoreId> {
    let v = CURRENT_CORE.with(|c| c.get());
    (v != usize::MAX).then_some(CoreId(v))
}

/// The core the calling host thread executes on
pub fn current_core() -> CoreId {
    try_current_core().expect("machine: caller is not running on a simulated core")
}

// ============================================================================
// BOOT
// ============================================================================

/// Boot the machine: start `ncores` worker threads each running `entry`
/// with its own core identity, open `nserial` serial devices, and run the
/// interrupt controller multiplexer on the calling thread. Returns when
/// every worker has exited.
pub fn vm_boot<F>(ncores: usize, nserial: usize, entry: F)
where
    F: Fn(CoreId) + Send + Sync + 'static,
{
    assert!(
        (1..=MAX_CORES).contains(&ncores),
        "machine: core count {} out of range",
        ncores
    );
    assert!(
        nserial <= MAX_TERMINALS,
        "machine: serial device count {} out of range",
        nserial
    );

    let m = Arc::new(Machine::new(ncores, nserial));
    *MACHINE.lock() = Some(m.clone());
    log::info!(
        "machine: booting {} core(s), {} serial device(s)",
        ncores,
        nserial
    );

    let entry = Arc::new(entry);
    let mut workers = Vec::with_capacity(ncores);
    for i in 0..ncores {
        let entry = entry.clone();
        let m = m.clone();
        let handle = thread::Builder::new()
            .name(format!("core{}", i))
            .stack_size(THREAD_STACK_SIZE)
            .spawn(move || {
                set_current_core(CoreId(i));
                entry(CoreId(i));
                m.workers_alive.fetch_sub(1, Ordering::AcqRel);
            })
            .expect("machine: failed to start a core worker");
        workers.push(handle);
    }

    pic::multiplex(&m);

    for handle in workers {
        handle.join().expect("machine: a core worker panicked");
    }
    *MACHINE.lock() = None;
    log::info!("machine: shutdown complete");
}

/// Barrier across all core workers, used once during kernel boot.
pub(crate) fn rendezvous() {
    machine().rendezvous.wait();
}

/// Number of cores the machine was booted with
pub fn core_count() -> usize {
    try_machine().map_or(0, |m| m.cores.len())
}

// ============================================================================
// INTERRUPT CONTROL (current core)
// ============================================================================

/// Disable interrupt delivery on the calling core. Pending kinds keep
/// accumulating while disabled.
pub fn interrupts_disable() {
    if let Some(m) = try_machine()
        && let Some(core) = try_current_core()
    {
        m.cores[core.as_usize()].set_disabled(true);
    }
}

/// Enable interrupt delivery on the calling core and drain anything that
/// accumulated while it was disabled.
pub fn interrupts_enable() {
    if let Some(m) = try_machine()
        && let Some(core) = try_current_core()
    {
        m.cores[core.as_usize()].set_disabled(false);
    }
    intr_poll();
}

/// Whether interrupt delivery is enabled on the calling core
pub fn interrupts_enabled() -> bool {
    match (try_machine(), try_current_core()) {
        (Some(m), Some(core)) => !m.cores[core.as_usize()].disabled(),
        _ => false,
    }
}

/// Install a handler for one interrupt kind on the calling core.
pub fn install_intr_handler(kind: Intr, handler: IntrHandler) {
    let m = machine();
    m.cores[current_core().as_usize()].install_handler(kind, handler);
}

/// Remove the handler for one interrupt kind on the calling core.
pub fn remove_intr_handler(kind: Intr) {
    let m = machine();
    m.cores[current_core().as_usize()].remove_handler(kind);
}

/// Consume pending interrupts on the calling core, running the installed
/// handlers in dispatch order. A no-op while interrupts are disabled.
///
/// One kind is consumed per step because a handler may suspend the calling
/// thread and let it migrate to another core; kinds that were not yet
/// consumed stay pending on this core for its next occupant.
pub fn intr_poll() {
    loop {
        let Some(m) = try_machine() else { return };
        let Some(core) = try_current_core() else {
            return;
        };
        let core = &m.cores[core.as_usize()];
        if core.disabled() {
            return;
        }
        let Some(kind) = core.take_one() else { return };
        if let Some(handler) = core.handler(kind) {
            handler();
        }
    }
}

/// Raise an inter-core interrupt on a peer core.
pub fn raise_ici(target: CoreId) {
    let m = machine();
    if target.as_usize() < m.cores.len() {
        m.raise_and_wake(target, Intr::Ici);
    }
}

// ============================================================================
// HALT / RESTART
// ============================================================================

/// Park the calling core until any interrupt arrives for it (or until it
/// is poked by a peer), then dispatch whatever is pending.
pub fn halt_core() {
    let m = machine();
    let id = current_core().as_usize();
    let bit = 1u64 << id;
    {
        let mut st = m.halt.lock().unwrap();
        loop {
            if m.shutdown.load(Ordering::Acquire)
                || m.cores[id].has_pending()
                || st.poke & bit != 0
            {
                st.poke &= !bit;
                break;
            }
            if st.anypoke > 0 {
                st.anypoke -= 1;
                break;
            }
            st.halted |= bit;
            st = m.halt_cv.wait(st).unwrap();
            st.halted &= !bit;
        }
    }
    intr_poll();
}

/// Resume a specific halted peer even if no interrupt is pending for it.
pub fn restart_core(target: CoreId) {
    let m = machine();
    if target.as_usize() < m.cores.len() {
        m.poke(1u64 << target.as_usize());
    }
}

/// Resume any one halted core. Used after making a thread runnable so an
/// idle core picks it up promptly. If no core is halted right now the
/// restart is banked and consumed by the next core about to halt.
pub fn restart_one() {
    let Some(m) = try_machine() else { return };
    let mut st = m.halt.lock().unwrap();
    if st.halted != 0 {
        let id = st.halted.trailing_zeros() as u64;
        st.poke |= 1 << id;
    } else {
        st.anypoke = st.anypoke.saturating_add(1);
    }
    m.halt_cv.notify_all();
}

/// Begin machine shutdown: every halted core is released so its idle
/// thread can observe the condition and park the core for good.
pub fn request_shutdown() {
    let m = machine();
    m.shutdown.store(true, Ordering::Release);
    m.poke(u64::MAX);
}

/// Whether machine shutdown has been requested
pub fn shutting_down() -> bool {
    match try_machine() {
        Some(m) => m.shutdown.load(Ordering::Acquire),
        None => true,
    }
}

// ============================================================================
// TIMERS AND CLOCK
// ============================================================================

/// Arm the calling core's one-shot timer. Returns the remaining time of
/// the previously armed deadline, if any.
pub fn timer_set(after: Duration) -> Option<Duration> {
    let m = machine();
    m.cores[current_core().as_usize()].timer_set(after)
}

/// Disarm the calling core's timer, returning the remaining time if it
/// was armed.
pub fn timer_cancel() -> Option<Duration> {
    let m = machine();
    m.cores[current_core().as_usize()].timer_cancel()
}

/// Microseconds since machine boot
pub fn clock_us() -> u64 {
    match try_machine() {
        Some(m) => m.boot_at.elapsed().as_micros() as u64,
        None => 0,
    }
}

/// Coarse milliseconds since machine boot, advanced by the interrupt
/// controller each tick
pub fn clock_ms() -> u64 {
    match try_machine() {
        Some(m) => m.clock_ms.load(Ordering::Acquire),
        None => 0,
    }
}

// ============================================================================
// SERIAL DEVICES
// ============================================================================

/// Read one byte from a serial device, without blocking.
pub fn serial_read(port: usize) -> Option<u8> {
    try_machine()?.serial.get(port)?.read_byte()
}

/// Write one byte to a serial device, without blocking. Returns false if
/// the device cannot accept the byte right now.
pub fn serial_write(port: usize, b: u8) -> bool {
    match try_machine() {
        Some(m) => m.serial.get(port).is_some_and(|p| p.write_byte(b)),
        None => false,
    }
}

/// Route a serial device's RX or TX interrupts to a core.
pub fn serial_route(port: usize, kind: Intr, core: CoreId) {
    let m = machine();
    if let Some(p) = m.serial.get(port) {
        p.route(kind, core);
    }
}

/// Number of serial devices the machine was booted with
pub fn serial_count() -> usize {
    try_machine().map_or(0, |m| m.serial.len())
}

/// Host-side: feed keyboard bytes into a serial device.
pub fn serial_host_feed(port: usize, bytes: &[u8]) -> usize {
    match try_machine() {
        Some(m) => m.serial.get(port).map_or(0, |p| p.host_feed(bytes)),
        None => 0,
    }
}

/// Host-side: drain everything written to a serial device's console.
pub fn serial_host_drain(port: usize) -> Vec<u8> {
    match try_machine() {
        Some(m) => m.serial.get(port).map_or_else(Vec::new, |p| p.host_drain()),
        None => Vec::new(),
    }
}
