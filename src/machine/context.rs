/*
 * CPU Context
 *
 * A context is the resumable execution state of one kernel thread. On a
 * hosted machine there are no register frames to switch by hand: every
 * context is carried by a dedicated host thread that is parked whenever
 * the context is not running on any core. Transferring control means
 * unparking the target's carrier and parking our own.
 *
 * The parking mutex gives the resumer the acquire/release ordering a
 * hardware context switch would provide: everything the suspended side
 * wrote before parking is visible to whichever core resumes it, even if
 * that is a different core than the one it last ran on.
 */

use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::scheduler::types::CoreId;

/// How a parked context came back to life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// A core transferred control to this context
    Resumed,
    /// The context was retired; its carrier must unwind and terminate
    Retired,
}

struct Slot {
    resume: bool,
    retire: bool,
    core: usize,
}

struct Shared {
    slot: Mutex<Slot>,
    cv: Condvar,
}

/// Handle to one context. Cloneable so the scheduler can reference it from
/// several places; all clones designate the same carrier.
#[derive(Clone)]
pub struct CpuContext {
    shared: Arc<Shared>,
}

impl CpuContext {
    fn new_shared() -> Arc<Shared> {
        Arc::new(Shared {
            slot: Mutex::new(Slot {
                resume: false,
                retire: false,
                core: 0,
            }),
            cv: Condvar::new(),
        })
    }

    /// Turn the calling host thread into a context carrier. Used for the
    /// per-core boot threads, which become the idle threads of their cores.
    pub fn adopt() -> CpuContext {
        CpuContext {
            shared: Self::new_shared(),
        }
    }

    /// Create a fresh context whose carrier runs `body` the first time some
    /// core transfers control to it. `body` receives that first core.
    pub fn spawn<F>(name: String, stack_size: usize, body: F) -> CpuContext
    where
        F: FnOnce(CoreId) + Send + 'static,
    {
        let shared = Self::new_shared();
        let carrier_shared = shared.clone();
        // The machine has no way to report a host error; treat one as fatal.
        thread::Builder::new()
            .name(name)
            .stack_size(stack_size)
            .spawn(move || {
                match Self::park(&carrier_shared) {
                    Wakeup::Retired => {}
                    Wakeup::Resumed => {
                        let core = CoreId(carrier_shared.slot.lock().unwrap().core);
                        super::set_current_core(core);
                        body(core);
                    }
                }
            })
            .expect("machine: failed to start a context carrier");
        CpuContext { shared }
    }

    /// Block until this context is resumed or retired.
    fn park(shared: &Shared) -> Wakeup {
        let mut slot = shared.slot.lock().unwrap();
        loop {
            if slot.retire {
                return Wakeup::Retired;
            }
            if slot.resume {
                slot.resume = false;
                return Wakeup::Resumed;
            }
            slot = shared.cv.wait(slot).unwrap();
        }
    }

    fn unpark(&self, core: CoreId) {
        let mut slot = self.shared.slot.lock().unwrap();
        slot.resume = true;
        slot.core = core.as_usize();
        self.shared.cv.notify_one();
    }

    /// Switch from the current context to `to` on the given core. Parks the
    /// caller; returns when some core transfers control back here (or when
    /// the context is retired while parked).
    pub fn transfer(from: &CpuContext, to: &CpuContext, core: CoreId) -> Wakeup {
        debug_assert!(
            !Arc::ptr_eq(&from.shared, &to.shared),
            "context transfer to self"
        );
        to.unpark(core);
        let wake = Self::park(&from.shared);
        if wake == Wakeup::Resumed {
            let resumed_on = CoreId(from.shared.slot.lock().unwrap().core);
            super::set_current_core(resumed_on);
        }
        wake
    }

    /// Mark the context dead. A parked carrier wakes with Wakeup::Retired
    /// and terminates; a carrier that never ran exits without running its
    /// body.
    pub fn retire(&self) {
        let mut slot = self.shared.slot.lock().unwrap();
        slot.retire = true;
        self.shared.cv.notify_one();
    }
}
