/*
 * Per-Core Control
 *
 * This module defines CoreCtl, the control block of one simulated CPU core:
 * the pending-interrupt bitmap, the interrupts-disabled flag, the interrupt
 * vector and the per-core one-shot timer.
 *
 * INTERRUPT DELIVERY MODEL:
 * =========================
 *
 * The interrupt controller publishes interrupt kinds into the pending
 * bitmap with release ordering and unparks the core if it is halted. The
 * core drains the bitmap at its interrupt points (enabling interrupts,
 * halting, the lock slow paths). Each kind is edge triggered and carries at
 * most one pending bit: the bit is cleared before its handler runs, so a
 * handler may re-raise its own kind.
 *
 * While interrupts are disabled the bits only accumulate; they are drained
 * on the next enable.
 */

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use spin::Mutex;

use crate::scheduler::types::CoreId;

bitflags! {
    /// Pending interrupt set of one core
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntrSet: u8 {
        const ALARM     = 1;
        const ICI       = 1 << 1;
        const SERIAL_RX = 1 << 2;
        const SERIAL_TX = 1 << 3;
    }
}

/// Interrupt kinds, in dispatch order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intr {
    /// The core timer fired
    Alarm,
    /// Inter-core interrupt raised by a peer
    Ici,
    /// A serial device routed to this core became readable
    SerialRx,
    /// A serial device routed to this core became writable
    SerialTx,
}

impl Intr {
    /// Handlers run in this fixed order when several kinds are pending
    pub const DISPATCH_ORDER: [Intr; 4] = [Intr::Alarm, Intr::Ici, Intr::SerialRx, Intr::SerialTx];

    pub(crate) fn bit(self) -> IntrSet {
        match self {
            Intr::Alarm => IntrSet::ALARM,
            Intr::Ici => IntrSet::ICI,
            Intr::SerialRx => IntrSet::SERIAL_RX,
            Intr::SerialTx => IntrSet::SERIAL_TX,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Intr::Alarm => 0,
            Intr::Ici => 1,
            Intr::SerialRx => 2,
            Intr::SerialTx => 3,
        }
    }
}

/// An installed interrupt handler
///
/// Handlers are plain functions: all kernel state lives in globals, so no
/// captured environment is needed. Handlers run on the interrupted core
/// with interrupt delivery implicitly suppressed for their kind (the
/// pending bit was consumed) and may yield.
pub type IntrHandler = fn();

/// Control block of one simulated core
pub struct CoreCtl {
    pub id: CoreId,

    /// Pending interrupt kinds, published by the controller thread
    pending: AtomicU8,

    /// Interrupts-disabled flag, owned by code running on this core
    disabled: AtomicBool,

    /// Interrupt vector: one handler slot per kind.
    /// Written only by code running on this core.
    vector: Mutex<[Option<IntrHandler>; 4]>,

    /// One-shot timer deadline, polled by the controller thread
    timer: Mutex<Option<Instant>>,
}

impl CoreCtl {
    pub fn new(id: CoreId) -> Self {
        CoreCtl {
            id,
            pending: AtomicU8::new(0),
            disabled: AtomicBool::new(false),
            vector: Mutex::new([None; 4]),
            timer: Mutex::new(None),
        }
    }

    // ========================================================================
    // PENDING BITMAP
    // ========================================================================

    /// Publish an interrupt kind to this core. Returns true if the bit was
    /// not already pending.
    pub fn raise(&self, kind: Intr) -> bool {
        let bit = kind.bit().bits();
        self.pending.fetch_or(bit, Ordering::Release) & bit == 0
    }

    /// True if any kind is pending
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != 0
    }

    /// Consume the whole pending set. The caller dispatches the returned
    /// kinds; anything raised afterwards lands in a fresh set.
    pub fn take_pending(&self) -> IntrSet {
        IntrSet::from_bits_truncate(self.pending.swap(0, Ordering::AcqRel))
    }

    /// Consume the first pending kind in dispatch order, if any. Kinds not
    /// consumed stay pending, so a handler that suspends the caller leaves
    /// the rest for whoever runs on this core next.
    pub fn take_one(&self) -> Option<Intr> {
        loop {
            let cur = self.pending.load(Ordering::Acquire);
            if cur == 0 {
                return None;
            }
            for kind in Intr::DISPATCH_ORDER {
                let bit = kind.bit().bits();
                if cur & bit != 0 {
                    if self
                        .pending
                        .compare_exchange(cur, cur & !bit, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Some(kind);
                    }
                    break;
                }
            }
        }
    }

    // ========================================================================
    // DISABLED FLAG
    // ========================================================================

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Release);
    }

    pub fn disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    // ========================================================================
    // INTERRUPT VECTOR
    // ========================================================================

    pub fn install_handler(&self, kind: Intr, handler: IntrHandler) {
        self.vector.lock()[kind.index()] = Some(handler);
    }

    pub fn remove_handler(&self, kind: Intr) {
        self.vector.lock()[kind.index()] = None;
    }

    pub fn handler(&self, kind: Intr) -> Option<IntrHandler> {
        self.vector.lock()[kind.index()]
    }

    // ========================================================================
    // ONE-SHOT TIMER
    // ========================================================================

    /// Arm the timer. Any previously armed deadline is cancelled; its
    /// remaining time is returned.
    pub fn timer_set(&self, after: Duration) -> Option<Duration> {
        let now = Instant::now();
        let prev = self.timer.lock().replace(now + after);
        prev.map(|d| d.saturating_duration_since(now))
    }

    /// Disarm the timer, returning the remaining time if it was armed.
    pub fn timer_cancel(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timer
            .lock()
            .take()
            .map(|d| d.saturating_duration_since(now))
    }

    /// Controller-side check: take the deadline if it has passed.
    pub fn timer_fired(&self, now: Instant) -> bool {
        let mut slot = self.timer.lock();
        match *slot {
            Some(deadline) if deadline <= now => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_bits_accumulate_and_drain() {
        let core = CoreCtl::new(CoreId(0));
        assert!(core.raise(Intr::Alarm));
        assert!(!core.raise(Intr::Alarm));
        assert!(core.raise(Intr::Ici));
        let set = core.take_pending();
        assert_eq!(set, IntrSet::ALARM | IntrSet::ICI);
        assert!(!core.has_pending());
    }

    #[test]
    fn timer_set_reports_previous_remaining() {
        let core = CoreCtl::new(CoreId(0));
        assert_eq!(core.timer_set(Duration::from_millis(50)), None);
        let prev = core.timer_set(Duration::from_millis(10)).unwrap();
        assert!(prev <= Duration::from_millis(50));
        let rem = core.timer_cancel().unwrap();
        assert!(rem <= Duration::from_millis(10));
        assert_eq!(core.timer_cancel(), None);
    }
}
