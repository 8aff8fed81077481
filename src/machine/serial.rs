/*
 * Serial Devices
 *
 * Each serial device models a terminal with two byte streams: a keyboard
 * stream the host feeds into the machine and a console stream the machine
 * writes back to the host. Kernel-side access is one byte at a time and
 * never blocks; readiness transitions are observed by the interrupt
 * controller, which raises SERIAL_RX / SERIAL_TX on the core the port is
 * routed to.
 */

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::collections::VecDeque;
use std::time::Instant;

use spin::Mutex;

use super::core::Intr;
use crate::scheduler::types::CoreId;

/// Capacity of each direction's byte ring
pub const SERIAL_RING_CAP: usize = 4096;

/// Bounded FIFO of raw bytes
pub struct ByteRing {
    buf: VecDeque<u8>,
    cap: usize,
}

impl ByteRing {
    pub fn new(cap: usize) -> Self {
        ByteRing {
            buf: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Append one byte. Returns false when the ring is full.
    pub fn push(&mut self, b: u8) -> bool {
        if self.buf.len() >= self.cap {
            return false;
        }
        self.buf.push_back(b);
        true
    }

    pub fn pop(&mut self) -> Option<u8> {
        self.buf.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.cap
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
}

/// One serial device
pub struct SerialPort {
    /// Host -> kernel bytes (the "keyboard")
    keyboard: Mutex<ByteRing>,

    /// Kernel -> host bytes (the "console")
    console: Mutex<ByteRing>,

    // Controller-side readiness tracking. An edge from not-ready to ready
    // raises an interrupt; a port that stays ready is re-announced after a
    // grace period so a consumer that missed the edge is not stranded.
    rx_was_ready: AtomicBool,
    tx_was_ready: AtomicBool,
    rx_announced: Mutex<Instant>,
    tx_announced: Mutex<Instant>,

    /// Interrupt routing, per kind
    rx_core: AtomicUsize,
    tx_core: AtomicUsize,
}

impl SerialPort {
    pub fn new() -> Self {
        let now = Instant::now();
        SerialPort {
            keyboard: Mutex::new(ByteRing::new(SERIAL_RING_CAP)),
            console: Mutex::new(ByteRing::new(SERIAL_RING_CAP)),
            rx_was_ready: AtomicBool::new(false),
            tx_was_ready: AtomicBool::new(false),
            rx_announced: Mutex::new(now),
            tx_announced: Mutex::new(now),
            rx_core: AtomicUsize::new(0),
            tx_core: AtomicUsize::new(0),
        }
    }

    // ========================================================================
    // KERNEL SIDE (non-blocking, one byte at a time)
    // ========================================================================

    /// Read one keyboard byte if available
    pub fn read_byte(&self) -> Option<u8> {
        self.keyboard.lock().pop()
    }

    /// Write one console byte. Returns false when the console ring is full.
    pub fn write_byte(&self, b: u8) -> bool {
        self.console.lock().push(b)
    }

    /// The port is readable when keyboard bytes are queued
    pub fn rx_ready(&self) -> bool {
        !self.keyboard.lock().is_empty()
    }

    /// The port is writable while the console ring has room
    pub fn tx_ready(&self) -> bool {
        !self.console.lock().is_full()
    }

    // ========================================================================
    // ROUTING
    // ========================================================================

    pub fn route(&self, kind: Intr, core: CoreId) {
        match kind {
            Intr::SerialRx => self.rx_core.store(core.as_usize(), Ordering::Release),
            Intr::SerialTx => self.tx_core.store(core.as_usize(), Ordering::Release),
            _ => {}
        }
    }

    pub fn routed_core(&self, kind: Intr) -> CoreId {
        match kind {
            Intr::SerialTx => CoreId(self.tx_core.load(Ordering::Acquire)),
            _ => CoreId(self.rx_core.load(Ordering::Acquire)),
        }
    }

    // ========================================================================
    // CONTROLLER SIDE
    // ========================================================================

    /// Decide whether an RX interrupt is due: a readiness edge, or a still
    /// ready port whose last announcement is older than the grace period.
    pub fn rx_announce_due(&self, now: Instant, grace: std::time::Duration) -> bool {
        let ready = self.rx_ready();
        let was = self.rx_was_ready.swap(ready, Ordering::AcqRel);
        if !ready {
            return false;
        }
        let mut last = self.rx_announced.lock();
        if !was || now.duration_since(*last) >= grace {
            *last = now;
            return true;
        }
        false
    }

    /// Same as rx_announce_due, for the console direction.
    pub fn tx_announce_due(&self, now: Instant, grace: std::time::Duration) -> bool {
        let ready = self.tx_ready();
        let was = self.tx_was_ready.swap(ready, Ordering::AcqRel);
        if !ready {
            return false;
        }
        let mut last = self.tx_announced.lock();
        if !was || now.duration_since(*last) >= grace {
            *last = now;
            return true;
        }
        false
    }

    // ========================================================================
    // HOST SIDE
    // ========================================================================

    /// Feed keyboard input into the device. Returns how many bytes fit.
    pub fn host_feed(&self, bytes: &[u8]) -> usize {
        let mut ring = self.keyboard.lock();
        let mut n = 0;
        for &b in bytes {
            if !ring.push(b) {
                break;
            }
            n += 1;
        }
        n
    }

    /// Drain everything the kernel wrote to the console so far.
    pub fn host_drain(&self) -> Vec<u8> {
        let mut ring = self.console.lock();
        let mut out = Vec::with_capacity(ring.len());
        while let Some(b) = ring.pop() {
            out.push(b);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_fifo_and_bounded() {
        let mut ring = ByteRing::new(3);
        assert!(ring.push(1));
        assert!(ring.push(2));
        assert!(ring.push(3));
        assert!(ring.is_full());
        assert!(!ring.push(4));
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn port_moves_bytes_both_ways() {
        let port = SerialPort::new();
        assert_eq!(port.host_feed(b"ok"), 2);
        assert!(port.rx_ready());
        assert_eq!(port.read_byte(), Some(b'o'));
        assert_eq!(port.read_byte(), Some(b'k'));
        assert_eq!(port.read_byte(), None);

        assert!(port.write_byte(b'!'));
        assert_eq!(port.host_drain(), vec![b'!']);
        assert!(port.host_drain().is_empty());
    }

    #[test]
    fn rx_announce_fires_on_edge_then_after_grace() {
        let grace = std::time::Duration::from_millis(50);
        let port = SerialPort::new();
        let t0 = Instant::now();
        assert!(!port.rx_announce_due(t0, grace));

        port.host_feed(b"x");
        assert!(port.rx_announce_due(t0, grace));
        // Still ready, inside the grace window: stay quiet.
        assert!(!port.rx_announce_due(t0 + std::time::Duration::from_millis(10), grace));
        // Still ready past the grace window: announce again.
        assert!(port.rx_announce_due(t0 + std::time::Duration::from_millis(60), grace));
    }
}
