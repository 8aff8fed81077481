/*
 * Kernel I/O Contract
 *
 * The core kernel does not implement a stream stack, but it does owe the
 * surrounding system three things: file ids are inherited across exec
 * (one extra reference per id), every id is closed when a process
 * terminates, and blocking readers/writers cooperate with the kernel's
 * wait queues. This module provides exactly that surface: the Device
 * trait, the per-process fid table, and a serial stream device that
 * blocks on an I/O wait queue and is woken by serial interrupts.
 */

use std::sync::Arc;

use crate::machine;
use crate::machine::Intr;
use crate::scheduler::types::{Cause, MAX_TERMINALS};
use crate::sync::wait_queue::{WaitChannel, WaitQueue};
use crate::syscall::Errno;

/// File id, an index into a process's fid table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fid(pub usize);

/// Open file ids per process
pub const MAX_FILEID: usize = 16;

/// A byte-stream endpoint
///
/// Methods may block by waiting on kernel wait queues; they must never
/// spin for events. Streams that only support one direction return
/// ESPIPE for the other.
pub trait Device: Send + Sync {
    fn read(&self, _buf: &mut [u8]) -> Result<usize, Errno> {
        Err(Errno::Espipe)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize, Errno> {
        Err(Errno::Espipe)
    }

    /// Called when the last reference to the device goes away.
    fn close(&self) {}
}

// ============================================================================
// FID TABLE
// ============================================================================

/// Per-process table of open devices. A device is shared by reference
/// counting: inheritance clones every slot, and close() releases one
/// reference, notifying the device when it was the last.
pub struct FidTable {
    slots: Vec<Option<Arc<dyn Device>>>,
}

impl FidTable {
    pub fn new() -> FidTable {
        FidTable {
            slots: vec![None; MAX_FILEID],
        }
    }

    /// Install a device in the first free slot.
    pub fn open(&mut self, dev: Arc<dyn Device>) -> Result<Fid, Errno> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(dev);
                return Ok(Fid(i));
            }
        }
        Err(Errno::Emfile)
    }

    pub fn get(&self, fid: Fid) -> Result<Arc<dyn Device>, Errno> {
        self.slots
            .get(fid.0)
            .and_then(Clone::clone)
            .ok_or(Errno::Ebadf)
    }

    /// Release one reference to the device behind `fid`.
    pub fn close(&mut self, fid: Fid) -> Result<(), Errno> {
        let dev = self
            .slots
            .get_mut(fid.0)
            .and_then(Option::take)
            .ok_or(Errno::Ebadf)?;
        Self::release(dev);
        Ok(())
    }

    /// Duplicate the table for a child process: every open id gains one
    /// reference.
    pub fn inherit(&self) -> FidTable {
        FidTable {
            slots: self.slots.clone(),
        }
    }

    /// Close every slot. Used at process termination.
    pub fn close_all(mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(dev) = slot.take() {
                Self::release(dev);
            }
        }
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    fn release(dev: Arc<dyn Device>) {
        if Arc::strong_count(&dev) == 1 {
            dev.close();
        }
    }
}

impl Default for FidTable {
    fn default() -> Self {
        FidTable::new()
    }
}

// ============================================================================
// SERIAL STREAM DEVICE
// ============================================================================

static SERIAL_RX_WAIT: [WaitQueue; MAX_TERMINALS] = [const {
    WaitQueue::new(WaitChannel {
        cause: Cause::Io,
        name: "serial-rx",
    })
}; MAX_TERMINALS];

static SERIAL_TX_WAIT: [WaitQueue; MAX_TERMINALS] = [const {
    WaitQueue::new(WaitChannel {
        cause: Cause::Io,
        name: "serial-tx",
    })
}; MAX_TERMINALS];

fn serial_rx_intr() {
    for port in 0..machine::serial_count() {
        SERIAL_RX_WAIT[port].broadcast();
    }
}

fn serial_tx_intr() {
    for port in 0..machine::serial_count() {
        SERIAL_TX_WAIT[port].broadcast();
    }
}

/// A blocking byte stream over one serial device.
///
/// Reads return at least one byte, sleeping on the port's wait queue
/// while the device is empty; the RX interrupt wakes the readers. A
/// sleeping reader that raced with the readiness edge is rescued by the
/// controller's periodic re-announcement of a still-ready port.
pub struct SerialStream {
    port: usize,
}

impl SerialStream {
    /// Bind serial device `port` to the calling core and return a stream
    /// for it. Installs the serial interrupt handlers on this core and
    /// routes the port's interrupts here.
    pub fn open(port: usize) -> Result<Arc<SerialStream>, Errno> {
        if port >= machine::serial_count() {
            return Err(Errno::Enoent);
        }
        machine::install_intr_handler(Intr::SerialRx, serial_rx_intr);
        machine::install_intr_handler(Intr::SerialTx, serial_tx_intr);
        let here = machine::current_core();
        machine::serial_route(port, Intr::SerialRx, here);
        machine::serial_route(port, Intr::SerialTx, here);
        Ok(Arc::new(SerialStream { port }))
    }
}

impl Device for SerialStream {
    fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let mut n = 0;
            while n < buf.len() {
                match machine::serial_read(self.port) {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            if n > 0 {
                return Ok(n);
            }
            SERIAL_RX_WAIT[self.port].wait(None, None);
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        let mut n = 0;
        while n < buf.len() {
            if machine::serial_write(self.port, buf[n]) {
                n += 1;
            } else {
                SERIAL_TX_WAIT[self.port].wait(None, None);
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDev {
        closes: Arc<AtomicUsize>,
    }

    impl Device for CountingDev {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn inherit_keeps_devices_open_until_last_close() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut parent = FidTable::new();
        let fid = parent
            .open(Arc::new(CountingDev {
                closes: closes.clone(),
            }))
            .unwrap();

        let mut child = parent.inherit();
        assert_eq!(child.open_count(), 1);

        parent.close(fid).unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        child.close(fid).unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(child.close(fid).is_err());
    }

    #[test]
    fn table_overflows_with_emfile() {
        let mut t = FidTable::new();
        let closes = Arc::new(AtomicUsize::new(0));
        for _ in 0..MAX_FILEID {
            t.open(Arc::new(CountingDev {
                closes: closes.clone(),
            }))
            .unwrap();
        }
        let extra: Arc<dyn Device> = Arc::new(CountingDev { closes });
        assert_eq!(t.open(extra).unwrap_err(), Errno::Emfile);
    }
}
