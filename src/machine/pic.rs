/*
 * Interrupt Controller Multiplexer
 *
 * A single loop, run on the thread that called vm_boot, that turns wall
 * clock time and serial readiness into per-core interrupts:
 *
 * 1. Advances the machine's coarse clock.
 * 2. Drains fired per-core one-shot timers and raises ALARM on the
 *    corresponding core.
 * 3. Polls every serial device for readiness transitions and raises
 *    SERIAL_RX / SERIAL_TX on the core currently routed for that port.
 *    A port that stays ready is re-announced after a grace period, so a
 *    consumer that missed the original edge is not stranded.
 *
 * The loop exits once every core worker has returned.
 */

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use super::core::Intr;
use super::Machine;

/// Multiplexer resolution
pub const PIC_TICK: Duration = Duration::from_millis(2);

/// Re-announce period for a serial port that stays ready
pub const SERIAL_GRACE: Duration = Duration::from_millis(50);

pub(super) fn multiplex(m: &Arc<Machine>) {
    log::info!(
        "pic: multiplexer online ({} core(s), {} serial port(s), {:?} tick)",
        m.cores.len(),
        m.serial.len(),
        PIC_TICK
    );

    loop {
        if m.workers_alive.load(Ordering::Acquire) == 0 {
            break;
        }

        let now = Instant::now();
        m.clock_ms
            .store(m.boot_at.elapsed().as_millis() as u64, Ordering::Release);

        // Timers first: quantum expiry drives everything else.
        for core in &m.cores {
            if core.timer_fired(now) {
                m.raise_and_wake(core.id, Intr::Alarm);
            }
        }

        for port in &m.serial {
            if port.rx_announce_due(now, SERIAL_GRACE) {
                m.raise_and_wake(port.routed_core(Intr::SerialRx), Intr::SerialRx);
            }
            if port.tx_announce_due(now, SERIAL_GRACE) {
                m.raise_and_wake(port.routed_core(Intr::SerialTx), Intr::SerialTx);
            }
        }

        thread::sleep(PIC_TICK);
    }

    log::info!("pic: multiplexer offline");
}
