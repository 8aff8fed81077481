/*
 * TinyOS Demo
 *
 * Boots the kernel on two cores with one serial device and runs a small
 * multi-process workload: init starts worker processes that hammer a
 * shared counter under a mutex/condition-variable pair, waits for all of
 * them, then reports through the serial console. The host side of this
 * binary plays the terminal: it drains the console stream and prints it.
 */

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tinyos_kernel::io::{Device, SerialStream};
use tinyos_kernel::{boot, machine, sys_exec, sys_get_pid, sys_wait_child, CondVar, Mutex};

const WORKERS: usize = 4;
const ROUNDS: usize = 10_000;

static COUNTER: AtomicUsize = AtomicUsize::new(0);
static TURNSTILE: Mutex = Mutex::new();
static ALL_DONE: CondVar = CondVar::new();
static DONE_WORKERS: AtomicUsize = AtomicUsize::new(0);

fn worker(args: &[u8]) -> i32 {
    let my_index = args[0] as i32;
    for _ in 0..ROUNDS {
        TURNSTILE.lock();
        COUNTER.fetch_add(1, Ordering::Relaxed);
        TURNSTILE.unlock();
    }
    TURNSTILE.lock();
    if DONE_WORKERS.fetch_add(1, Ordering::Relaxed) + 1 == WORKERS {
        ALL_DONE.broadcast();
    }
    TURNSTILE.unlock();
    my_index
}

fn demo_init(_args: &[u8]) -> i32 {
    log::info!("init: {} online", sys_get_pid());

    for i in 0..WORKERS {
        let pid = sys_exec(Box::new(worker), Some(&[i as u8])).expect("exec failed");
        log::info!("init: started worker {} as {}", i, pid);
    }

    // Block until the last worker announces itself, then reap them all.
    TURNSTILE.lock();
    while DONE_WORKERS.load(Ordering::Relaxed) < WORKERS {
        ALL_DONE.wait(&TURNSTILE);
    }
    TURNSTILE.unlock();

    let mut reaped = Vec::new();
    for _ in 0..WORKERS {
        let (pid, value) = sys_wait_child(None).expect("wait failed");
        reaped.push((pid, value));
    }

    let total = COUNTER.load(Ordering::Relaxed);
    let report = format!(
        "counter={} (expected {}), reaped {} workers\n",
        total,
        WORKERS * ROUNDS,
        reaped.len()
    );
    let console = SerialStream::open(0).expect("no serial device");
    console.write(report.as_bytes()).expect("console write");

    log::info!("init: {}", report.trim());
    if total == WORKERS * ROUNDS { 0 } else { 1 }
}

fn main() {
    static BOOTED: AtomicBool = AtomicBool::new(false);

    // The terminal side: drain the console stream while the machine runs.
    let terminal = std::thread::spawn(|| {
        loop {
            let bytes = machine::serial_host_drain(0);
            if !bytes.is_empty() {
                print!("{}", String::from_utf8_lossy(&bytes));
            }
            if BOOTED.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
    });

    let code = boot(2, 1, Box::new(demo_init), None);
    BOOTED.store(true, Ordering::Release);
    terminal.join().unwrap();

    log::info!("demo: init exited with {}", code);
    std::process::exit(code);
}
