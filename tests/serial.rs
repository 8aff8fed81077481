// End-to-end serial path: host keyboard bytes travel through the
// interrupt controller into a blocked kernel reader, and console output
// comes back out to the host.

use std::sync::{Arc, Mutex as HostMutex};
use std::thread;
use std::time::{Duration, Instant};

use tinyos_kernel::io::{Device, SerialStream};
use tinyos_kernel::{boot, machine, CondVar, Mutex};

#[test]
fn serial_bytes_round_trip_through_interrupts() {
    let console: Arc<HostMutex<Vec<u8>>> = Arc::new(HostMutex::new(Vec::new()));

    // The host side plays the terminal: feed a line once the machine is
    // up, and collect everything the kernel prints back.
    let host_console = console.clone();
    let terminal = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut fed = false;
        while Instant::now() < deadline {
            if !fed {
                fed = machine::serial_host_feed(0, b"ping\n") == 5;
            }
            let mut out = host_console.lock().unwrap();
            out.extend(machine::serial_host_drain(0));
            if out.ends_with(b"pong\n") {
                break;
            }
            drop(out);
            thread::sleep(Duration::from_millis(5));
        }
    });

    let code = boot(
        2,
        1,
        Box::new(|_| {
            let stream = SerialStream::open(0).unwrap();

            // Block until the whole line arrived.
            let mut line = Vec::new();
            let mut buf = [0u8; 16];
            while !line.ends_with(b"\n") {
                let n = stream.read(&mut buf).unwrap();
                line.extend_from_slice(&buf[..n]);
            }
            assert_eq!(line, b"ping\n");

            assert_eq!(stream.write(b"pong\n").unwrap(), 5);

            // Linger so the host drains the console before teardown.
            static M: Mutex = Mutex::new();
            static CV: CondVar = CondVar::new();
            M.lock();
            CV.timed_wait(&M, Duration::from_millis(300));
            M.unlock();
            0
        }),
        None,
    );
    assert_eq!(code, 0);

    terminal.join().unwrap();
    assert!(console.lock().unwrap().ends_with(b"pong\n"));
}
