// Boot and process lifecycle scenarios: init identity, exec/wait-child
// plumbing, orphan reparenting, and clean failure when the process table
// runs out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tinyos_kernel::scheduler::types::MAX_PROC;
use tinyos_kernel::{
    boot, sys_exec, sys_get_pid, sys_get_ppid, sys_wait_child, CondVar, Errno, Mutex, ProcessId,
};

#[test]
fn init_gets_pid_one() {
    let code = boot(
        1,
        0,
        Box::new(|_| sys_get_pid().as_usize() as i32),
        None,
    );
    assert_eq!(code, 1);
}

#[test]
fn exec_delivers_child_pid_and_exit_value() {
    let code = boot(
        2,
        0,
        Box::new(|_| {
            assert_eq!(sys_get_ppid(), ProcessId::NOPROC);

            let child = sys_exec(Box::new(|_| 42), None).unwrap();
            let (reaped, value) = sys_wait_child(Some(child)).unwrap();
            assert_eq!(reaped, child);
            assert_eq!(value, 42);
            0
        }),
        None,
    );
    assert_eq!(code, 0);
}

#[test]
fn child_sees_parent_and_arguments() {
    let code = boot(
        2,
        0,
        Box::new(|_| {
            let me = sys_get_pid();
            let child = sys_exec(
                Box::new(move |args| {
                    assert_eq!(args, b"hello");
                    assert_eq!(sys_get_ppid(), me);
                    args.len() as i32
                }),
                Some(b"hello"),
            )
            .unwrap();
            let (_, value) = sys_wait_child(Some(child)).unwrap();
            assert_eq!(value, 5);

            // No arguments at all must work too.
            let quiet = sys_exec(Box::new(|args| args.len() as i32), None).unwrap();
            let (_, value) = sys_wait_child(Some(quiet)).unwrap();
            assert_eq!(value, 0);
            0
        }),
        None,
    );
    assert_eq!(code, 0);
}

#[test]
fn orphans_reparent_to_init() {
    let code = boot(
        2,
        0,
        Box::new(|_| {
            // P starts a grandchild that outlives it, then exits with 100.
            let p = sys_exec(
                Box::new(|_| {
                    sys_exec(
                        Box::new(|_| {
                            static M: Mutex = Mutex::new();
                            static CV: CondVar = CondVar::new();
                            M.lock();
                            let signalled = CV.timed_wait(&M, Duration::from_millis(100));
                            M.unlock();
                            assert!(!signalled);
                            7
                        }),
                        None,
                    )
                    .unwrap();
                    100
                }),
                None,
            )
            .unwrap();

            // Init reaps both exits: its own child P, then the orphaned
            // grandchild.
            let mut values = Vec::new();
            for _ in 0..2 {
                let (pid, value) = sys_wait_child(None).unwrap();
                if pid == p {
                    assert_eq!(value, 100);
                }
                values.push(value);
            }
            values.sort_unstable();
            assert_eq!(values, vec![7, 100]);

            // Nothing else to reap.
            assert_eq!(sys_wait_child(None).unwrap_err(), Errno::Echild);
            0
        }),
        None,
    );
    assert_eq!(code, 0);
}

#[test]
fn exec_fails_cleanly_when_table_is_full() {
    static GATE_M: Mutex = Mutex::new();
    static GATE_CV: CondVar = CondVar::new();
    static RELEASED: AtomicBool = AtomicBool::new(false);

    let code = boot(
        2,
        0,
        Box::new(|_| {
            let mut children = Vec::new();
            loop {
                let result = sys_exec(
                    Box::new(|_| {
                        GATE_M.lock();
                        while !RELEASED.load(Ordering::SeqCst) {
                            GATE_CV.wait(&GATE_M);
                        }
                        GATE_M.unlock();
                        0
                    }),
                    None,
                );
                match result {
                    Ok(pid) => children.push(pid),
                    Err(e) => {
                        assert_eq!(e, Errno::Enfile);
                        break;
                    }
                }
            }
            // Pid 0 is reserved and init holds one slot.
            assert_eq!(children.len(), MAX_PROC - 2);

            GATE_M.lock();
            RELEASED.store(true, Ordering::SeqCst);
            GATE_CV.broadcast();
            GATE_M.unlock();

            for _ in &children {
                sys_wait_child(None).unwrap();
            }
            0
        }),
        None,
    );
    assert_eq!(code, 0);
}
