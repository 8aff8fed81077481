// Thread and kill lifecycle scenarios: join/detach semantics with their
// error cases, cooperative kill of a blocked process, and wait-child
// validation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tinyos_kernel::{
    boot, sys_create_thread, sys_exec, sys_get_pid, sys_kill, sys_thread_detach, sys_thread_join,
    sys_thread_self, sys_wait_child, CondVar, Errno, Mutex, ProcessId,
};

fn nap(ms: u64) {
    static M: Mutex = Mutex::new();
    static CV: CondVar = CondVar::new();
    M.lock();
    CV.timed_wait(&M, Duration::from_millis(ms));
    M.unlock();
}

#[test]
fn kill_terminates_a_blocked_child() {
    static M: Mutex = Mutex::new();
    static CV: CondVar = CondVar::new();

    let code = boot(
        2,
        0,
        Box::new(|_| {
            let child = sys_exec(
                Box::new(|_| {
                    M.lock();
                    loop {
                        CV.wait(&M);
                    }
                }),
                None,
            )
            .unwrap();

            // Let the child reach its wait, then kill it.
            nap(100);
            sys_kill(child).unwrap();

            let (reaped, value) = sys_wait_child(Some(child)).unwrap();
            assert_eq!(reaped, child);
            assert_eq!(value, -1);
            0
        }),
        None,
    );
    assert_eq!(code, 0);
}

#[test]
fn kill_validates_its_target() {
    let code = boot(
        1,
        0,
        Box::new(|_| {
            assert_eq!(sys_kill(ProcessId::INIT).unwrap_err(), Errno::Eperm);
            assert_eq!(sys_kill(ProcessId(123)).unwrap_err(), Errno::Einval);
            0
        }),
        None,
    );
    assert_eq!(code, 0);
}

#[test]
fn thread_join_delivers_the_exit_value() {
    let code = boot(
        2,
        0,
        Box::new(|_| {
            let tid = sys_create_thread(Box::new(|_| 5), None).unwrap();
            assert_eq!(sys_thread_join(tid).unwrap(), 5);

            // The control block is reclaimed after the join.
            assert_eq!(sys_thread_join(tid).unwrap_err(), Errno::Enoent);
            0
        }),
        None,
    );
    assert_eq!(code, 0);
}

#[test]
fn join_rejects_self_detached_and_finished_targets() {
    static GATE_M: Mutex = Mutex::new();
    static GATE_CV: CondVar = CondVar::new();
    static RELEASED: AtomicBool = AtomicBool::new(false);

    let code = boot(
        2,
        0,
        Box::new(|_| {
            // Self-join is refused.
            let me = sys_thread_self();
            assert_eq!(sys_thread_join(me).unwrap_err(), Errno::Einval);

            // A detached thread cannot be joined.
            let parked = sys_create_thread(
                Box::new(|_| {
                    GATE_M.lock();
                    while !RELEASED.load(Ordering::SeqCst) {
                        GATE_CV.wait(&GATE_M);
                    }
                    GATE_M.unlock();
                    0
                }),
                None,
            )
            .unwrap();
            sys_thread_detach(parked).unwrap();
            assert_eq!(sys_thread_join(parked).unwrap_err(), Errno::Einval);

            // Detach after exit is refused.
            let done = sys_create_thread(Box::new(|_| 9), None).unwrap();
            nap(100);
            assert_eq!(sys_thread_detach(done).unwrap_err(), Errno::Einval);
            assert_eq!(sys_thread_join(done).unwrap(), 9);

            GATE_M.lock();
            RELEASED.store(true, Ordering::SeqCst);
            GATE_CV.broadcast();
            GATE_M.unlock();
            0
        }),
        None,
    );
    assert_eq!(code, 0);
}

#[test]
fn wait_child_validates_its_target() {
    let code = boot(
        1,
        0,
        Box::new(|_| {
            // No children at all.
            assert_eq!(sys_wait_child(None).unwrap_err(), Errno::Echild);

            // The caller itself is not a waitable child.
            let me = sys_get_pid();
            assert_eq!(sys_wait_child(Some(me)).unwrap_err(), Errno::Echild);

            // Neither is an arbitrary unrelated pid.
            assert_eq!(
                sys_wait_child(Some(ProcessId(77))).unwrap_err(),
                Errno::Echild
            );
            0
        }),
        None,
    );
    assert_eq!(code, 0);
}

#[test]
fn exit_value_of_a_killed_child_wins_over_late_threads() {
    static M: Mutex = Mutex::new();
    static CV: CondVar = CondVar::new();

    let code = boot(
        2,
        0,
        Box::new(|_| {
            // The child parks a second thread too; both must die on kill
            // and the recorded exit value must be the kill's -1.
            let child = sys_exec(
                Box::new(|_| {
                    sys_create_thread(
                        Box::new(|_| {
                            M.lock();
                            loop {
                                CV.wait(&M);
                            }
                        }),
                        None,
                    )
                    .unwrap();
                    M.lock();
                    loop {
                        CV.wait(&M);
                    }
                }),
                None,
            )
            .unwrap();

            nap(100);
            sys_kill(child).unwrap();
            let (_, value) = sys_wait_child(Some(child)).unwrap();
            assert_eq!(value, -1);
            0
        }),
        None,
    );
    assert_eq!(code, 0);
}
