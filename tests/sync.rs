// Synchronization scenarios: condition variable timeouts and signals,
// mutual exclusion under heavy contention, preemption state handling and
// the core timer contract.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tinyos_kernel::{
    boot, machine, scheduler, sys_create_thread, sys_exec, sys_thread_join, sys_wait_child,
    CondVar, Mutex,
};

#[test]
fn cond_timed_wait_times_out() {
    static M: Mutex = Mutex::new();
    static CV: CondVar = CondVar::new();

    let code = boot(
        1,
        0,
        Box::new(|_| {
            let t0 = Instant::now();
            M.lock();
            let signalled = CV.timed_wait(&M, Duration::from_millis(500));
            M.unlock();
            assert!(!signalled);
            assert!(t0.elapsed() >= Duration::from_millis(450));
            0
        }),
        None,
    );
    assert_eq!(code, 0);
}

#[test]
fn cond_timed_wait_sees_a_prompt_signal() {
    static M: Mutex = Mutex::new();
    static CV: CondVar = CondVar::new();
    static SLEEP_M: Mutex = Mutex::new();
    static SLEEP_CV: CondVar = CondVar::new();

    let code = boot(
        2,
        0,
        Box::new(|_| {
            // Take the mutex before starting the signaller: it cannot
            // signal until we are queued on the condition variable.
            M.lock();
            let signaller = sys_exec(
                Box::new(|_| {
                    SLEEP_M.lock();
                    SLEEP_CV.timed_wait(&SLEEP_M, Duration::from_millis(50));
                    SLEEP_M.unlock();

                    M.lock();
                    CV.signal();
                    M.unlock();
                    0
                }),
                None,
            )
            .unwrap();

            let t0 = Instant::now();
            let signalled = CV.timed_wait(&M, Duration::from_secs(10));
            M.unlock();
            assert!(signalled);
            assert!(t0.elapsed() < Duration::from_millis(200));

            sys_wait_child(Some(signaller)).unwrap();
            0
        }),
        None,
    );
    assert_eq!(code, 0);
}

#[test]
fn cond_timed_wait_with_zero_timeout_returns_immediately() {
    static M: Mutex = Mutex::new();
    static CV: CondVar = CondVar::new();

    let code = boot(
        1,
        0,
        Box::new(|_| {
            let t0 = Instant::now();
            M.lock();
            let signalled = CV.timed_wait(&M, Duration::ZERO);
            M.unlock();
            assert!(!signalled);
            assert!(t0.elapsed() < Duration::from_millis(50));
            0
        }),
        None,
    );
    assert_eq!(code, 0);
}

#[test]
fn mutex_provides_mutual_exclusion() {
    const THREADS: usize = 1000;
    const ROUNDS: usize = 1000;

    static M: Mutex = Mutex::new();
    // Load-then-store on purpose: lost updates show up if the lock leaks.
    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    let code = boot(
        4,
        0,
        Box::new(|_| {
            let mut tids = Vec::with_capacity(THREADS);
            for _ in 0..THREADS {
                let tid = sys_create_thread(
                    Box::new(|_| {
                        for _ in 0..ROUNDS {
                            M.lock();
                            let v = COUNTER.load(Ordering::Relaxed);
                            COUNTER.store(v + 1, Ordering::Relaxed);
                            M.unlock();
                        }
                        0
                    }),
                    None,
                )
                .unwrap();
                tids.push(tid);
            }
            for tid in tids {
                sys_thread_join(tid).unwrap();
            }
            assert_eq!(COUNTER.load(Ordering::SeqCst), THREADS * ROUNDS);
            0
        }),
        None,
    );
    assert_eq!(code, 0);
}

#[test]
fn preemption_sections_restore_the_previous_state() {
    let code = boot(
        1,
        0,
        Box::new(|_| {
            assert!(scheduler::core_preemption());

            let outer = scheduler::preempt_off();
            assert!(outer);
            assert!(!scheduler::core_preemption());

            // Nested section: sees preemption already off, changes nothing.
            let inner = scheduler::preempt_off();
            assert!(!inner);
            scheduler::preempt_restore(inner);
            assert!(!scheduler::core_preemption());

            scheduler::preempt_restore(outer);
            assert!(scheduler::core_preemption());
            0
        }),
        None,
    );
    assert_eq!(code, 0);
}

#[test]
fn core_timer_reports_remaining_time() {
    let code = boot(
        1,
        0,
        Box::new(|_| {
            let was = scheduler::preempt_off();
            machine::timer_set(Duration::from_millis(100));
            let remaining = machine::timer_cancel().expect("timer was armed");
            assert!(remaining <= Duration::from_millis(100));
            scheduler::preempt_restore(was);
            0
        }),
        None,
    );
    assert_eq!(code, 0);
}
