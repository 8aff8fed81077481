/*
 * TinyOS Kernel
 *
 * A teaching kernel hosted on a simulated multicore machine. The machine
 * runs each simulated core on a host thread and multiplexes interrupts
 * (timer alarms, inter-core interrupts, serial readiness) from a
 * controller thread; on top of it the kernel provides preemptive
 * scheduling with pluggable policies, wait queues and condition
 * variables, a big kernel lock, and a full process/thread lifecycle with
 * wait-child reaping and orphan reparenting.
 *
 * Layering, bottom up:
 * - machine:   cores, interrupt controller, timers, serial devices,
 *              CPU contexts
 * - sync:      spin-yield mutex, wait queues, condition variables, the
 *              kernel lock
 * - scheduler: thread and process lifecycle, ready/timeout mechanics,
 *              scheduling policies
 * - syscall:   the public kernel call surface
 * - io:        the device contract the stream layer builds on
 *
 * Boot with `boot(ncores, nserial, init_task, args)`; the given task
 * becomes the init process (pid 1) and boot returns its exit value after
 * the machine shuts down.
 */

pub mod io;
pub mod machine;
pub mod scheduler;
pub mod sync;
pub mod syscall;
pub mod utils;

pub use scheduler::boot;
pub use scheduler::process::{ProcStat, ProcessManager};
pub use scheduler::types::{Cause, CoreId, ProcessId, Task, ThreadId};
pub use sync::{CondVar, Mutex};
pub use syscall::{
    Errno, sys_create_thread, sys_exec, sys_exit, sys_get_pid, sys_get_ppid, sys_kill,
    sys_thread_detach, sys_thread_exit, sys_thread_join, sys_thread_self, sys_wait_child,
};
