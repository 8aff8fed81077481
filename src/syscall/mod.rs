/*
 * System Call Surface
 *
 * The public kernel calls, named sys_* in the classic style. Each handler
 * follows the same shape:
 *
 * 1. kill safe point on kernel entry
 * 2. take the kernel lock, do the work, release it
 * 3. kill safe point on kernel exit
 *
 * A handler never unwinds an error out of the kernel: every fallible call
 * returns Result<T, Errno>. The only unwinds are the deliberate exit
 * tokens, which terminate the calling thread at its trampoline.
 *
 * The synchronization calls (mutex and condition variable) live on the
 * sync primitives themselves; they run in the preemptive domain and need
 * no kernel lock.
 */

pub mod errno;

pub use errno::Errno;

use std::sync::atomic::Ordering;

use crate::scheduler::process::ProcessManager;
use crate::scheduler::thread::ThreadManager;
use crate::scheduler::types::{ProcessId, Task, ThreadId, ThreadKind};
use crate::sync;

/// The process of the calling thread.
fn current_process() -> ProcessId {
    ThreadManager::current()
        .owner()
        .expect("system call from outside a process")
}

/// Kill safe point: if this thread's process has a pending kill, exit
/// with value -1 right here. Checked on kernel entry, kernel exit, and
/// when a blocked thread is cancelled out of a wait.
///
/// Safe points are also interrupt delivery points: a quantum that expired
/// while this thread was computing is collected on its way into the
/// kernel.
pub(crate) fn kill_checkpoint() {
    crate::machine::intr_poll();
    let Some(t) = ThreadManager::try_current() else {
        return;
    };
    if t.kind() != ThreadKind::Normal || t.exiting() {
        return;
    }
    if t.kill_flag().load(Ordering::Acquire) {
        log::debug!("{} observed pending kill", t.id());
        exit_now(-1);
    }
}

/// The common exit path of sys_exit and the kill safe point: force the
/// process exit value, cancel sibling threads, then unwind this thread to
/// its trampoline.
fn exit_now(status: i32) -> ! {
    let me = ThreadManager::current();
    me.begin_exiting();
    let pid = me.owner().expect("exit from outside a process");
    sync::kernel_lock();
    ProcessManager::begin_exit(pid, status);
    sync::kernel_unlock();
    ThreadManager::exit_unwind(status)
}

// ============================================================================
// PROCESS CALLS
// ============================================================================

/// Create a child process running `task`. The argument bytes are copied
/// into a buffer owned by the new process; `None` behaves like an empty
/// slice.
pub fn sys_exec(task: Task, args: Option<&[u8]>) -> Result<ProcessId, Errno> {
    kill_checkpoint();
    sync::kernel_lock();
    let result = ProcessManager::exec(current_process(), task, args);
    sync::kernel_unlock();
    kill_checkpoint();
    result
}

/// Terminate the calling process with `status`. Sibling threads are
/// cancelled and exit at their next safe point.
pub fn sys_exit(status: i32) -> ! {
    exit_now(status)
}

/// Wait for a child to exit and reap it. `None` waits for any child;
/// `Some(pid)` for that specific child. Returns the reaped pid and its
/// exit value.
pub fn sys_wait_child(target: Option<ProcessId>) -> Result<(ProcessId, i32), Errno> {
    kill_checkpoint();
    sync::kernel_lock();
    let result = ProcessManager::wait_child(current_process(), target);
    sync::kernel_unlock();
    kill_checkpoint();
    result
}

/// Pid of the calling process
pub fn sys_get_pid() -> ProcessId {
    kill_checkpoint();
    current_process()
}

/// Pid of the calling process's parent (NOPROC for init)
pub fn sys_get_ppid() -> ProcessId {
    kill_checkpoint();
    ProcessManager::parent_of(current_process())
}

/// Post a kill on `target`. Init (pid 1) cannot be killed.
pub fn sys_kill(target: ProcessId) -> Result<(), Errno> {
    kill_checkpoint();
    sync::kernel_lock();
    let result = ProcessManager::kill(target);
    sync::kernel_unlock();
    // A self-kill takes effect right here.
    kill_checkpoint();
    result
}

// ============================================================================
// THREAD CALLS
// ============================================================================

/// Start one more thread in the calling process, running `entry(&args)`.
pub fn sys_create_thread(entry: Task, args: Option<&[u8]>) -> Result<ThreadId, Errno> {
    kill_checkpoint();
    sync::kernel_lock();
    let result = ProcessManager::add_thread(current_process(), entry, args).map(|t| {
        crate::scheduler::wakeup(&t);
        t.id()
    });
    sync::kernel_unlock();
    kill_checkpoint();
    result
}

/// Thread id of the caller
pub fn sys_thread_self() -> ThreadId {
    kill_checkpoint();
    ThreadManager::current().id()
}

/// Wait for a sibling thread to exit and collect its exit value.
pub fn sys_thread_join(tid: ThreadId) -> Result<i32, Errno> {
    kill_checkpoint();
    sync::kernel_lock();
    let result = ThreadManager::join(tid);
    sync::kernel_unlock();
    kill_checkpoint();
    result
}

/// Detach a sibling thread: joiners are refused and the thread reclaims
/// itself on exit.
pub fn sys_thread_detach(tid: ThreadId) -> Result<(), Errno> {
    kill_checkpoint();
    sync::kernel_lock();
    let result = ThreadManager::detach(tid);
    sync::kernel_unlock();
    kill_checkpoint();
    result
}

/// Terminate the calling thread with `value`. The process keeps running
/// while other threads remain.
pub fn sys_thread_exit(value: i32) -> ! {
    ThreadManager::current().begin_exiting();
    ThreadManager::exit_unwind(value)
}
