/*
 * Process Management
 *
 * A process is a container for threads, a file-id table and an exit
 * value, arranged in a parent/child tree rooted at init (pid 1). This
 * module implements the fixed-size process table and the lifecycle:
 * exec, exit aggregation, orphan reparenting, wait-child reaping and
 * cooperative kill.
 *
 * LIFETIMES:
 * ==========
 *
 * A slot is allocated at exec and stays ALIVE while the process has live
 * threads. When the last thread exits the process turns ZOMBIE: files are
 * closed, living children are reparented to init, and the parent is
 * signalled. The slot is freed only when the parent reaps it through
 * wait-child, so exit values are never lost.
 *
 * Every operation in this module runs under the kernel lock; the spin
 * lock on the table only makes the shared data race-free.
 */

use core::sync::atomic::AtomicBool;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use lazy_static::lazy_static;

use crate::io::FidTable;
use crate::machine;
use crate::scheduler;
use crate::scheduler::thread::{Thread, ThreadManager};
use crate::sync;
use crate::sync::wait_queue::{WaitChannel, WaitQueue};
use crate::syscall::Errno;

use super::types::{Cause, MAX_PROC, ProcessId, Task, ThreadId};

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// At least one thread is still around
    Alive,
    /// Terminated, waiting for the parent to reap the exit value
    Zombie,
}

/// Process control block
pub struct Process {
    pub pid: ProcessId,
    pub parent: ProcessId,
    pub state: ProcState,

    pub live_threads: usize,
    pub main: Option<ThreadId>,
    pub threads: Vec<ThreadId>,

    pub exit_value: i32,
    exit_value_set: bool,

    /// Unreaped children, alive or zombie
    pub children: Vec<ProcessId>,
    /// Children that turned zombie and await reaping, oldest first
    pub exited: VecDeque<ProcessId>,

    /// Waiters in wait-child with no specific pid
    wait_any: Arc<WaitQueue>,
    /// Waiters in wait-child for one specific pid
    wait_specific: Arc<WaitQueue>,

    /// Kill bit, shared with every thread of the process
    kill_flag: Arc<AtomicBool>,

    pub fids: FidTable,

    /// Process arguments, owned here and shared with the main task
    pub args: Arc<[u8]>,
}

impl Process {
    fn new(pid: ProcessId, parent: ProcessId, fids: FidTable, args: Arc<[u8]>) -> Process {
        Process {
            pid,
            parent,
            state: ProcState::Alive,
            live_threads: 0,
            main: None,
            threads: Vec::new(),
            exit_value: 0,
            exit_value_set: false,
            children: Vec::new(),
            exited: VecDeque::new(),
            wait_any: Arc::new(WaitQueue::new(WaitChannel {
                cause: Cause::Join,
                name: "wait-any",
            })),
            wait_specific: Arc::new(WaitQueue::new(WaitChannel {
                cause: Cause::Join,
                name: "wait-child",
            })),
            kill_flag: Arc::new(AtomicBool::new(false)),
            fids,
            args,
        }
    }

    pub fn is_zombie(&self) -> bool {
        self.state == ProcState::Zombie
    }
}

/// Diagnostic snapshot of one process
#[derive(Debug, Clone)]
pub struct ProcStat {
    pub pid: ProcessId,
    pub parent: ProcessId,
    pub state: ProcState,
    pub live_threads: usize,
    pub exit_value: i32,
    pub args_len: usize,
}

// ============================================================================
// PROCESS TABLE
// ============================================================================

pub(crate) struct ProcTable {
    slots: Vec<Option<Process>>,
    last_pid: usize,
}

impl ProcTable {
    fn new() -> ProcTable {
        ProcTable {
            slots: (0..MAX_PROC).map(|_| None).collect(),
            last_pid: 0,
        }
    }

    /// Find a free slot, scanning circularly from the last allocation so
    /// pids are not reused immediately. Pid 0 is never handed out.
    fn alloc_pid(&mut self) -> Option<ProcessId> {
        for step in 1..MAX_PROC {
            let pid = (self.last_pid + step) % MAX_PROC;
            if pid == 0 {
                continue;
            }
            if self.slots[pid].is_none() {
                self.last_pid = pid;
                return Some(ProcessId(pid));
            }
        }
        None
    }

    fn get(&self, pid: ProcessId) -> Option<&Process> {
        self.slots.get(pid.as_usize())?.as_ref()
    }

    fn get_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.slots.get_mut(pid.as_usize())?.as_mut()
    }

    fn remove(&mut self, pid: ProcessId) -> Option<Process> {
        self.slots.get_mut(pid.as_usize())?.take()
    }

    fn total_live_threads(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(|p| p.live_threads)
            .sum()
    }
}

lazy_static! {
    static ref PROCESS_TABLE: spin::Mutex<ProcTable> = spin::Mutex::new(ProcTable::new());
}

// ============================================================================
// PROCESS MANAGER
// ============================================================================

/// Process lifecycle operations
///
/// ProcessManager is a zero-sized type grouping the process operations
/// under one namespace. Unless noted otherwise, callers hold the kernel
/// lock.
pub struct ProcessManager;

impl ProcessManager {
    /// Empty the table. Called once per machine boot.
    pub(crate) fn reset() {
        *PROCESS_TABLE.lock() = ProcTable::new();
    }

    /// Create the init process (pid 1). Called once from the boot core.
    pub(crate) fn spawn_init(task: Task, args: Option<&[u8]>) {
        let pid = Self::exec_inner(ProcessId::NOPROC, task, args)
            .expect("boot: failed to create the init process");
        assert_eq!(pid, ProcessId::INIT, "boot: init did not get pid 1");
    }

    /// Create a new process running `task`, child of `parent`.
    pub(crate) fn exec(
        parent: ProcessId,
        task: Task,
        args: Option<&[u8]>,
    ) -> Result<ProcessId, Errno> {
        Self::exec_inner(parent, task, args)
    }

    fn exec_inner(
        parent: ProcessId,
        task: Task,
        args: Option<&[u8]>,
    ) -> Result<ProcessId, Errno> {
        let args: Arc<[u8]> = Arc::from(args.unwrap_or(&[]));

        let (pid, kill_flag) = {
            let mut tbl = PROCESS_TABLE.lock();
            let pid = tbl.alloc_pid().ok_or(Errno::Enfile)?;
            // The child starts with the parent's open files, one extra
            // reference per fid.
            let fids = match tbl.get(parent) {
                Some(pp) => pp.fids.inherit(),
                None => FidTable::new(),
            };
            let proc = Process::new(pid, parent, fids, args.clone());
            let kill_flag = proc.kill_flag.clone();
            tbl.slots[pid.as_usize()] = Some(proc);
            if let Some(pp) = tbl.get_mut(parent) {
                pp.children.push(pid);
            }
            (pid, kill_flag)
        };

        let name = format!("proc-{}", pid.as_usize());
        let thread = match ThreadManager::spawn(pid, kill_flag, name, task, args) {
            Ok(t) => t,
            Err(e) => {
                // No partial state: give the slot back.
                let mut tbl = PROCESS_TABLE.lock();
                tbl.remove(pid);
                if let Some(pp) = tbl.get_mut(parent) {
                    pp.children.retain(|c| *c != pid);
                }
                return Err(e);
            }
        };

        {
            let mut tbl = PROCESS_TABLE.lock();
            let p = tbl.get_mut(pid).expect("fresh process vanished");
            p.main = Some(thread.id());
            p.threads.push(thread.id());
            p.live_threads = 1;
        }

        scheduler::wakeup(&thread);
        log::info!("created process {} (parent {})", pid, parent);
        Ok(pid)
    }

    /// Add one more thread to `pid`. Returns the control block, already
    /// registered but not yet runnable.
    pub(crate) fn add_thread(pid: ProcessId, task: Task, args: Option<&[u8]>) -> Result<Arc<Thread>, Errno> {
        let kill_flag = {
            let tbl = PROCESS_TABLE.lock();
            tbl.get(pid).ok_or(Errno::Enoent)?.kill_flag.clone()
        };
        let args: Arc<[u8]> = Arc::from(args.unwrap_or(&[]));
        let name = format!("thr-{}", pid.as_usize());
        let thread = ThreadManager::spawn(pid, kill_flag, name, task, args)?;
        let mut tbl = PROCESS_TABLE.lock();
        match tbl.get_mut(pid) {
            Some(p) => {
                p.threads.push(thread.id());
                p.live_threads += 1;
            }
            None => {
                drop(tbl);
                ThreadManager::drop_join_ref(&thread);
                ThreadManager::release_ref(&thread);
                return Err(Errno::Enoent);
            }
        }
        Ok(thread)
    }

    /// Called from the thread exit path. Decrements the live-thread count
    /// and finalizes the process when it reaches zero.
    pub(crate) fn on_thread_exit(thread: &Arc<Thread>) {
        let Some(pid) = thread.owner() else { return };
        let finalize = {
            let mut tbl = PROCESS_TABLE.lock();
            let Some(p) = tbl.get_mut(pid) else { return };
            p.live_threads -= 1;
            if p.main == Some(thread.id()) && !p.exit_value_set {
                p.exit_value = thread.exit_value();
                p.exit_value_set = true;
            }
            p.live_threads == 0
        };
        if finalize {
            Self::finalize(pid);
        }
    }

    /// Force the process exit value ahead of thread termination and post
    /// the kill bit to every sibling thread. Used by the exit call so the
    /// value of record is the one passed to it, whichever thread runs the
    /// exit protocol last.
    pub(crate) fn begin_exit(pid: ProcessId, status: i32) {
        let threads = {
            let mut tbl = PROCESS_TABLE.lock();
            let Some(p) = tbl.get_mut(pid) else { return };
            if !p.exit_value_set {
                p.exit_value = status;
                p.exit_value_set = true;
            }
            p.kill_flag.store(true, Ordering::Release);
            p.threads.clone()
        };
        let me = ThreadManager::current().id();
        for tid in threads {
            if tid == me {
                continue;
            }
            if let Some(t) = scheduler::lookup_thread(tid) {
                t.post_cancel();
                scheduler::wakeup(&t);
            }
        }
    }

    /// Turn `pid` into a zombie: close its files, hand surviving children
    /// to init, queue it on the parent's reap list and wake the parent.
    fn finalize(pid: ProcessId) {
        let mut queues_to_wake: Vec<Arc<WaitQueue>> = Vec::new();
        let (fids, threads, exit_value) = {
            let mut tbl = PROCESS_TABLE.lock();
            let p = tbl.get_mut(pid).expect("finalize of a missing process");
            p.state = ProcState::Zombie;
            let children = std::mem::take(&mut p.children);
            let zombies = std::mem::take(&mut p.exited);
            let fids = std::mem::take(&mut p.fids);
            let threads = p.threads.clone();
            let parent = p.parent;
            let exit_value = p.exit_value;

            // Orphans go to init: living children are reparented, already
            // exited ones move onto init's reap list.
            for c in &children {
                if let Some(cp) = tbl.get_mut(*c) {
                    cp.parent = ProcessId::INIT;
                }
            }
            if pid != ProcessId::INIT && (!children.is_empty() || !zombies.is_empty()) {
                if let Some(init) = tbl.get_mut(ProcessId::INIT) {
                    init.children.extend(children);
                    let had_zombies = !zombies.is_empty();
                    init.exited.extend(zombies);
                    if had_zombies {
                        queues_to_wake.push(init.wait_any.clone());
                    }
                }
            }

            // Queue ourselves for reaping and arrange to wake the parent.
            if pid != ProcessId::INIT {
                let target = if tbl.get(parent).is_some_and(|pp| !pp.is_zombie()) {
                    parent
                } else {
                    ProcessId::INIT
                };
                if let Some(pp) = tbl.get_mut(target) {
                    pp.exited.push_back(pid);
                    queues_to_wake.push(pp.wait_any.clone());
                    queues_to_wake.push(pp.wait_specific.clone());
                }
            }
            (fids, threads, exit_value)
        };

        fids.close_all();
        for q in queues_to_wake {
            sync::kernel_broadcast(&q);
        }
        // The control blocks of a finished process are never joined; let
        // the scheduler reclaim them as they come off their cores.
        for tid in threads {
            if let Some(t) = scheduler::lookup_thread(tid) {
                ThreadManager::drop_join_ref(&t);
            }
        }

        log::info!("process {} turned zombie (exit value {})", pid, exit_value);
        if pid == ProcessId::INIT {
            scheduler::record_init_exit(exit_value);
        }
        Self::maybe_shutdown();
    }

    /// Shut the machine down once init is gone and no thread remains.
    fn maybe_shutdown() {
        let done = {
            let tbl = PROCESS_TABLE.lock();
            let init_gone = tbl.get(ProcessId::INIT).is_none_or(|p| p.is_zombie());
            init_gone && tbl.total_live_threads() == 0
        };
        if done {
            log::info!("init is gone and no thread remains, shutting down");
            machine::request_shutdown();
        }
    }

    /// Wait for a child to exit.
    ///
    /// With `target == None`, waits for any child and reaps the oldest
    /// zombie. With a specific pid, waits for exactly that child. Returns
    /// the reaped pid and its exit value.
    pub(crate) fn wait_child(
        caller: ProcessId,
        target: Option<ProcessId>,
    ) -> Result<(ProcessId, i32), Errno> {
        match target {
            None => loop {
                let queue = {
                    let mut tbl = PROCESS_TABLE.lock();
                    let me = tbl.get(caller).ok_or(Errno::Echild)?;
                    if me.children.is_empty() && me.exited.is_empty() {
                        return Err(Errno::Echild);
                    }
                    if let Some(z) = me.exited.front().copied() {
                        return Ok(Self::reap(&mut tbl, caller, z));
                    }
                    me.wait_any.clone()
                };
                sync::kernel_timedwait(&queue, None);
            },
            Some(pid) => loop {
                let queue = {
                    let mut tbl = PROCESS_TABLE.lock();
                    let me = tbl.get(caller).ok_or(Errno::Echild)?;
                    if !me.children.contains(&pid) {
                        return Err(Errno::Echild);
                    }
                    if tbl.get(pid).is_some_and(|c| c.is_zombie()) {
                        return Ok(Self::reap(&mut tbl, caller, pid));
                    }
                    tbl.get(caller).unwrap().wait_specific.clone()
                };
                sync::kernel_timedwait(&queue, None);
            },
        }
    }

    /// Free a zombie child's slot and deliver its exit value.
    fn reap(tbl: &mut ProcTable, parent: ProcessId, child: ProcessId) -> (ProcessId, i32) {
        if let Some(pp) = tbl.get_mut(parent) {
            pp.children.retain(|c| *c != child);
            pp.exited.retain(|c| *c != child);
        }
        let p = tbl.remove(child).expect("reap of a missing child");
        debug_assert!(p.is_zombie());
        log::info!("reaped {} (exit value {})", child, p.exit_value);
        (child, p.exit_value)
    }

    /// Post the kill bit on `target`. The victim's threads observe it at
    /// their next safe point and exit with value -1; blocked threads are
    /// cancelled out of their waits.
    pub(crate) fn kill(target: ProcessId) -> Result<(), Errno> {
        if target == ProcessId::INIT {
            return Err(Errno::Eperm);
        }
        let threads = {
            let tbl = PROCESS_TABLE.lock();
            let p = tbl.get(target).ok_or(Errno::Einval)?;
            if p.is_zombie() {
                return Err(Errno::Einval);
            }
            p.kill_flag.store(true, Ordering::Release);
            p.threads.clone()
        };
        for tid in threads {
            if let Some(t) = scheduler::lookup_thread(tid) {
                t.post_cancel();
                scheduler::wakeup(&t);
            }
        }
        // Prod the other cores so a running victim reaches a safe point
        // promptly.
        let me = machine::current_core();
        for c in 0..machine::core_count() {
            if c != me.as_usize() {
                machine::raise_ici(super::types::CoreId(c));
            }
        }
        Ok(())
    }

    /// Parent pid of `pid`.
    pub(crate) fn parent_of(pid: ProcessId) -> ProcessId {
        PROCESS_TABLE
            .lock()
            .get(pid)
            .map_or(ProcessId::NOPROC, |p| p.parent)
    }

    /// Run `f` over the file table of `pid`.
    pub fn with_fids<R>(pid: ProcessId, f: impl FnOnce(&mut FidTable) -> R) -> Option<R> {
        let mut tbl = PROCESS_TABLE.lock();
        tbl.get_mut(pid).map(|p| f(&mut p.fids))
    }

    /// Snapshot of every process, for diagnostics.
    pub fn stats() -> Vec<ProcStat> {
        let tbl = PROCESS_TABLE.lock();
        tbl.slots
            .iter()
            .flatten()
            .map(|p| ProcStat {
                pid: p.pid,
                parent: p.parent,
                state: p.state,
                live_threads: p.live_threads,
                exit_value: p.exit_value,
                args_len: p.args.len(),
            })
            .collect()
    }
}
