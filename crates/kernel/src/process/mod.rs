//! Processes: address-space ownership, fork/exec/wait/exit and the glue
//! between tasks and signals.
//!
//! One global process lock guards the pid table, the parent/children
//! links, process states, wait queues and signal queues — the same lock a
//! parent sleeps on in `wait`, so reaping and exiting serialize naturally.

pub mod exec;
pub mod fd;
pub mod signal;

#[cfg(test)]
mod tests;

use alloc::boxed::Box;
use alloc::string::String;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use hashbrown::HashMap;
use int_enum::IntEnum;
use opal_abi::errno::{EAGAIN, ECHILD, EINVAL, ESRCH};
use opal_abi::signal::{NSIG, SIGCHLD, SigAction};
use opal_abi::wait::{self, WNOHANG};

use crate::arch;
use crate::memory::vmspace::VmSpace;
use crate::memory::{PhysAddr, VirtAddr};
use crate::sched;
use crate::sync::spinlock::{RawSpinLock, SpinLock, spin_lock};
use crate::task::{self, Task, TaskState};
use crate::utils::list::{Link, List, Node};

use fd::FdTable;
use signal::Signal;

pub type Pid = u32;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
pub enum ProcState {
    Active = 0,
    Stopped = 1,
    Zombie = 2,
}

pub struct Process {
    pid: Pid,
    pgid: AtomicU32,
    name: SpinLock<String>,
    state: AtomicU8,
    /// Encoded wait status, valid once the process is a zombie.
    exit_status: AtomicU32,

    parent: AtomicPtr<Process>,
    sibling_link: Link<Process>,
    /// Guarded by [`PROCESS_LOCK`].
    children: UnsafeCell<List<Process>>,
    /// Tasks sleeping in `wait` for this process's children; guarded by
    /// [`PROCESS_LOCK`], which doubles as the sleep lock.
    wait_queue: UnsafeCell<List<Task>>,

    /// Pending signals; guarded by [`PROCESS_LOCK`].
    pending: UnsafeCell<List<Signal>>,
    pub sig_mask: AtomicU32,
    /// Guarded by [`PROCESS_LOCK`].
    handlers: UnsafeCell<[SigAction; NSIG]>,
    /// User-mode sigreturn trampoline address.
    pub signal_stub: AtomicUsize,

    /// `None` for kernel-space processes.
    vm: SpinLock<Option<Box<VmSpace>>>,
    /// Cached page-table root for the dispatch path (0 = kernel only).
    vm_root: AtomicUsize,

    main_task: AtomicPtr<Task>,
    pub fds: SpinLock<FdTable>,
    pub cwd: SpinLock<String>,
    pub cmask: AtomicU32,
    pub ruid: AtomicU32,
    pub euid: AtomicU32,
    pub rgid: AtomicU32,
    pub egid: AtomicU32,
    /// Tick accounting: time spent in user / kernel mode.
    pub utime: AtomicU64,
    pub stime: AtomicU64,
}

unsafe impl Send for Process {}
unsafe impl Sync for Process {}

impl Node for Process {
    fn link(&mut self) -> &mut Link<Process> {
        &mut self.sibling_link
    }
    fn link_ref(&self) -> &Link<Process> {
        &self.sibling_link
    }
}

impl Process {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn pgid(&self) -> Pid {
        self.pgid.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ProcState {
        ProcState::try_from(self.state.load(Ordering::Acquire)).unwrap()
    }

    pub(crate) fn set_state(&self, state: ProcState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn ppid(&self) -> Pid {
        match NonNull::new(self.parent.load(Ordering::Acquire)) {
            Some(parent) => unsafe { parent.as_ref() }.pid(),
            None => 0,
        }
    }

    pub fn main_task(&self) -> Option<NonNull<Task>> {
        NonNull::new(self.main_task.load(Ordering::Acquire))
    }

    /// Swap in a new address space (exec) and cache its root for dispatch.
    pub fn install_vm(&self, vm: Box<VmSpace>) -> Option<Box<VmSpace>> {
        let root = vm.root_phys().into_raw();
        let old = self.vm.lock().replace(vm);
        self.vm_root.store(root, Ordering::Release);
        old
    }

    pub fn with_vm<T>(&self, f: impl FnOnce(&VmSpace) -> T) -> Result<T, i32> {
        let guard = self.vm.lock();
        guard.as_ref().map(|vm| f(vm)).ok_or(-EINVAL)
    }

    /// Stable pointer to the address space; valid while the process lives
    /// (exec swaps happen only from the process's own thread).
    pub fn vm_ptr(&self) -> Option<NonNull<VmSpace>> {
        self.vm.lock().as_deref().map(NonNull::from)
    }
}

/// The global process lock; see the module docs.
static PROCESS_LOCK: RawSpinLock = RawSpinLock::new("process");

struct Table(UnsafeCell<Option<HashMap<Pid, NonNull<Process>>>>);
unsafe impl Sync for Table {}
static TABLE: Table = Table(UnsafeCell::new(None));

static NEXT_PID: AtomicU32 = AtomicU32::new(1);
static INIT_PROC: AtomicPtr<Process> = AtomicPtr::new(core::ptr::null_mut());

/// The pid table; callers must hold [`PROCESS_LOCK`].
fn table() -> &'static mut HashMap<Pid, NonNull<Process>> {
    debug_assert!(PROCESS_LOCK.holding());
    unsafe { (*TABLE.0.get()).as_mut().expect("process table not ready") }
}

fn alloc_process(
    name: &str,
    parent: Option<NonNull<Process>>,
    vm: Option<Box<VmSpace>>,
) -> NonNull<Process> {
    let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
    let pgid = parent
        .map(|p| unsafe { p.as_ref() }.pgid())
        .unwrap_or(pid);
    let vm_root = vm
        .as_ref()
        .map(|vm| vm.root_phys().into_raw())
        .unwrap_or(0);

    let process = NonNull::from(Box::leak(Box::new(Process {
        pid,
        pgid: AtomicU32::new(pgid),
        name: spin_lock("proc_name", String::from(name)),
        state: AtomicU8::new(ProcState::Active as u8),
        exit_status: AtomicU32::new(0),
        parent: AtomicPtr::new(
            parent.map(|p| p.as_ptr()).unwrap_or(core::ptr::null_mut()),
        ),
        sibling_link: Link::new(),
        children: UnsafeCell::new(List::new()),
        wait_queue: UnsafeCell::new(List::new()),
        pending: UnsafeCell::new(List::new()),
        sig_mask: AtomicU32::new(0),
        handlers: UnsafeCell::new([SigAction::default(); NSIG]),
        signal_stub: AtomicUsize::new(0),
        vm: spin_lock("proc_vm", vm),
        vm_root: AtomicUsize::new(vm_root),
        main_task: AtomicPtr::new(core::ptr::null_mut()),
        fds: spin_lock("proc_fds", FdTable::new()),
        cwd: spin_lock("proc_cwd", String::from("/")),
        cmask: AtomicU32::new(0o022),
        ruid: AtomicU32::new(0),
        euid: AtomicU32::new(0),
        rgid: AtomicU32::new(0),
        egid: AtomicU32::new(0),
        utime: AtomicU64::new(0),
        stime: AtomicU64::new(0),
    })));

    PROCESS_LOCK.acquire();
    table().insert(pid, process);
    if let Some(parent) = parent {
        unsafe { (*parent.as_ref().children.get()).push_back(process) };
    }
    PROCESS_LOCK.release();

    process
}

/// Tear a reaped process down. Caller must already have unlinked it.
unsafe fn free_process(proc: NonNull<Process>) {
    drop(unsafe { Box::from_raw(proc.as_ptr()) });
}

pub fn init() {
    PROCESS_LOCK.acquire();
    unsafe { *TABLE.0.get() = Some(HashMap::new()) };
    PROCESS_LOCK.release();
}

/// Create and start a kernel-space process (no user address space).
pub fn spawn_kernel(
    name: &str,
    entry: fn(usize),
    arg: usize,
    priority: u8,
) -> Result<Pid, i32> {
    let parent = NonNull::new(INIT_PROC.load(Ordering::Acquire));
    let proc = alloc_process(name, parent, None);
    let pid = unsafe { proc.as_ref() }.pid();

    if parent.is_none() && pid == 1 {
        INIT_PROC.store(proc.as_ptr(), Ordering::Release);
    }

    let task = task::create(Some(proc), entry, arg, priority).map_err(|_| -EINVAL)?;
    unsafe { proc.as_ref() }
        .main_task
        .store(task.as_ptr(), Ordering::Release);
    sched::resume(task)?;
    Ok(pid)
}

/// The process the calling task belongs to.
pub fn try_current() -> Option<NonNull<Process>> {
    unsafe { sched::try_current()?.as_ref() }.process
}

pub fn current() -> NonNull<Process> {
    try_current().expect("no current process")
}

pub fn current_pid() -> Pid {
    unsafe { current().as_ref() }.pid()
}

/// The current process's address space, if it has one.
pub fn try_current_space() -> Option<NonNull<VmSpace>> {
    unsafe { try_current()?.as_ref() }.vm_ptr()
}

pub fn by_pid(pid: Pid) -> Option<NonNull<Process>> {
    PROCESS_LOCK.acquire();
    let proc = table().get(&pid).copied();
    PROCESS_LOCK.release();
    proc
}

/// Dispatch-path hook: install the process's user half, if any.
pub fn activate_address_space(proc: NonNull<Process>) {
    let root = unsafe { proc.as_ref() }.vm_root.load(Ordering::Acquire);
    if root != 0 {
        unsafe { arch::paging::load_root(PhysAddr::new(root)) };
    }
}

/// Resolve a user page fault against the current address space.
pub fn handle_page_fault(addr: VirtAddr) -> Result<(), ()> {
    let proc = try_current().ok_or(())?;
    let vm = unsafe { proc.as_ref() }.vm_ptr().ok_or(())?;
    unsafe { vm.as_ref() }.handle_fault(addr)
}

pub fn current_stopped() -> bool {
    try_current().is_some_and(|p| unsafe { p.as_ref() }.state() == ProcState::Stopped)
}

/// Tick accounting, called from the timer interrupt's top half.
pub fn times_tick() {
    let Some(proc) = try_current() else {
        return;
    };
    let proc = unsafe { proc.as_ref() };
    let from_user = unsafe { sched::cpu::current() }.irq_from_user;
    if from_user {
        proc.utime.fetch_add(1, Ordering::Relaxed);
    } else {
        proc.stime.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fork the current (user) process. The child resumes from the same trap
/// frame with a zero return value.
pub fn fork() -> Result<Pid, i32> {
    let parent_proc_ptr = current();
    let parent_proc = unsafe { parent_proc_ptr.as_ref() };
    let parent_task_ptr = sched::current();
    let parent_task = unsafe { parent_task_ptr.as_ref() };

    let parent_tf = parent_task.tf.load(Ordering::Acquire);
    if parent_tf.is_null() {
        // fork only makes sense on the way out of a user trap
        return Err(-EINVAL);
    }

    let child_vm = parent_proc.with_vm(|vm| vm.clone_space(false))??;
    let name = parent_proc.name.lock().clone();
    let child_ptr = alloc_process(&name, Some(parent_proc_ptr), Some(Box::new(child_vm)));
    let child = unsafe { child_ptr.as_ref() };

    // Inherit the descriptor table, dispositions, mask and identity
    *child.fds.lock() = parent_proc.fds.lock().clone_table();
    PROCESS_LOCK.acquire();
    unsafe { *child.handlers.get() = *parent_proc.handlers.get() };
    PROCESS_LOCK.release();
    child.sig_mask.store(
        parent_proc.sig_mask.load(Ordering::Acquire),
        Ordering::Release,
    );
    child
        .signal_stub
        .store(parent_proc.signal_stub.load(Ordering::Acquire), Ordering::Release);
    *child.cwd.lock() = parent_proc.cwd.lock().clone();
    child.cmask.store(parent_proc.cmask.load(Ordering::Relaxed), Ordering::Relaxed);
    child.ruid.store(parent_proc.ruid.load(Ordering::Relaxed), Ordering::Relaxed);
    child.euid.store(parent_proc.euid.load(Ordering::Relaxed), Ordering::Relaxed);
    child.rgid.store(parent_proc.rgid.load(Ordering::Relaxed), Ordering::Relaxed);
    child.egid.store(parent_proc.egid.load(Ordering::Relaxed), Ordering::Relaxed);

    let child_task =
        task::create(Some(child_ptr), fork_child_entry, 0, parent_task.priority())
            .map_err(|_| -EINVAL)?;
    child
        .main_task
        .store(child_task.as_ptr(), Ordering::Release);

    // Plant the parent's frame (with a zero result) in the child's slot
    unsafe {
        let slot = child_task.as_ref().trap_frame_slot().into_ptr::<arch::threading::TrapFrame>();
        slot.write(*parent_tf);
        (*slot).set_return(0);
    }

    sched::resume(child_task)?;
    Ok(child.pid())
}

/// First code a forked child runs: straight back to user mode through the
/// planted frame.
fn fork_child_entry(_arg: usize) {
    let me = sched::current();
    let slot = unsafe { me.as_ref() }.trap_frame_slot();
    unsafe {
        me.as_ref()
            .tf
            .store(slot.into_ptr(), Ordering::Release);
        arch::threading::trap_return(slot.into_ptr());
    }
}

/// Terminate the current process with an encoded wait status. Resources
/// that user space can see go now; the address space and the zombie record
/// wait for the parent's `wait`.
pub fn exit_status(status: u32) -> ! {
    let proc_ptr = current();
    let proc = unsafe { proc_ptr.as_ref() };

    // Descriptors first: this tells every server we are gone
    proc.fds.lock().clear();

    PROCESS_LOCK.acquire();
    proc.set_state(ProcState::Zombie);
    proc.exit_status.store(status, Ordering::Release);
    proc.main_task.store(core::ptr::null_mut(), Ordering::Release);

    // Orphans go to init
    let init = NonNull::new(INIT_PROC.load(Ordering::Acquire));
    if let Some(init_ptr) = init.filter(|i| *i != proc_ptr) {
        let init_ref = unsafe { init_ptr.as_ref() };
        unsafe {
            while let Some(child) = (*proc.children.get()).pop_front() {
                child.as_ref().parent.store(init_ptr.as_ptr(), Ordering::Release);
                (*init_ref.children.get()).push_back(child);
            }
            // A reparented zombie must not get lost
            sched::wakeup_all(init_ref.wait_queue.get(), 0);
        }
    }

    // Wake the parent's wait queue
    let parent = NonNull::new(proc.parent.load(Ordering::Acquire));
    if let Some(parent) = parent {
        unsafe { sched::wakeup_all(parent.as_ref().wait_queue.get(), 0) };
    }
    PROCESS_LOCK.release();

    if let Some(parent) = parent {
        signal::post(
            parent,
            opal_abi::signal::SigInfo {
                si_signo: SIGCHLD,
                si_code: 0,
                si_value: proc.pid() as usize,
            },
        );
    }

    crate::debug!(
        Process,
        "process {} exited with status {status:#x}",
        proc.pid()
    );
    sched::exit();
}

/// POSIX-style exit with a code.
pub fn exit(code: u32) -> ! {
    exit_status(wait::exit_status(code))
}

fn matches_selector(me: &Process, child: &Process, selector: i32) -> bool {
    match selector {
        -1 => true,
        0 => child.pgid() == me.pgid(),
        pid if pid > 0 => child.pid() == pid as Pid,
        pgid => child.pgid() == (-pgid) as Pid,
    }
}

/// Wait for a child matching `selector` (-1 = any, >0 = that pid, 0 = own
/// process group, <-1 = that process group).
pub fn wait(selector: i32, options: usize) -> Result<(Pid, u32), i32> {
    let me_ptr = current();
    let me = unsafe { me_ptr.as_ref() };

    PROCESS_LOCK.acquire();
    loop {
        let mut found = false;
        let mut zombie = None;

        unsafe {
            for child_ptr in (*me.children.get()).iter() {
                let child = child_ptr.as_ref();
                if !matches_selector(me, child, selector) {
                    continue;
                }
                found = true;
                if child.state() == ProcState::Zombie {
                    zombie = Some(child_ptr);
                    break;
                }
            }
        }

        if let Some(child_ptr) = zombie {
            let child = unsafe { child_ptr.as_ref() };
            let pid = child.pid();
            let status = child.exit_status.load(Ordering::Acquire);

            unsafe {
                (*me.children.get()).remove(child_ptr);
            }
            table().remove(&pid);
            PROCESS_LOCK.release();

            // Deferred teardown: the zombie's address space dies here
            unsafe { free_process(child_ptr) };
            return Ok((pid, status));
        }

        if !found {
            PROCESS_LOCK.release();
            return Err(-ECHILD);
        }

        if options & WNOHANG != 0 {
            PROCESS_LOCK.release();
            return Err(-EAGAIN);
        }

        let r = unsafe {
            sched::sleep(me.wait_queue.get(), &PROCESS_LOCK, 0, true, TaskState::Sleeping)
        };
        if r < 0 {
            PROCESS_LOCK.release();
            return Err(r);
        }
    }
}

pub fn getpgid(pid: Pid) -> Result<Pid, i32> {
    let proc = if pid == 0 {
        current()
    } else {
        by_pid(pid).ok_or(-ESRCH)?
    };
    Ok(unsafe { proc.as_ref() }.pgid())
}

pub fn setpgid(pid: Pid, pgid: Pid) -> Result<(), i32> {
    let proc = if pid == 0 {
        current()
    } else {
        by_pid(pid).ok_or(-ESRCH)?
    };
    let proc = unsafe { proc.as_ref() };
    let pgid = if pgid == 0 { proc.pid() } else { pgid };
    proc.pgid.store(pgid, Ordering::Release);
    Ok(())
}

/// Move the data break; returns the previous break.
pub fn sbrk(delta: isize) -> Result<VirtAddr, i32> {
    let proc = current();
    unsafe { proc.as_ref() }.with_vm(|vm| vm.grow(delta))?
}

/// Processes in `pgid`, snapshotted for signal fan-out.
pub(crate) fn processes_in_group(pgid: Pid) -> heapless::Vec<NonNull<Process>, 16> {
    let mut out = heapless::Vec::new();
    PROCESS_LOCK.acquire();
    for proc in table().values() {
        if unsafe { proc.as_ref() }.pgid() == pgid {
            let _ = out.push(*proc);
        }
    }
    PROCESS_LOCK.release();
    out
}

pub(crate) fn process_lock() -> &'static RawSpinLock {
    &PROCESS_LOCK
}
