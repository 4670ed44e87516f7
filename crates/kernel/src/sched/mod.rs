//! The preemptive priority scheduler.
//!
//! One run queue per priority level per CPU. Each CPU runs its own
//! scheduler loop on a private context; tasks enter it through
//! [`switch_to_scheduler`] with the CPU's scheduler lock held, exactly the
//! way they will leave it. Cross-CPU wakeups serialize on the migration
//! lock and kick the target out of `wfi` with an IPI.
//!
//! A timer tick never switches directly: it sets `FLAG_RESCHEDULE` on the
//! running task and the switch happens at the next safe point (outermost
//! IRQ exit or an explicit yield).

pub mod cpu;
#[cfg(test)]
mod tests;

use core::ptr::NonNull;

use opal_abi::errno::{EINTR, EINVAL, ETIMEDOUT};

use crate::arch;
use crate::config::TASK_MAX_PRIORITIES;
use crate::sync::spinlock::RawSpinLock;
use crate::sync::timer;
use crate::task::{self, FLAG_RESCHEDULE, Task, TaskState};
use crate::utils::list::{List, Node};

/// Serializes wakeup-across-CPU sequences (lock order: primitive lock ->
/// migration -> per-CPU scheduler lock).
static MIGRATION: RawSpinLock = RawSpinLock::new("migration");

pub fn init() {
    task::pool_init();
}

/// The task running on this CPU.
pub fn current() -> NonNull<Task> {
    try_current().expect("no current task")
}

pub fn try_current() -> Option<NonNull<Task>> {
    arch::without_interrupts(|| unsafe { cpu::current() }.task)
}

/// Make `task` runnable on its home CPU, waking that CPU if it is another
/// one. The caller must have put the task in a state where its context is
/// (or is about to be) fully saved.
pub fn enqueue(task_ptr: NonNull<Task>) {
    let task = unsafe { task_ptr.as_ref() };
    let target = task.home_cpu();

    MIGRATION.acquire();
    let lock = cpu::sched_lock(target);
    lock.acquire();

    let c = unsafe { cpu::by_index(target) };
    task.set_state(TaskState::Ready);
    unsafe { c.run_queues[task.priority() as usize].push_back(task_ptr) };

    // A higher-priority arrival preempts whatever the target runs now
    if let Some(curr) = c.task {
        let curr = unsafe { curr.as_ref() };
        if task.priority() < curr.priority() {
            curr.set_flags(FLAG_RESCHEDULE);
        }
    }

    lock.release();
    MIGRATION.release();

    if target != arch::cpu_id() {
        arch::irqchip::send_ipi(target);
    }
}

/// Start a freshly created or suspended task.
pub fn resume(task_ptr: NonNull<Task>) -> Result<(), i32> {
    let state = unsafe { task_ptr.as_ref() }.state();
    if !matches!(state, TaskState::None | TaskState::Suspended) {
        return Err(-EINVAL);
    }
    enqueue(task_ptr);
    Ok(())
}

/// Voluntarily give up the CPU, staying runnable.
pub fn yield_now() {
    let me_ptr = current();
    let lock = cpu::sched_lock(unsafe { me_ptr.as_ref() }.home_cpu());
    lock.acquire();

    let me = unsafe { me_ptr.as_ref() };
    let c = unsafe { cpu::current() };
    me.set_state(TaskState::Ready);
    unsafe { c.run_queues[me.priority() as usize].push_back(me_ptr) };

    unsafe { switch_to_scheduler() };
    lock.release();
}

/// Park the current task until [`resume`].
pub fn suspend() {
    let me_ptr = current();
    let lock = cpu::sched_lock(unsafe { me_ptr.as_ref() }.home_cpu());
    lock.acquire();
    unsafe { me_ptr.as_ref() }.set_state(TaskState::Suspended);
    unsafe { switch_to_scheduler() };
    lock.release();
}

/// Terminate the current task; the scheduler reclaims it once its context
/// is off-CPU. Process-level teardown is the caller's business.
pub fn exit() -> ! {
    let me_ptr = current();
    let lock = cpu::sched_lock(unsafe { me_ptr.as_ref() }.home_cpu());
    lock.acquire();
    unsafe { me_ptr.as_ref() }.set_state(TaskState::Destroyed);
    unsafe { switch_to_scheduler() };
    unreachable!("destroyed task was rescheduled");
}

/// Block the current task on `list`, which `lock` guards; the caller holds
/// `lock` and gets it back on return.
///
/// `timeout` is in ticks, `0` meaning forever. Returns `0` on a normal
/// wake, `-ETIMEDOUT` on expiry, `-EINTR` when interrupted (only if
/// `interruptible`).
///
/// # Safety
/// `list` must be the list `lock` guards, and both must outlive the sleep.
pub unsafe fn sleep(
    list: *mut List<Task>,
    lock: &RawSpinLock,
    timeout: u64,
    interruptible: bool,
    state: TaskState,
) -> i32 {
    debug_assert!(matches!(state, TaskState::Sleeping | TaskState::Mutex));
    debug_assert!(lock.holding());

    let me_ptr = current();
    let me = unsafe { me_ptr.as_ref() };

    me.set_sleep_result(0);
    me.set_interruptible(interruptible);
    me.set_wchan(lock, list);
    me.set_state(state);
    unsafe { (*list).push_back(me_ptr) };

    if timeout != 0 {
        unsafe {
            timer::arm_oneshot(
                NonNull::new_unchecked(me.sleep_timer.get()),
                sleep_timeout,
                me_ptr.as_ptr() as usize,
                timeout,
            );
        }
    }

    // From here a waker (or the timeout) may run; the dispatcher will not
    // touch our context until it is saved below.
    lock.release();

    let sched = cpu::sched_lock(me.home_cpu());
    sched.acquire();
    unsafe { switch_to_scheduler() };
    sched.release();

    if timeout != 0 {
        unsafe { timer::stop(NonNull::new_unchecked(me.sleep_timer.get())) };
    }

    lock.acquire();
    me.sleep_result()
}

/// Timer callback for timed sleeps.
fn sleep_timeout(arg: usize) {
    let task = NonNull::new(arg as *mut Task).unwrap();
    cancel_sleep(task, -ETIMEDOUT, false);
}

/// Pull `task` off whatever wait list holds it and make it runnable with
/// `result`. With `only_interruptible`, uninterruptible sleeps are left
/// alone. Returns whether the task was woken.
pub fn cancel_sleep(task_ptr: NonNull<Task>, result: i32, only_interruptible: bool) -> bool {
    let task = unsafe { task_ptr.as_ref() };

    loop {
        let (lock_ptr, list_ptr) = task.wchan();
        if lock_ptr.is_null() {
            return false;
        }
        let lock = unsafe { &*lock_ptr };
        lock.acquire();

        // The task may have been woken (and even have slept again on a
        // different channel) while we were acquiring.
        if task.wchan().0 != lock_ptr {
            lock.release();
            continue;
        }

        if only_interruptible && !task.is_interruptible() {
            lock.release();
            return false;
        }

        unsafe { (*list_ptr).remove(task_ptr) };
        task.set_wchan(core::ptr::null(), core::ptr::null_mut());
        task.set_sleep_result(result);
        lock.release();

        enqueue(task_ptr);
        return true;
    }
}

/// Wake `task` out of a wait list whose lock the caller holds.
///
/// # Safety
/// The caller must hold the lock guarding the list `task` is queued on.
pub unsafe fn wake_task(task_ptr: NonNull<Task>, list: *mut List<Task>, result: i32) {
    let task = unsafe { task_ptr.as_ref() };
    unsafe { (*list).remove(task_ptr) };
    task.set_wchan(core::ptr::null(), core::ptr::null_mut());
    task.set_sleep_result(result);
    enqueue(task_ptr);
}

/// Wake the first waiter; returns false if the list was empty.
///
/// # Safety
/// As [`wake_task`].
pub unsafe fn wakeup_one(list: *mut List<Task>, result: i32) -> bool {
    match unsafe { (*list).front() } {
        Some(task) => {
            unsafe { wake_task(task, list, result) };
            true
        }
        None => false,
    }
}

/// # Safety
/// As [`wake_task`].
pub unsafe fn wakeup_all(list: *mut List<Task>, result: i32) {
    while unsafe { wakeup_one(list, result) } {}
}

/// Interrupt a blocked task (typically on signal delivery): wakes it with
/// `-EINTR` if it is in an interruptible sleep.
pub fn interrupt(task: NonNull<Task>) -> bool {
    cancel_sleep(task, -EINTR, true)
}

/// Change a task's priority, requeueing it if it is on a run queue.
/// Idempotent; used by mutex priority inheritance.
pub fn set_priority(task_ptr: NonNull<Task>, priority: u8) {
    assert!((priority as usize) < TASK_MAX_PRIORITIES);
    let task = unsafe { task_ptr.as_ref() };

    MIGRATION.acquire();
    let lock = cpu::sched_lock(task.home_cpu());
    lock.acquire();

    let old = task.priority();
    if old != priority {
        let queued = task.state() == TaskState::Ready && task.link_ref().is_linked();
        if queued {
            let c = unsafe { cpu::by_index(task.home_cpu()) };
            unsafe {
                c.run_queues[old as usize].remove(task_ptr);
                task.set_priority_raw(priority);
                c.run_queues[priority as usize].push_back(task_ptr);
            }
        } else {
            task.set_priority_raw(priority);
        }
    }

    lock.release();
    MIGRATION.release();
}

/// Timed sleep with no wait channel; wakes on expiry or interruption.
/// Returns 0 after a full sleep, `-EINTR` if a signal cut it short.
pub fn sleep_current(timeout: u64) -> i32 {
    static SLEEPERS_LOCK: RawSpinLock = RawSpinLock::new("sleepers");
    static SLEEPERS: SleeperList = SleeperList(core::cell::UnsafeCell::new(List::new()));

    struct SleeperList(core::cell::UnsafeCell<List<Task>>);
    unsafe impl Sync for SleeperList {}

    if timeout == 0 {
        return 0;
    }

    SLEEPERS_LOCK.acquire();
    let r = unsafe {
        sleep(
            SLEEPERS.0.get(),
            &SLEEPERS_LOCK,
            timeout,
            true,
            TaskState::Sleeping,
        )
    };
    SLEEPERS_LOCK.release();

    if r == -ETIMEDOUT { 0 } else { r }
}

/// Scheduler clock tick, from the timer interrupt. Flags the running task
/// for preemption; the boot CPU additionally drives the timer queue.
pub fn tick() {
    let c = unsafe { cpu::current() };
    if let Some(curr) = c.task {
        unsafe { curr.as_ref() }.set_flags(FLAG_RESCHEDULE);
    }

    if arch::cpu_id() == 0 {
        timer::tick();
    }
}

/// Preemption point: called on the way out of a trap once interrupt
/// nesting has unwound.
pub fn preempt() {
    let Some(curr_ptr) = try_current() else {
        return;
    };
    let curr = unsafe { curr_ptr.as_ref() };
    if curr.state() != TaskState::Running {
        return;
    }
    if curr.clear_flags(FLAG_RESCHEDULE) != 0 {
        yield_now();
    }
}

/// First code every task runs: invoked by the dispatcher's context switch
/// with this CPU's scheduler lock held.
pub extern "C" fn task_trampoline() -> ! {
    let me_ptr = {
        let c = unsafe { cpu::current() };
        // leave the lock exactly as a returning switch_to_scheduler would
        c.irq_save_count = 1;
        c.irq_flags = true;
        c.task.expect("trampoline without a task")
    };
    cpu::sched_lock(unsafe { me_ptr.as_ref() }.home_cpu()).release();

    unsafe { me_ptr.as_ref() }.run_entry();
    exit();
}

/// Switch from the current task to this CPU's scheduler loop. The caller
/// holds the CPU's scheduler lock; the per-CPU IRQ bookkeeping is saved
/// around the switch because the next task has its own.
///
/// # Safety
/// Must run on the task's home CPU with its scheduler lock held.
unsafe fn switch_to_scheduler() {
    let (me, save_count, save_flags) = {
        let c = unsafe { cpu::current() };
        (
            c.task.expect("switching without a task"),
            c.irq_save_count,
            c.irq_flags,
        )
    };

    unsafe {
        let c = cpu::current();
        arch::threading::context_switch(me.as_ref().context.get(), &raw const c.scheduler_ctx);
    }

    let c = unsafe { cpu::current() };
    c.irq_save_count = save_count;
    c.irq_flags = save_flags;
}

fn pick_next(c: &mut cpu::Cpu) -> Option<NonNull<Task>> {
    for queue in c.run_queues.iter_mut() {
        if let Some(task) = queue.pop_front() {
            return Some(task);
        }
    }
    None
}

/// The per-CPU scheduler loop; never returns. Interrupts must be disabled
/// on entry.
pub unsafe fn start() -> ! {
    let my = arch::cpu_id();
    let lock = cpu::sched_lock(my);
    lock.acquire();

    loop {
        let next = pick_next(unsafe { cpu::by_index(my) });

        match next {
            Some(next_ptr) => {
                let next = unsafe { next_ptr.as_ref() };

                // Wait for the previous CPU to finish saving its context
                while next.is_on_cpu() {
                    core::hint::spin_loop();
                }

                next.set_state(TaskState::Running);
                next.set_on_cpu(true);

                let (save_count, save_flags) = {
                    let c = unsafe { cpu::current() };
                    c.task = Some(next_ptr);
                    (c.irq_save_count, c.irq_flags)
                };

                arch::threading::on_dispatch(next.kstack_top());
                if let Some(proc) = next.process {
                    crate::process::activate_address_space(proc);
                }

                unsafe {
                    let c = cpu::current();
                    arch::threading::context_switch(
                        &raw mut c.scheduler_ctx,
                        next.context.get(),
                    );
                }

                // Back from the task; its context is saved
                let prev = {
                    let c = unsafe { cpu::current() };
                    c.irq_save_count = save_count;
                    c.irq_flags = save_flags;
                    c.task.take().expect("scheduler resumed without a task")
                };

                unsafe { arch::paging::load_kernel() };
                unsafe { prev.as_ref() }.set_on_cpu(false);

                if unsafe { prev.as_ref() }.state() == TaskState::Destroyed {
                    unsafe { task::free(prev) };
                }
            }
            None => {
                // Idle: run on the kernel map and wait for work
                unsafe { arch::paging::load_kernel() };
                lock.release();
                unsafe { arch::irq_enable() };
                arch::wait_for_interrupt();
                unsafe { arch::irq_disable() };
                lock.acquire();
            }
        }
    }
}
