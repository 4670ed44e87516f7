//! Kernel tasks: the unit of scheduling.
//!
//! State machine:
//! `None` -> `Ready` via create + resume; `Ready` <-> `Running` on dispatch;
//! `Running` -> `Sleeping`/`Mutex`/`Suspended` in a blocking primitive and
//! back to `Ready` on wake, unlock, timeout or resume; anything ->
//! `Destroyed` on exit (terminal).

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use int_enum::IntEnum;

use crate::arch::threading::{Context, TrapFrame};
use crate::config::{KSTACK_ORDER, TASK_MAX_PRIORITIES};
use crate::memory::object_pool::ObjectPool;
use crate::memory::page::{self, AllocFlags, PageRef, PageTag};
use crate::memory::{AllocError, PAGE_SIZE, VirtAddr};
use crate::process::Process;
use crate::sync::spinlock::RawSpinLock;
use crate::sync::timer::KTimer;
use crate::sync::mutex::KMutex;
use crate::utils::list::{Link, List, Node};

pub type TaskId = u32;

/// Bytes kept free at the stack top for the initial user trap frame.
pub const TRAP_FRAME_RESERVE: usize = (size_of::<TrapFrame>() + 15) & !15;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
pub enum TaskState {
    None = 0,
    Ready = 1,
    Running = 2,
    Sleeping = 3,
    /// Blocked on a mutex's wait list.
    Mutex = 4,
    Suspended = 5,
    Destroyed = 6,
}

/// `flags` bits.
pub const FLAG_RESCHEDULE: u8 = 1 << 0;
pub const FLAG_DESTROY: u8 = 1 << 1;

/// Sentinel for "no saved priority".
const PRIORITY_NONE: u8 = u8::MAX;

pub struct Task {
    link: Link<Task>,
    id: TaskId,
    state: AtomicU8,
    priority: AtomicU8,
    /// Pre-inheritance priority while boosted, [`PRIORITY_NONE`] otherwise.
    saved_priority: AtomicU8,
    flags: AtomicU8,
    /// The CPU whose run queues this task uses.
    home_cpu: AtomicUsize,
    /// Set while the task's context is live on some CPU; a dispatcher must
    /// not switch into the task until the previous CPU has fully saved it.
    on_cpu: AtomicBool,

    pub(crate) context: UnsafeCell<Context>,
    kstack: PageRef,
    entry: fn(usize),
    arg: usize,

    /// One timer, reused for every timed block.
    pub(crate) sleep_timer: UnsafeCell<KTimer>,
    sleep_result: AtomicI32,
    interruptible: AtomicBool,
    /// Where the task is sleeping: the wait list and the lock guarding it.
    /// Both null unless state is `Sleeping`/`Mutex`.
    wchan_lock: AtomicPtr<RawSpinLock>,
    wchan_list: AtomicPtr<List<Task>>,

    /// The current user-mode trap frame, while handling a trap from user.
    pub tf: AtomicPtr<TrapFrame>,
    /// Owning process; None for bare kernel service tasks.
    pub process: Option<NonNull<Process>>,
    /// Mutexes this task holds; touched only by the task itself.
    pub(crate) owned_mutexes: UnsafeCell<List<KMutex>>,
}

unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Node for Task {
    fn link(&mut self) -> &mut Link<Task> {
        &mut self.link
    }
    fn link_ref(&self) -> &Link<Task> {
        &self.link
    }
}

impl Task {
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::try_from(self.state.load(Ordering::Acquire)).unwrap()
    }

    #[inline]
    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_priority_raw(&self, priority: u8) {
        debug_assert!((priority as usize) < TASK_MAX_PRIORITIES);
        self.priority.store(priority, Ordering::Release);
    }

    #[inline]
    pub fn saved_priority(&self) -> Option<u8> {
        match self.saved_priority.load(Ordering::Acquire) {
            PRIORITY_NONE => None,
            p => Some(p),
        }
    }

    #[inline]
    pub(crate) fn set_saved_priority(&self, priority: Option<u8>) {
        self.saved_priority
            .store(priority.unwrap_or(PRIORITY_NONE), Ordering::Release);
    }

    #[inline]
    pub fn home_cpu(&self) -> usize {
        self.home_cpu.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_home_cpu(&self, cpu: usize) {
        self.home_cpu.store(cpu, Ordering::Release);
    }

    #[inline]
    pub(crate) fn set_on_cpu(&self, value: bool) {
        self.on_cpu.store(value, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_on_cpu(&self) -> bool {
        self.on_cpu.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_flags(&self, bits: u8) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_flags(&self, bits: u8) -> u8 {
        self.flags.fetch_and(!bits, Ordering::AcqRel) & bits
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.flags.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_sleep_result(&self, result: i32) {
        self.sleep_result.store(result, Ordering::Release);
    }

    #[inline]
    pub(crate) fn sleep_result(&self) -> i32 {
        self.sleep_result.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_interruptible(&self, value: bool) {
        self.interruptible.store(value, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_interruptible(&self) -> bool {
        self.interruptible.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_wchan(&self, lock: *const RawSpinLock, list: *mut List<Task>) {
        self.wchan_lock.store(lock.cast_mut(), Ordering::Release);
        self.wchan_list.store(list, Ordering::Release);
    }

    #[inline]
    pub(crate) fn wchan(&self) -> (*mut RawSpinLock, *mut List<Task>) {
        (
            self.wchan_lock.load(Ordering::Acquire),
            self.wchan_list.load(Ordering::Acquire),
        )
    }

    #[inline]
    pub fn kstack_top(&self) -> VirtAddr {
        page::kva(self.kstack).add(PAGE_SIZE << KSTACK_ORDER)
    }

    /// Where the user-mode trap frame for this task lives: the top slot of
    /// the kernel stack, so trap entry and [`trap_return`] agree on it.
    ///
    /// [`trap_return`]: crate::arch::threading::trap_return
    #[inline]
    pub fn trap_frame_slot(&self) -> VirtAddr {
        self.kstack_top() - TRAP_FRAME_RESERVE
    }

    pub(crate) fn run_entry(&self) {
        (self.entry)(self.arg)
    }
}

static TASK_POOL: spin::Once<&'static ObjectPool> = spin::Once::new();
static NEXT_ID: AtomicU32 = AtomicU32::new(1);

pub(crate) fn pool_init() {
    TASK_POOL.call_once(|| {
        ObjectPool::create("task_pool", size_of::<Task>(), align_of::<Task>(), None, None)
            .expect("cannot allocate task pool")
    });
}

/// Allocate a task in state `None`; it starts running after
/// [`crate::sched::resume`].
pub fn create(
    process: Option<NonNull<Process>>,
    entry: fn(usize),
    arg: usize,
    priority: u8,
) -> Result<NonNull<Task>, AllocError> {
    assert!((priority as usize) < TASK_MAX_PRIORITIES);

    let pool = TASK_POOL.get().expect("task pool not initialized");
    let slot = pool.get().ok_or(AllocError)?.cast::<Task>();

    let kstack =
        page::alloc_block(KSTACK_ORDER, AllocFlags::ZERO, PageTag::Kstack).ok_or(AllocError)?;
    // Kernel execution starts below the reserved trap-frame slot
    let stack_start =
        page::kva(kstack).add((PAGE_SIZE << KSTACK_ORDER) - TRAP_FRAME_RESERVE);

    unsafe {
        slot.write(Task {
            link: Link::new(),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(TaskState::None as u8),
            priority: AtomicU8::new(priority),
            saved_priority: AtomicU8::new(PRIORITY_NONE),
            flags: AtomicU8::new(0),
            home_cpu: AtomicUsize::new(0),
            on_cpu: AtomicBool::new(false),
            context: UnsafeCell::new(Context::new(crate::sched::task_trampoline, stack_start)),
            kstack,
            entry,
            arg,
            sleep_timer: UnsafeCell::new(KTimer::new()),
            sleep_result: AtomicI32::new(0),
            interruptible: AtomicBool::new(false),
            wchan_lock: AtomicPtr::new(core::ptr::null_mut()),
            wchan_list: AtomicPtr::new(core::ptr::null_mut()),
            tf: AtomicPtr::new(core::ptr::null_mut()),
            process,
            owned_mutexes: UnsafeCell::new(List::new()),
        });
    }
    Ok(slot)
}

/// Release a destroyed task's stack and descriptor. Called by the scheduler
/// once the task's context can no longer be live on any CPU.
pub(crate) unsafe fn free(task: NonNull<Task>) {
    unsafe {
        debug_assert!(task.as_ref().state() == TaskState::Destroyed);
        page::free_block(task.as_ref().kstack, KSTACK_ORDER);
    }
    TASK_POOL
        .get()
        .expect("task pool not initialized")
        .put(task.cast());
}
