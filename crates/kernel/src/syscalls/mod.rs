//! Syscall dispatch.
//!
//! Numbers and argument conventions live in `opal-abi`; arguments arrive in
//! the trap frame's registers and every user pointer is validated against
//! the caller's address space before the kernel touches it. Negative
//! return values are `-errno`.

mod file;
mod proc;

use opal_abi::errno::{EFAULT, ENOSYS};
use opal_abi::syscalls::Syscall;

use crate::arch::threading::TrapFrame;
use crate::memory::VirtAddr;
use crate::memory::vmspace::VmSpace;
use crate::process;
use crate::sched;
use crate::sync::timer;

/// The final non-arch layer between a trap and the syscall bodies.
pub fn dispatch(number: u16, tf: &mut TrapFrame) -> isize {
    let [a, b, c, d, e, _f] = tf.syscall_args();

    let Ok(syscall) = Syscall::try_from(number) else {
        return -(ENOSYS as isize);
    };

    match syscall {
        Syscall::Fork => result(process::fork().map(|pid| pid as usize)),
        Syscall::Exec => proc::sys_exec(a, b, c),
        Syscall::Waitpid => proc::sys_waitpid(a as i32, b, c),
        Syscall::Exit => process::exit(a as u32),
        Syscall::GetPid => process::current_pid() as isize,
        Syscall::GetPpid => unsafe { process::current().as_ref() }.ppid() as isize,
        Syscall::Sbrk => result(process::sbrk(a as isize).map(|va| va.into_raw())),
        Syscall::MMap => proc::sys_mmap(a, b, c),
        Syscall::MUnmap => -(ENOSYS as isize),
        Syscall::Nanosleep => proc::sys_nanosleep(a as u64),
        Syscall::Uptime => timer::uptime_ms() as isize,
        Syscall::Kill => result(process::signal::send(a as i32, b as u32, 0, 0).map(|_| 0)),
        Syscall::SigAction => proc::sys_sigaction(a, b, c),
        Syscall::SigProcMask => proc::sys_sigprocmask(a, b, c),
        Syscall::SigReturn => process::signal::sigreturn(tf),
        Syscall::GetPgid => result(process::getpgid(a as u32).map(|pgid| pgid as usize)),
        Syscall::SetPgid => result(process::setpgid(a as u32, b as u32).map(|_| 0)),
        Syscall::Pipe => file::sys_pipe(a),
        Syscall::Open => file::sys_open(a, b),
        Syscall::Close => file::sys_close(a),
        Syscall::Read => file::sys_read(a, b, c),
        Syscall::Write => file::sys_write(a, b, c),
        Syscall::Seek => file::sys_seek(a, b as isize, c),
        Syscall::Fstat => file::sys_fstat(a, b),
        Syscall::Stat => file::sys_stat(a, b),
        Syscall::Chdir => file::sys_chdir(a),
        Syscall::Dup => file::sys_dup(a),
        Syscall::Dup2 => file::sys_dup2(a, b),
        Syscall::Fcntl => file::sys_fcntl(a, b, c),
        Syscall::Ioctl => file::sys_ioctl(a, b, c),
        Syscall::Yield => {
            sched::yield_now();
            0
        }
    }
}

fn result(r: Result<usize, i32>) -> isize {
    match r {
        Ok(v) => v as isize,
        Err(e) => e as isize,
    }
}

/// The caller's address space; syscalls that dereference user pointers
/// need one.
fn current_space() -> Result<&'static VmSpace, i32> {
    let vm = process::try_current_space().ok_or(-EFAULT)?;
    // Valid for the duration of the syscall: exec (the only swap) happens
    // on this same thread.
    Ok(unsafe { &*vm.as_ptr() })
}

/// Copy a NUL-terminated user string after validating it.
fn user_str(va: usize, limit: usize) -> Result<alloc::string::String, i32> {
    let vm = current_space()?;
    let len = vm.check_str(VirtAddr::new(va), limit)?;

    let mut bytes = alloc::vec![0u8; len];
    vm.copy_in(VirtAddr::new(va), &mut bytes)?;
    alloc::string::String::from_utf8(bytes).map_err(|_| -EFAULT)
}

/// Copy an object out to a user pointer after validating it.
fn copy_to_user<T: Copy>(va: usize, value: &T) -> Result<(), i32> {
    let vm = current_space()?;
    vm.check_buf(VirtAddr::new(va), size_of::<T>(), true)?;
    let bytes = unsafe {
        core::slice::from_raw_parts((value as *const T).cast::<u8>(), size_of::<T>())
    };
    vm.copy_out(VirtAddr::new(va), bytes)
}

/// Copy an object in from a user pointer after validating it.
fn copy_from_user<T: Copy>(va: usize) -> Result<T, i32> {
    let vm = current_space()?;
    vm.check_buf(VirtAddr::new(va), size_of::<T>(), false)?;
    let mut value = core::mem::MaybeUninit::<T>::uninit();
    let bytes = unsafe {
        core::slice::from_raw_parts_mut(value.as_mut_ptr().cast::<u8>(), size_of::<T>())
    };
    vm.copy_in(VirtAddr::new(va), bytes)?;
    Ok(unsafe { value.assume_init() })
}
