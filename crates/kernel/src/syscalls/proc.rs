//! Process-side syscall bodies.

use alloc::vec::Vec;

use opal_abi::PATH_MAX;
use opal_abi::errno::EINVAL;
use opal_abi::signal::SigAction;
use opal_abi::syscalls::{PROT_EXEC, PROT_READ, PROT_WRITE};

use crate::config::TICKS_PER_SECOND;
use crate::memory::VirtAddr;
use crate::memory::vm::VmFlags;
use crate::process;
use crate::sched;

use super::{copy_from_user, copy_to_user, current_space, result, user_str};

/// Pull a NULL-terminated user pointer vector into kernel buffers.
fn user_vec(va: usize) -> Result<Vec<Vec<u8>>, i32> {
    let vm = current_space()?;
    let count = vm.check_args(VirtAddr::new(va))?;

    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let slot = va + i * size_of::<usize>();
        let ptr: usize = copy_from_user(slot)?;
        let s = user_str(ptr, opal_abi::ARG_MAX)?;
        out.push(s.into_bytes());
    }
    Ok(out)
}

pub fn sys_exec(path: usize, argv: usize, envp: usize) -> isize {
    let r = (|| {
        let path = user_str(path, PATH_MAX)?;
        let args = if argv != 0 { user_vec(argv)? } else { Vec::new() };
        let envs = if envp != 0 { user_vec(envp)? } else { Vec::new() };

        let arg_refs: Vec<&[u8]> = args.iter().map(|a| a.as_slice()).collect();
        let env_refs: Vec<&[u8]> = envs.iter().map(|e| e.as_slice()).collect();
        process::exec::exec(&path, &arg_refs, &env_refs)
    })();
    result(r)
}

pub fn sys_waitpid(pid: i32, statloc: usize, options: usize) -> isize {
    match process::wait(pid, options) {
        Ok((pid, status)) => {
            if statloc != 0 && copy_to_user(statloc, &status).is_err() {
                return -(opal_abi::errno::EFAULT as isize);
            }
            pid as isize
        }
        Err(e) => e as isize,
    }
}

pub fn sys_mmap(hint: usize, len: usize, prot: usize) -> isize {
    if len == 0 {
        return -(EINVAL as isize);
    }
    let mut flags = VmFlags::USER;
    if prot & PROT_READ != 0 {
        flags |= VmFlags::READ;
    }
    if prot & PROT_WRITE != 0 {
        flags |= VmFlags::READ | VmFlags::WRITE;
    }
    if prot & PROT_EXEC != 0 {
        flags |= VmFlags::EXEC;
    }

    let r = current_space().and_then(|vm| vm.map(VirtAddr::new(hint), len, flags));
    match r {
        Ok(va) => va.into_raw() as isize,
        Err(e) => e as isize,
    }
}

/// Sleep for `ms` milliseconds; `-EINTR` if a signal cut it short.
pub fn sys_nanosleep(ms: u64) -> isize {
    let ticks = (ms * TICKS_PER_SECOND).div_ceil(1000);
    sched::sleep_current(ticks) as isize
}

pub fn sys_sigaction(signo: usize, new: usize, old: usize) -> isize {
    let r = (|| {
        let new_action = if new != 0 {
            Some(copy_from_user::<SigAction>(new)?)
        } else {
            None
        };
        let old_action = process::signal::sigaction(signo as u32, new_action)?;
        if old != 0 {
            copy_to_user(old, &old_action)?;
        }
        Ok(0)
    })();
    result(r)
}

pub fn sys_sigprocmask(how: usize, set: usize, oldset: usize) -> isize {
    let r = (|| {
        let old = process::signal::sigprocmask(how, set as u32)?;
        if oldset != 0 {
            copy_to_user(oldset, &old)?;
        }
        Ok(0)
    })();
    result(r)
}
