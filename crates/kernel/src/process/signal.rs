//! Signal queueing and delivery.
//!
//! Signals queue on the target process under the global process lock and
//! are delivered at the next return to user mode: the arch layer writes a
//! frame onto the user stack and redirects the PC; `sigreturn` undoes it.
//! Queueing to an interruptibly-blocked task wakes it with `-EINTR`.

use alloc::boxed::Box;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

use opal_abi::errno::{EINVAL, ESRCH};
use opal_abi::signal::{
    DefaultAction, NSIG, SIG_BLOCK, SIG_DFL, SIG_IGN, SIG_SETMASK, SIG_UNBLOCK, SIGCONT,
    SigAction, SigActionFlags, SigInfo, default_action, unblockable,
};
use opal_abi::wait::signal_status;

use crate::arch;
use crate::arch::threading::TrapFrame;
use crate::memory::VirtAddr;
use crate::sched;
use crate::utils::list::{Link, List, Node};

use super::{Pid, ProcState, Process, process_lock};

/// One queued signal.
pub struct Signal {
    link: Link<Signal>,
    pub info: SigInfo,
}

impl Node for Signal {
    fn link(&mut self) -> &mut Link<Signal> {
        &mut self.link
    }
    fn link_ref(&self) -> &Link<Signal> {
        &self.link
    }
}

fn pending_of(proc: &Process) -> *mut List<Signal> {
    proc.pending.get()
}

/// Queue `info` on `proc` and nudge it towards a delivery point.
pub fn post(proc_ptr: NonNull<Process>, info: SigInfo) {
    let proc = unsafe { proc_ptr.as_ref() };
    let signo = info.si_signo;
    if signo == 0 || signo as usize >= NSIG {
        return;
    }

    let lock = process_lock();
    lock.acquire();

    if proc.state() == ProcState::Zombie {
        lock.release();
        return;
    }

    // Cheap discard: ignored and unhandled-by-default signals never queue
    let action = unsafe { (*proc.handlers.get())[signo as usize] };
    let ignored = action.handler == SIG_IGN
        || (action.handler == SIG_DFL && default_action(signo) == DefaultAction::Ignore);
    if ignored && !unblockable(signo) && signo != SIGCONT {
        lock.release();
        return;
    }

    // SIGCONT lifts a stop immediately, even if it is then ignored
    if signo == SIGCONT && proc.state() == ProcState::Stopped {
        proc.set_state(ProcState::Active);
        if let Some(task) = proc.main_task() {
            let _ = sched::resume(task);
        }
    }

    let signal = Box::leak(Box::new(Signal {
        link: Link::new(),
        info,
    }));
    unsafe { (*pending_of(proc)).push_back(NonNull::from(signal)) };

    let task = proc.main_task();
    lock.release();

    // Interrupt any interruptible sleep so the trap path runs soon
    if let Some(task) = task {
        sched::interrupt(task);
    }
}

/// `kill` semantics: `pid > 0` one process, `pid == 0` the caller's group,
/// `pid == -1` everything except init, `pid < -1` the group `-pid`.
pub fn send(pid: i32, signo: u32, code: i32, value: usize) -> Result<(), i32> {
    if signo as usize >= NSIG {
        return Err(-EINVAL);
    }
    let info = SigInfo {
        si_signo: signo,
        si_code: code,
        si_value: value,
    };

    match pid {
        pid if pid > 0 => {
            let target = super::by_pid(pid as Pid).ok_or(-ESRCH)?;
            post(target, info);
            Ok(())
        }
        0 => {
            let pgid = unsafe { super::current().as_ref() }.pgid();
            send_group(pgid, info)
        }
        -1 => {
            // Not supported as a broadcast; match the group of the caller
            Err(-EINVAL)
        }
        pid => send_group((-pid) as Pid, info),
    }
}

fn send_group(pgid: Pid, info: SigInfo) -> Result<(), i32> {
    let targets = super::processes_in_group(pgid);
    if targets.is_empty() {
        return Err(-ESRCH);
    }
    for target in targets {
        post(target, info);
    }
    Ok(())
}

/// Queue a fault signal against the current process (SIGSEGV/SIGILL paths).
pub fn send_current(signo: u32, code: i32, value: usize) {
    let Some(proc) = super::try_current() else {
        panic!("fault signal {signo} with no current process");
    };
    post(
        proc,
        SigInfo {
            si_signo: signo,
            si_code: code,
            si_value: value,
        },
    );
}

/// Install a new disposition, returning the old one.
pub fn sigaction(signo: u32, new: Option<SigAction>, ) -> Result<SigAction, i32> {
    if signo as usize >= NSIG || unblockable(signo) {
        return Err(-EINVAL);
    }
    let proc = unsafe { super::current().as_ref() };

    let lock = process_lock();
    lock.acquire();
    let handlers = unsafe { &mut *proc.handlers.get() };
    let old = handlers[signo as usize];
    if let Some(new) = new {
        handlers[signo as usize] = new;
    }
    lock.release();
    Ok(old)
}

pub fn sigprocmask(how: usize, set: u32) -> Result<u32, i32> {
    let proc = unsafe { super::current().as_ref() };
    // SIGKILL/SIGSTOP stay deliverable no matter what the caller asks
    let set = set & !(1 << opal_abi::signal::SIGKILL) & !(1 << opal_abi::signal::SIGSTOP);

    let old = proc.sig_mask.load(Ordering::Acquire);
    let new = match how {
        SIG_BLOCK => old | set,
        SIG_UNBLOCK => old & !set,
        SIG_SETMASK => set,
        _ => return Err(-EINVAL),
    };
    proc.sig_mask.store(new, Ordering::Release);
    Ok(old)
}

/// Pop the first deliverable pending signal, if any.
fn take_deliverable(proc: &Process) -> Option<(SigInfo, SigAction)> {
    let lock = process_lock();
    lock.acquire();

    let mask = proc.sig_mask.load(Ordering::Acquire);
    let mut picked = None;
    unsafe {
        for sig_ptr in (*pending_of(proc)).iter() {
            let signo = sig_ptr.as_ref().info.si_signo;
            if mask & (1 << signo) != 0 && !unblockable(signo) {
                continue;
            }
            (*pending_of(proc)).remove(sig_ptr);
            picked = Some(sig_ptr);
            break;
        }
    }

    let result = picked.map(|sig_ptr| {
        let sig = unsafe { Box::from_raw(sig_ptr.as_ptr()) };
        let action = unsafe { (*proc.handlers.get())[sig.info.si_signo as usize] };
        (sig.info, action)
    });

    lock.release();
    result
}

/// Deliver pending signals on the way back to user mode. At most one user
/// handler is set up per trap return; default actions drain in a loop.
pub fn deliver_pending(tf: &mut TrapFrame) {
    let Some(proc_ptr) = super::try_current() else {
        return;
    };
    let proc = unsafe { proc_ptr.as_ref() };

    while let Some((info, action)) = take_deliverable(proc) {
        let signo = info.si_signo;

        match action.handler {
            SIG_IGN => continue,
            SIG_DFL => match default_action(signo) {
                DefaultAction::Ignore => continue,
                DefaultAction::Continue => {
                    proc.set_state(ProcState::Active);
                    continue;
                }
                DefaultAction::Stop => {
                    proc.set_state(ProcState::Stopped);
                    // the trap tail parks the task until SIGCONT
                    return;
                }
                DefaultAction::Terminate => {
                    super::exit_status(signal_status(signo));
                }
            },
            handler => {
                let stub = VirtAddr::new(proc.signal_stub.load(Ordering::Acquire));
                if stub.is_null() {
                    // No way back from a handler; treat as fatal
                    super::exit_status(signal_status(signo));
                }

                // Block the signal (and the action's mask) for the
                // handler's duration; the frame remembers the old mask.
                let old_mask = proc.sig_mask.load(Ordering::Acquire);
                let mut new_mask = old_mask | action.mask.0;
                if !action.flags.contains(SigActionFlags::SA_NODEFER) {
                    new_mask |= 1 << signo;
                }
                proc.sig_mask.store(new_mask, Ordering::Release);

                if action.flags.contains(SigActionFlags::SA_RESETHAND) {
                    let _ = sigaction(signo, Some(SigAction::default()));
                }

                let prepared = proc
                    .with_vm(|vm| {
                        vm.with_pgtab(|pgtab| {
                            arch::signal::signal_prepare(
                                pgtab,
                                tf,
                                &info,
                                VirtAddr::new(handler),
                                stub,
                                old_mask,
                            )
                        })
                    })
                    .unwrap_or(Err(()));

                if prepared.is_err() {
                    // Cannot even build the frame; the process dies
                    super::exit_status(signal_status(signo));
                }
                return;
            }
        }
    }
}

/// Test support: whether `signo` sits in the pending queue.
#[cfg(test)]
pub fn pending_contains(proc_ptr: NonNull<Process>, signo: u32) -> bool {
    let proc = unsafe { proc_ptr.as_ref() };
    let lock = process_lock();
    lock.acquire();
    let found = unsafe {
        (*pending_of(proc))
            .iter()
            .any(|sig| sig.as_ref().info.si_signo == signo)
    };
    lock.release();
    found
}

/// Test support: drop queued instances of `signo`.
#[cfg(test)]
pub fn discard_pending(proc_ptr: NonNull<Process>, signo: u32) {
    let proc = unsafe { proc_ptr.as_ref() };
    let lock = process_lock();
    lock.acquire();
    unsafe {
        for sig in (*pending_of(proc)).iter() {
            if sig.as_ref().info.si_signo == signo {
                (*pending_of(proc)).remove(sig);
                drop(Box::from_raw(sig.as_ptr()));
            }
        }
    }
    lock.release();
}

/// The sigreturn syscall: unwind the handler frame.
pub fn sigreturn(tf: &mut TrapFrame) -> isize {
    let proc = unsafe { super::current().as_ref() };

    let restored = proc
        .with_vm(|vm| vm.with_pgtab(|pgtab| arch::signal::signal_return(pgtab, tf)))
        .unwrap_or(Err(()));

    match restored {
        Ok((result, saved_mask)) => {
            proc.sig_mask.store(saved_mask, Ordering::Release);
            result as isize
        }
        Err(()) => {
            // A forged or clobbered frame is fatal
            super::exit_status(signal_status(opal_abi::signal::SIGSEGV));
        }
    }
}
