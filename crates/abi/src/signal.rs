//! Signal numbers, `siginfo` codes and `sigaction` records.

use bitflags::bitflags;

pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGTRAP: u32 = 5;
pub const SIGABRT: u32 = 6;
pub const SIGBUS: u32 = 7;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGUSR2: u32 = 12;
pub const SIGPIPE: u32 = 13;
pub const SIGALRM: u32 = 14;
pub const SIGTERM: u32 = 15;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIGTSTP: u32 = 20;
pub const SIGTTIN: u32 = 21;
pub const SIGTTOU: u32 = 22;

/// One past the highest supported signal number.
pub const NSIG: usize = 32;

/// `si_code` values for [`SIGSEGV`].
pub const SEGV_MAPERR: i32 = 1;
pub const SEGV_ACCERR: i32 = 2;
/// `si_code` value for [`SIGILL`].
pub const ILL_ILLOPC: i32 = 1;
/// `si_code` for signals sent by `kill`.
pub const SI_USER: i32 = 0;

/// Special handler values for [`SigAction::handler`].
pub const SIG_DFL: usize = 0;
pub const SIG_IGN: usize = 1;

/// Payload delivered alongside a signal, written into the user-stack frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SigInfo {
    pub si_signo: u32,
    pub si_code: i32,
    /// Faulting address for SIGSEGV/SIGBUS, sender pid for SI_USER.
    pub si_value: usize,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SigActionFlags: u32 {
        const SA_RESTART = 1 << 0;
        const SA_NODEFER = 1 << 1;
        const SA_RESETHAND = 1 << 2;
    }
}

/// A set of signals, one bit per signal number.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigSet(pub u32);

impl SigSet {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn contains(&self, signo: u32) -> bool {
        self.0 & (1 << signo) != 0
    }

    #[inline]
    pub fn insert(&mut self, signo: u32) {
        self.0 |= 1 << signo;
    }

    #[inline]
    pub fn remove(&mut self, signo: u32) {
        self.0 &= !(1 << signo);
    }
}

/// `sigprocmask` operations.
pub const SIG_BLOCK: usize = 0;
pub const SIG_UNBLOCK: usize = 1;
pub const SIG_SETMASK: usize = 2;

/// Per-signal disposition installed with the `sigaction` syscall.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SigAction {
    /// User handler entry point, or [`SIG_DFL`] / [`SIG_IGN`].
    pub handler: usize,
    /// Signals additionally blocked while the handler runs.
    pub mask: SigSet,
    pub flags: SigActionFlags,
}

/// What the kernel does with a signal whose disposition is [`SIG_DFL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    Ignore,
    Stop,
    Continue,
}

/// The default action table (core dumps degrade to plain termination).
pub const fn default_action(signo: u32) -> DefaultAction {
    match signo {
        SIGCHLD => DefaultAction::Ignore,
        SIGCONT => DefaultAction::Continue,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
        _ => DefaultAction::Terminate,
    }
}

/// Signals whose delivery cannot be masked or handled.
pub const fn unblockable(signo: u32) -> bool {
    matches!(signo, SIGKILL | SIGSTOP)
}
