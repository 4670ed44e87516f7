use opal_abi::errno::{EAGAIN, ECHILD};
use opal_abi::wait::{WNOHANG, wexitstatus, wifexited};

use crate::config::PRIORITY_KERNEL;
use crate::fs;
use crate::memory::VirtAddr;
use crate::process;
use crate::sched;

fn exits_seven(_arg: usize) {
    process::exit(7);
}

#[test_case]
fn spawn_exit_wait_status() {
    let me = process::current_pid();
    let pid = process::spawn_kernel("t_exit7", exits_seven, 0, PRIORITY_KERNEL).unwrap();
    assert_ne!(pid, me);

    let (reaped, status) = process::wait(pid as i32, 0).unwrap();
    assert_eq!(reaped, pid);
    assert!(wifexited(status));
    assert_eq!(wexitstatus(status), 7);
}

fn exits_slowly(_arg: usize) {
    sched::sleep_current(5);
    process::exit(0);
}

#[test_case]
fn wait_nohang_and_any() {
    let pid = process::spawn_kernel("t_slow", exits_slowly, 0, PRIORITY_KERNEL).unwrap();

    // Not a zombie yet
    assert_eq!(process::wait(pid as i32, WNOHANG), Err(-EAGAIN));

    // -1 reaps any child; the slow one is the only one outstanding
    let (reaped, _) = process::wait(-1, 0).unwrap();
    assert_eq!(reaped, pid);
}

#[test_case]
fn wait_without_children_fails() {
    // Match a pid that cannot be ours
    assert_eq!(process::wait(0x7FFF_FF00, 0), Err(-ECHILD));
}

#[test_case]
fn process_groups() {
    let me = process::current_pid();
    let original = process::getpgid(0).unwrap();

    process::setpgid(0, me).unwrap();
    assert_eq!(process::getpgid(0).unwrap(), me);
    process::setpgid(0, original).unwrap();
}

#[test_case]
fn pipe_hello_then_eof() {
    let (read_end, write_end) = crate::ipc::pipe::create().unwrap();

    let hello = *b"hello";
    let wrote = fs::write(&write_end, VirtAddr::from_ptr(hello.as_ptr()), hello.len());
    assert_eq!(wrote, hello.len() as isize);

    // Closing the writer makes the tail readable, then EOF
    drop(write_end);

    let mut buf = [0u8; 16];
    let got = fs::read(&read_end, VirtAddr::from_ptr(buf.as_ptr()), buf.len());
    assert_eq!(got, hello.len() as isize);
    assert_eq!(&buf[..5], b"hello");

    let eof = fs::read(&read_end, VirtAddr::from_ptr(buf.as_ptr()), buf.len());
    assert_eq!(eof, 0);

    drop(read_end);
}

#[test_case]
fn pipe_blocks_reader_until_data() {
    use crate::sync::semaphore::KSemaphore;
    use crate::task;

    static WRITER_GO: KSemaphore = KSemaphore::new("pipe_w", 0);

    struct Ends {
        write_end: Option<alloc::sync::Arc<crate::ipc::Connection>>,
    }
    static ENDS: crate::sync::spinlock::SpinLock<Ends> =
        crate::sync::spinlock::spin_lock("pipe_ends", Ends { write_end: None });

    fn late_writer(_arg: usize) {
        WRITER_GO.get().unwrap();
        sched::sleep_current(3);
        let write_end = ENDS.lock().write_end.take().unwrap();
        let data = *b"late";
        let n = fs::write(&write_end, VirtAddr::from_ptr(data.as_ptr()), data.len());
        assert_eq!(n, data.len() as isize);
        // dropping closes the writer
    }

    let (read_end, write_end) = crate::ipc::pipe::create().unwrap();
    ENDS.lock().write_end = Some(write_end);

    let me = unsafe { sched::current().as_ref() }.priority();
    let t = task::create(None, late_writer, 0, me).unwrap();
    sched::resume(t).unwrap();
    WRITER_GO.put();

    // This read parks inside the pipe server until the writer shows up
    let mut buf = [0u8; 8];
    let got = fs::read(&read_end, VirtAddr::from_ptr(buf.as_ptr()), buf.len());
    assert_eq!(got, 4);
    assert_eq!(&buf[..4], b"late");
}

#[test_case]
fn sigprocmask_set_and_restore() {
    use opal_abi::signal::{SIG_BLOCK, SIG_SETMASK, SIG_UNBLOCK, SIGUSR1, SIGUSR2};

    let old = process::signal::sigprocmask(SIG_SETMASK, 0).unwrap();

    process::signal::sigprocmask(SIG_BLOCK, 1 << SIGUSR1).unwrap();
    let now = process::signal::sigprocmask(SIG_BLOCK, 1 << SIGUSR2).unwrap();
    assert!(now & (1 << SIGUSR1) != 0);

    let now = process::signal::sigprocmask(SIG_UNBLOCK, 1 << SIGUSR1).unwrap();
    assert!(now & (1 << SIGUSR2) != 0);

    process::signal::sigprocmask(SIG_SETMASK, old).unwrap();
}

#[test_case]
fn sigaction_roundtrip() {
    use opal_abi::signal::{SIGUSR1, SigAction, SigActionFlags, SigSet};

    let installed = SigAction {
        handler: 0x1234_5678,
        mask: SigSet(1 << 5),
        flags: SigActionFlags::SA_RESTART,
    };

    let prev = process::signal::sigaction(SIGUSR1, Some(installed)).unwrap();
    let seen = process::signal::sigaction(SIGUSR1, None).unwrap();
    assert_eq!(seen.handler, 0x1234_5678);
    assert_eq!(seen.mask.0, 1 << 5);

    process::signal::sigaction(SIGUSR1, Some(prev)).unwrap();
}

#[test_case]
fn tty_ctrl_c_queues_sigint_to_foreground() {
    use opal_abi::signal::SIGINT;

    // Make ourselves the foreground group and poke a ^C through the tty
    let me = process::current_pid();
    let original = crate::tty::foreground();
    process::setpgid(0, me).unwrap();
    crate::tty::set_foreground(me);

    // Block it so queueing is observable without delivery side effects
    let old_mask = process::signal::sigprocmask(
        opal_abi::signal::SIG_BLOCK,
        1 << SIGINT,
    )
    .unwrap();

    crate::tty::input(0x03);

    let proc = process::current();
    assert!(
        process::signal::pending_contains(proc, SIGINT),
        "SIGINT must be queued on the foreground group"
    );

    process::signal::discard_pending(proc, SIGINT);
    process::signal::sigprocmask(opal_abi::signal::SIG_SETMASK, old_mask).unwrap();
    crate::tty::set_foreground(original);
}
