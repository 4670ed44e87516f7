//! Pipes, served over the IPC transport.
//!
//! Each pipe is two channels (one per end) serviced by two kernel tasks
//! sharing a bounded ring. Requests that cannot make progress are parked
//! and answered when the other side produces space, data or an EOF.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::ptr::NonNull;

use opal_abi::errno::{EINVAL, ENOSYS, EPIPE};
use opal_abi::fcntl::OpenFlags;
use opal_abi::ipc::Message;

use crate::config::{PIPE_BUF, PRIORITY_KERNEL};
use crate::ipc::{Channel, Connection, Request};
use crate::sched;
use crate::sync::spinlock::{SpinLock, spin_lock};
use crate::task;

struct PipeState {
    ring: VecDeque<u8>,
    readers_open: bool,
    writers_open: bool,
    /// Parked requests: `(request, bytes still wanted)`.
    pending_reads: VecDeque<(NonNull<Request>, usize)>,
    pending_writes: VecDeque<(NonNull<Request>, usize)>,
}

unsafe impl Send for PipeState {}

impl PipeState {
    fn space(&self) -> usize {
        PIPE_BUF - self.ring.len()
    }

    /// Answer every parked request that can now make progress.
    fn flush(&mut self) {
        loop {
            let mut progressed = false;

            if !self.ring.is_empty() && let Some((req, nbyte)) = self.pending_reads.pop_front() {
                self.complete_read(req, nbyte);
                progressed = true;
            } else if self.ring.is_empty()
                && !self.writers_open
                && let Some((req, _)) = self.pending_reads.pop_front()
            {
                Request::reply(req, 0);
                progressed = true;
            }

            if self.space() > 0 && let Some((req, nbyte)) = self.pending_writes.pop_front() {
                self.complete_write(req, nbyte);
                progressed = true;
            } else if !self.readers_open && let Some((req, _)) = self.pending_writes.pop_front() {
                Request::reply(req, -(EPIPE as isize));
                progressed = true;
            }

            if !progressed {
                return;
            }
        }
    }

    fn complete_read(&mut self, req: NonNull<Request>, nbyte: usize) {
        let n = nbyte.min(self.ring.len());
        let mut chunk = [0u8; 128];
        let mut copied = 0usize;

        while copied < n {
            let take = (n - copied).min(chunk.len());
            for b in chunk[..take].iter_mut() {
                *b = self.ring.pop_front().unwrap();
            }
            let wrote = unsafe { req.as_ref() }.write(&chunk[..take]);
            if wrote < take as isize {
                // Receiver ran out of room (or went away); stop short
                copied += wrote.max(0) as usize;
                break;
            }
            copied += take;
        }

        Request::reply(req, copied as isize);
    }

    fn complete_write(&mut self, req: NonNull<Request>, nbyte: usize) {
        let n = nbyte.min(self.space());
        let mut chunk = [0u8; 128];
        let mut copied = 0usize;

        while copied < n {
            let take = (n - copied).min(chunk.len());
            let read = unsafe { req.as_ref() }.read(&mut chunk[..take]);
            if read <= 0 {
                break;
            }
            self.ring.extend(&chunk[..read as usize]);
            copied += read as usize;
        }

        Request::reply(req, copied as isize);
    }
}

struct PipeEnd {
    channel: Arc<Channel>,
    state: Arc<SpinLock<PipeState>>,
    writer: bool,
}

fn pipe_server(arg: usize) {
    let end = unsafe { Box::from_raw(arg as *mut PipeEnd) };
    let Some(endpoint) = end.channel.endpoint() else {
        return;
    };

    loop {
        let Ok(req) = endpoint.receive(0) else {
            // Mailbox destroyed underneath us
            break;
        };

        let mut raw = [0u8; size_of::<Message>()];
        if unsafe { req.as_ref() }.read(&mut raw) < raw.len() as isize {
            Request::reply(req, -(EINVAL as isize));
            continue;
        }
        let msg = unsafe { core::ptr::read(raw.as_ptr().cast::<Message>()) };

        let mut state = end.state.lock();
        let mut closed = false;
        match (msg, end.writer) {
            (Message::Read { nbyte }, false) => {
                if !state.ring.is_empty() {
                    state.complete_read(req, nbyte);
                } else if !state.writers_open {
                    Request::reply(req, 0);
                } else {
                    state.pending_reads.push_back((req, nbyte));
                }
            }
            (Message::Write { nbyte }, true) => {
                if !state.readers_open {
                    Request::reply(req, -(EPIPE as isize));
                } else if state.space() > 0 {
                    state.complete_write(req, nbyte);
                } else {
                    state.pending_writes.push_back((req, nbyte));
                }
            }
            (Message::Close, writer) => {
                if writer {
                    state.writers_open = false;
                } else {
                    state.readers_open = false;
                }
                Request::reply(req, 0);
                closed = true;
            }
            (Message::Fstat, _) | (Message::Select { .. }, _) => {
                Request::reply(req, -(ENOSYS as isize));
            }
            _ => Request::reply(req, -(EINVAL as isize)),
        }

        // Whatever just happened may unblock the other side
        state.flush();
        if closed {
            break;
        }
    }

    end.channel.destroy_endpoint();
}

fn spawn_end(channel: Arc<Channel>, state: Arc<SpinLock<PipeState>>, writer: bool) -> Result<(), i32> {
    let end = Box::new(PipeEnd {
        channel,
        state,
        writer,
    });
    let arg = Box::into_raw(end) as usize;
    let task = task::create(None, pipe_server, arg, PRIORITY_KERNEL)
        .map_err(|_| -(opal_abi::errno::ENOMEM))?;
    sched::resume(task)?;
    Ok(())
}

/// Create a pipe: `(read end, write end)` connections ready for the fd
/// table.
pub fn create() -> Result<(Arc<Connection>, Arc<Connection>), i32> {
    let state = Arc::new(spin_lock(
        "pipe",
        PipeState {
            ring: VecDeque::with_capacity(PIPE_BUF),
            readers_open: true,
            writers_open: true,
            pending_reads: VecDeque::new(),
            pending_writes: VecDeque::new(),
        },
    ));

    let read_channel = Channel::create();
    let write_channel = Channel::create();

    spawn_end(read_channel.clone(), state.clone(), false)?;
    spawn_end(write_channel.clone(), state, true)?;

    let read_end = Connection::new(read_channel, OpenFlags::empty());
    let write_end = Connection::new(write_channel, OpenFlags::O_WRONLY);
    Ok((read_end, write_end))
}
