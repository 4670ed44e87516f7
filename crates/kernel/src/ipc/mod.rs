//! The synchronous IPC transport: channels, endpoints, connections.
//!
//! A [`Channel`] owns its server-side [`Endpoint`] (a mailbox of in-flight
//! request pointers). [`Connection`]s are the client handles, strong
//! references to the channel that file descriptors can hold. Requests
//! observe their connection only through their own refcount, which breaks
//! the ownership cycle.

pub mod pipe;
pub mod request;

#[cfg(test)]
mod tests;

use alloc::sync::Arc;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashMap;
use opal_abi::errno::{ENOMEM, ETIMEDOUT};
use opal_abi::fcntl::OpenFlags;
use opal_abi::ipc::Message;

use crate::config::{ENDPOINT_MAILBOX_CAPACITY, IPC_TIMEOUT_TICKS};
use crate::memory::VirtAddr;
use crate::process;
use crate::sync::mailbox::KMailBox;
use crate::sync::spinlock::{SpinLock, spin_lock};

pub use request::{IoVec, Request};

/// The server side of a channel: the mailbox carrying `*mut Request`.
pub struct Endpoint {
    mbox: KMailBox,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            mbox: KMailBox::new(
                "endpoint",
                size_of::<usize>(),
                ENDPOINT_MAILBOX_CAPACITY,
            ),
        }
    }

    /// Server receive; blocks up to `timeout` ticks.
    pub fn receive(&self, timeout: u64) -> Result<NonNull<Request>, i32> {
        let mut raw = [0u8; size_of::<usize>()];
        self.mbox.timed_receive(&mut raw, timeout, true)?;
        Ok(NonNull::new(usize::from_ne_bytes(raw) as *mut Request).unwrap())
    }

    fn push(&self, req: NonNull<Request>, timeout: u64) -> Result<(), i32> {
        let raw = (req.as_ptr() as usize).to_ne_bytes();
        self.mbox.timed_send(&raw, timeout, true)
    }

    /// Fail fast: drain still-queued requests, answering each with an
    /// error so their senders unblock.
    fn drain(&self) {
        let mut raw = [0u8; size_of::<usize>()];
        while self.mbox.try_receive(&mut raw) {
            let req = NonNull::new(usize::from_ne_bytes(raw) as *mut Request).unwrap();
            Request::reply(req, -1);
        }
    }
}

/// A hashed-ID-addressable message channel.
pub struct Channel {
    id: u32,
    /// Shared so blocking sends/receives run outside the spinlock.
    endpoint: SpinLock<Option<Arc<Endpoint>>>,
}

static CHANNELS: SpinLock<Option<HashMap<u32, Arc<Channel>>>> = spin_lock("channel_id", None);
static NEXT_CHANNEL_ID: AtomicU32 = AtomicU32::new(1);

impl Channel {
    /// Create a channel with a live endpoint and register it in the ID
    /// table.
    pub fn create() -> Arc<Channel> {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::new(Channel {
            id,
            endpoint: spin_lock("endpoint", Some(Arc::new(Endpoint::new()))),
        });

        CHANNELS
            .lock()
            .get_or_insert_with(HashMap::new)
            .insert(id, channel.clone());
        channel
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn by_id(id: u32) -> Option<Arc<Channel>> {
        let channels = CHANNELS.lock();
        channels.as_ref()?.get(&id).cloned()
    }

    /// The endpoint, while the server still owns one.
    pub fn endpoint(&self) -> Option<Arc<Endpoint>> {
        self.endpoint.lock().clone()
    }

    /// Server shutdown: later sends fail immediately; queued requests are
    /// answered with an error.
    pub fn destroy_endpoint(&self) {
        let endpoint = self.endpoint.lock().take();
        if let Some(endpoint) = endpoint {
            endpoint.mbox.destroy();
            endpoint.drain();
        }
        CHANNELS.lock().as_mut().map(|m| m.remove(&self.id));
    }

    pub fn has_endpoint(&self) -> bool {
        self.endpoint.lock().is_some()
    }
}

/// Client-side handle, held by file descriptors.
pub struct Connection {
    channel: Arc<Channel>,
    pub flags: AtomicU32,
}

impl Connection {
    pub fn new(channel: Arc<Channel>, flags: OpenFlags) -> Arc<Connection> {
        Arc::new(Connection {
            channel,
            flags: AtomicU32::new(flags.bits()),
        })
    }

    pub fn open_flags(&self) -> OpenFlags {
        OpenFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub fn set_open_flags(&self, flags: OpenFlags) {
        self.flags.store(flags.bits(), Ordering::Relaxed);
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Send a message with optional flat payload buffers; convenience over
    /// [`Connection::send_iov`].
    pub fn send(&self, msg: &Message, send_data: Option<IoVec>, recv_data: Option<IoVec>) -> isize {
        let msg_iov = IoVec {
            base: VirtAddr::from_ptr(msg as *const Message),
            len: size_of::<Message>(),
        };

        let mut send_iovs = heapless::Vec::<IoVec, { request::IOV_MAX }>::new();
        let _ = send_iovs.push(msg_iov);
        if let Some(iov) = send_data {
            let _ = send_iovs.push(iov);
        }
        let mut recv_iovs = heapless::Vec::<IoVec, { request::IOV_MAX }>::new();
        if let Some(iov) = recv_data {
            let _ = recv_iovs.push(iov);
        }

        self.send_iov(&send_iovs, &recv_iovs)
    }

    /// The synchronous send: build a request, hand one reference to the
    /// server through the endpoint mailbox, then wait on the request
    /// semaphore. Both legs share the documented IPC timeout.
    pub fn send_iov(&self, send_iovs: &[IoVec], recv_iovs: &[IoVec]) -> isize {
        // Dead server: fail immediately
        if !self.channel.has_endpoint() {
            return -1;
        }

        let space = process::try_current_space();
        let Some(req_ptr) = Request::create(space, send_iovs, recv_iovs) else {
            return -(ENOMEM as isize);
        };
        let req = unsafe { req_ptr.as_ref() };

        // One reference for us, one for the server
        Request::dup(req_ptr);

        let pushed = self
            .channel
            .endpoint()
            .ok_or(-ETIMEDOUT)
            .and_then(|endpoint| endpoint.push(req_ptr, IPC_TIMEOUT_TICKS));
        if let Err(e) = pushed {
            // The server never saw the request: both references die
            Request::destroy(req_ptr);
            Request::destroy(req_ptr);
            return e as isize;
        }

        match req.wait(IPC_TIMEOUT_TICKS) {
            Ok(result) => {
                Request::destroy(req_ptr);
                result
            }
            Err(_) => {
                // Orphan the request; the server still holds its reference
                // and will treat its eventual reply as best-effort.
                req.abandon();
                Request::destroy(req_ptr);
                -(ETIMEDOUT as isize)
            }
        }
    }
}

impl Drop for Connection {
    /// The last file-descriptor reference closing tells the server.
    fn drop(&mut self) {
        if self.channel.has_endpoint() {
            let msg = Message::Close;
            self.send(&msg, None, None);
        }
    }
}
