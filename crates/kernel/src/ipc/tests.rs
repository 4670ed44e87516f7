use alloc::sync::Arc;

use crate::ipc::{Channel, Connection, IoVec, Request};
use crate::memory::VirtAddr;
use crate::sched;
use crate::sync::semaphore::KSemaphore;
use crate::task;

use opal_abi::fcntl::OpenFlags;

static ECHO_READY: KSemaphore = KSemaphore::new("echo", 0);

/// Serves exactly one request: drains the send side, uppercases it into
/// the receive side and replies with the byte count written.
fn echo_server(channel_addr: usize) {
    let channel = unsafe { Arc::from_raw(channel_addr as *const Channel) };
    let endpoint = channel.endpoint().unwrap();
    ECHO_READY.put();

    let req = endpoint.receive(0).unwrap();
    let r = unsafe { req.as_ref() };

    let mut data = [0u8; 64];
    let mut total = 0usize;
    loop {
        let got = r.read(&mut data[total..total + 8]);
        assert!(got >= 0);
        if got == 0 {
            break;
        }
        total += got as usize;
    }

    for b in data[..total].iter_mut() {
        *b = b.to_ascii_uppercase();
    }
    let wrote = r.write(&data[..total]);
    Request::reply(req, wrote);
}

#[test_case]
fn scatter_gather_ordered_delivery() {
    let channel = Channel::create();
    let me = unsafe { sched::current().as_ref() }.priority();
    let server = task::create(
        None,
        echo_server,
        Arc::into_raw(channel.clone()) as usize,
        me,
    )
    .unwrap();
    sched::resume(server).unwrap();
    ECHO_READY.get().unwrap();

    let conn = Connection::new(channel.clone(), OpenFlags::O_RDWR);

    // Two send iovecs, one (smaller) receive iovec: bytes must arrive in
    // order and the reply truncates to the receive capacity.
    let part_one = *b"hello ";
    let part_two = *b"world";
    let mut reply = [0u8; 8];

    let result = conn.send_iov(
        &[
            IoVec {
                base: VirtAddr::from_ptr(part_one.as_ptr()),
                len: part_one.len(),
            },
            IoVec {
                base: VirtAddr::from_ptr(part_two.as_ptr()),
                len: part_two.len(),
            },
        ],
        &[IoVec {
            base: VirtAddr::from_ptr(reply.as_ptr()),
            len: reply.len(),
        }],
    );

    assert_eq!(result, reply.len() as isize);
    assert_eq!(&reply, b"HELLO WO");

    channel.destroy_endpoint();
}

#[test_case]
fn send_to_dead_endpoint_fails_fast() {
    let channel = Channel::create();
    channel.destroy_endpoint();

    let conn = Connection::new(channel, OpenFlags::O_RDWR);
    let payload = *b"x";
    let result = conn.send_iov(
        &[IoVec {
            base: VirtAddr::from_ptr(payload.as_ptr()),
            len: payload.len(),
        }],
        &[],
    );
    assert_eq!(result, -1);
}

#[test_case]
fn request_refcount_lifecycle() {
    let req = Request::create(None, &[], &[]).unwrap();
    Request::dup(req);

    // Server path: reply consumes the server reference
    Request::reply(req, 42);
    // Sender path: the sender's reference is the last one
    Request::destroy(req);
}

#[test_case]
fn channel_id_lookup() {
    let channel = Channel::create();
    let id = channel.id();
    assert!(Arc::ptr_eq(&Channel::by_id(id).unwrap(), &channel));
    channel.destroy_endpoint();
    assert!(Channel::by_id(id).is_none());
}
