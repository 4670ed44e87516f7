//! Descriptor-side syscall bodies: everything funnels into the fd table
//! and out over the owning connection.

use opal_abi::PATH_MAX;
use opal_abi::errno::EINVAL;
use opal_abi::fcntl::{F_DUPFD, F_GETFD, F_GETFL, F_SETFD, F_SETFL, FdFlags, OpenFlags, Stat};

use crate::fs;
use crate::ipc::pipe;
use crate::memory::VirtAddr;
use crate::process;

use super::{copy_to_user, current_space, result, user_str};

fn with_fds<T>(f: impl FnOnce(&mut crate::process::fd::FdTable) -> T) -> T {
    let proc = process::current();
    let mut fds = unsafe { proc.as_ref() }.fds.lock();
    f(&mut fds)
}

pub fn sys_open(path: usize, flags: usize) -> isize {
    let r = (|| {
        let path = user_str(path, PATH_MAX)?;
        let flags = OpenFlags::from_bits_truncate(flags as u32);
        let conn = fs::open(&path, flags)?;
        let fd_flags = if flags.contains(OpenFlags::O_CLOEXEC) {
            FdFlags::CLOEXEC
        } else {
            FdFlags::empty()
        };
        with_fds(|fds| fds.alloc(conn, fd_flags))
    })();
    result(r)
}

pub fn sys_close(fd: usize) -> isize {
    result(with_fds(|fds| fds.close(fd)).map(|_| 0))
}

pub fn sys_pipe(fds_out: usize) -> isize {
    let r = (|| {
        let (read_end, write_end) = pipe::create()?;
        let (rfd, wfd) = with_fds(|fds| -> Result<(usize, usize), i32> {
            let rfd = fds.alloc(read_end, FdFlags::empty())?;
            let wfd = match fds.alloc(write_end, FdFlags::empty()) {
                Ok(wfd) => wfd,
                Err(e) => {
                    let _ = fds.close(rfd);
                    return Err(e);
                }
            };
            Ok((rfd, wfd))
        })?;

        let pair = [rfd as u32, wfd as u32];
        copy_to_user(fds_out, &pair)?;
        Ok(0)
    })();
    result(r)
}

pub fn sys_read(fd: usize, buf: usize, nbyte: usize) -> isize {
    let conn = match with_fds(|fds| fds.get(fd)) {
        Ok(conn) => conn,
        Err(e) => return e as isize,
    };
    if let Err(e) = current_space().and_then(|vm| vm.check_buf(VirtAddr::new(buf), nbyte, true)) {
        return e as isize;
    }
    fs::read(&conn, VirtAddr::new(buf), nbyte)
}

pub fn sys_write(fd: usize, buf: usize, nbyte: usize) -> isize {
    let conn = match with_fds(|fds| fds.get(fd)) {
        Ok(conn) => conn,
        Err(e) => return e as isize,
    };
    if let Err(e) = current_space().and_then(|vm| vm.check_buf(VirtAddr::new(buf), nbyte, false)) {
        return e as isize;
    }
    fs::write(&conn, VirtAddr::new(buf), nbyte)
}

pub fn sys_seek(fd: usize, offset: isize, whence: usize) -> isize {
    match with_fds(|fds| fds.get(fd)) {
        Ok(conn) => fs::seek(&conn, offset as i64, whence as u32),
        Err(e) => e as isize,
    }
}

pub fn sys_fstat(fd: usize, statloc: usize) -> isize {
    let r = (|| {
        let conn = with_fds(|fds| fds.get(fd))?;
        let mut stat = Stat::default();
        let r = fs::fstat(&conn, &mut stat);
        if r < 0 {
            return Err(r as i32);
        }
        copy_to_user(statloc, &stat)?;
        Ok(0)
    })();
    result(r)
}

pub fn sys_stat(path: usize, statloc: usize) -> isize {
    let r = (|| {
        let path = user_str(path, PATH_MAX)?;
        let conn = fs::open(&path, OpenFlags::empty())?;
        let mut stat = Stat::default();
        let r = fs::fstat(&conn, &mut stat);
        if r < 0 {
            return Err(r as i32);
        }
        copy_to_user(statloc, &stat)?;
        Ok(0)
    })();
    result(r)
}

pub fn sys_chdir(path: usize) -> isize {
    let r = (|| {
        let path = user_str(path, PATH_MAX)?;
        let proc = process::current();
        *unsafe { proc.as_ref() }.cwd.lock() = path;
        Ok(0)
    })();
    result(r)
}

pub fn sys_dup(fd: usize) -> isize {
    result(with_fds(|fds| fds.dup(fd)))
}

pub fn sys_dup2(old: usize, new: usize) -> isize {
    result(with_fds(|fds| fds.dup2(old, new)))
}

pub fn sys_fcntl(fd: usize, cmd: usize, arg: usize) -> isize {
    let r = (|| match cmd as u32 {
        F_DUPFD => with_fds(|fds| fds.dup(fd)),
        F_GETFD => with_fds(|fds| fds.flags(fd)).map(|f| f.bits() as usize),
        F_SETFD => {
            with_fds(|fds| fds.set_flags(fd, FdFlags::from_bits_truncate(arg as u32)))?;
            Ok(0)
        }
        F_GETFL => {
            let conn = with_fds(|fds| fds.get(fd))?;
            Ok(conn.open_flags().bits() as usize)
        }
        F_SETFL => {
            let conn = with_fds(|fds| fds.get(fd))?;
            conn.set_open_flags(OpenFlags::from_bits_truncate(arg as u32));
            Ok(0)
        }
        _ => Err(-EINVAL),
    })();
    result(r)
}

pub fn sys_ioctl(fd: usize, request: usize, arg: usize) -> isize {
    match with_fds(|fds| fds.get(fd)) {
        Ok(conn) => fs::ioctl(&conn, request as u32, arg),
        Err(e) => e as isize,
    }
}
