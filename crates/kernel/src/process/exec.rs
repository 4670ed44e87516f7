//! Program loading: replace the current address space with a fresh one
//! built from an ELF image, then re-enter user mode at its entry point.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use opal_abi::errno::{EINVAL, ENOEXEC};
use opal_abi::fcntl::OpenFlags;
use opal_abi::signal::{NSIG, SigAction};

use crate::arch;
use crate::config::{USTACK_SIZE, USTACK_TOP};
use crate::fs;
use crate::memory::vm::VmFlags;
use crate::memory::vmspace::VmSpace;
use crate::memory::{PAGE_SIZE, VirtAddr, page_round_up};
use crate::sched;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELF_CLASS_32: u8 = 1;
const ET_EXEC: u16 = 2;
const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ElfHeader {
    ident: [u8; 16],
    e_type: u16,
    machine: u16,
    version: u32,
    entry: u32,
    phoff: u32,
    shoff: u32,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ProgramHeader {
    p_type: u32,
    offset: u32,
    vaddr: u32,
    paddr: u32,
    filesz: u32,
    memsz: u32,
    flags: u32,
    align: u32,
}

fn read_struct<T: Copy>(read: &mut dyn FnMut(u64, &mut [u8]) -> Result<usize, i32>, offset: u64) -> Result<T, i32> {
    let mut value = core::mem::MaybeUninit::<T>::uninit();
    let buf = unsafe {
        core::slice::from_raw_parts_mut(value.as_mut_ptr().cast::<u8>(), size_of::<T>())
    };
    if read(offset, buf)? != buf.len() {
        return Err(-ENOEXEC);
    }
    Ok(unsafe { value.assume_init() })
}

fn segment_flags(p_flags: u32) -> VmFlags {
    let mut flags = VmFlags::READ | VmFlags::USER;
    if p_flags & PF_W != 0 {
        flags |= VmFlags::WRITE;
    }
    if p_flags & PF_X != 0 {
        flags |= VmFlags::EXEC;
    }
    flags
}

/// Build an address space from an ELF image supplied through `read`.
/// Returns the space, its entry point and the end of the loaded data.
fn load(
    read: &mut dyn FnMut(u64, &mut [u8]) -> Result<usize, i32>,
) -> Result<(Box<VmSpace>, VirtAddr, VirtAddr), i32> {
    let header: ElfHeader = read_struct(read, 0)?;
    if header.ident[..4] != ELF_MAGIC
        || header.ident[4] != ELF_CLASS_32
        || header.e_type != ET_EXEC
    {
        return Err(-ENOEXEC);
    }

    let vm = Box::new(VmSpace::create()?);
    let mut data_break = VirtAddr::null();

    for i in 0..header.phnum {
        let at = header.phoff as u64 + (i as u64) * header.phentsize as u64;
        let ph: ProgramHeader = read_struct(read, at)?;
        if ph.p_type != PT_LOAD || ph.memsz == 0 {
            continue;
        }
        if ph.memsz < ph.filesz || (ph.vaddr as usize).checked_add(ph.memsz as usize).is_none() {
            return Err(-ENOEXEC);
        }

        let start = VirtAddr::new(ph.vaddr as usize).align_down(PAGE_SIZE);
        let end = page_round_up(ph.vaddr as usize + ph.memsz as usize);

        // Segments stay writable: the copy below goes through the kernel
        // alias, and the break may later grow into the same region
        vm.map_fixed(start, end - start.into_raw(), segment_flags(ph.flags) | VmFlags::WRITE)?;

        let mut copied = 0usize;
        let mut chunk = [0u8; 512];
        while copied < ph.filesz as usize {
            let n = chunk.len().min(ph.filesz as usize - copied);
            let got = read(ph.offset as u64 + copied as u64, &mut chunk[..n])?;
            if got == 0 {
                return Err(-ENOEXEC);
            }
            vm.copy_out(VirtAddr::new(ph.vaddr as usize + copied), &chunk[..got])?;
            copied += got;
        }

        if VirtAddr::new(end) > data_break {
            data_break = VirtAddr::new(end);
        }
    }

    vm.set_brk(data_break);
    Ok((vm, VirtAddr::new(header.entry as usize), data_break))
}

/// Push argv/envp onto a fresh user stack; returns `(sp, argv, envp)` user
/// addresses.
fn build_stack(
    vm: &VmSpace,
    args: &[&[u8]],
    envs: &[&[u8]],
) -> Result<(VirtAddr, VirtAddr, VirtAddr), i32> {
    let stack_base = VirtAddr::new(USTACK_TOP - USTACK_SIZE);
    vm.map_fixed(
        stack_base,
        USTACK_SIZE,
        VmFlags::READ | VmFlags::WRITE | VmFlags::USER,
    )?;

    let mut sp = USTACK_TOP;
    let mut push_bytes = |vm: &VmSpace, bytes: &[u8]| -> Result<usize, i32> {
        sp -= bytes.len();
        sp &= !3;
        vm.copy_out(VirtAddr::new(sp), bytes)?;
        Ok(sp)
    };

    // String data first, remembering each string's address
    let mut arg_ptrs = Vec::with_capacity(args.len() + 1);
    for arg in args {
        let mut bytes = Vec::with_capacity(arg.len() + 1);
        bytes.extend_from_slice(arg);
        bytes.push(0);
        arg_ptrs.push(push_bytes(vm, &bytes)? as u32);
    }
    arg_ptrs.push(0);

    let mut env_ptrs = Vec::with_capacity(envs.len() + 1);
    for env in envs {
        let mut bytes = Vec::with_capacity(env.len() + 1);
        bytes.extend_from_slice(env);
        bytes.push(0);
        env_ptrs.push(push_bytes(vm, &bytes)? as u32);
    }
    env_ptrs.push(0);

    // Then the pointer vectors, envp below the strings, argv below envp
    let env_bytes: Vec<u8> = env_ptrs.iter().flat_map(|p| p.to_ne_bytes()).collect();
    let envp = push_bytes(vm, &env_bytes)?;
    let arg_bytes: Vec<u8> = arg_ptrs.iter().flat_map(|p| p.to_ne_bytes()).collect();
    let argv = push_bytes(vm, &arg_bytes)?;

    sp &= !7;
    Ok((VirtAddr::new(sp), VirtAddr::new(argv), VirtAddr::new(envp)))
}

/// Map the one-page sigreturn trampoline and remember its address.
fn install_signal_stub(vm: &VmSpace) -> Result<VirtAddr, i32> {
    let stub_page = VirtAddr::new(USTACK_TOP - USTACK_SIZE - 2 * PAGE_SIZE);
    vm.map_fixed(stub_page, PAGE_SIZE, VmFlags::READ | VmFlags::EXEC | VmFlags::USER)?;
    // The copy lands through the kernel alias; user mode only executes it
    vm.copy_out(stub_page, arch::signal::STUB_CODE)?;
    Ok(stub_page)
}

fn exec_common(
    read: &mut dyn FnMut(u64, &mut [u8]) -> Result<usize, i32>,
    name: &str,
    args: &[&[u8]],
    envs: &[&[u8]],
) -> Result<usize, i32> {
    let proc_ptr = super::current();
    let proc = unsafe { proc_ptr.as_ref() };
    let task = sched::current();
    let tf = unsafe { task.as_ref() }.tf.load(Ordering::Acquire);
    if tf.is_null() {
        return Err(-EINVAL);
    }

    let (vm, entry, _) = load(read)?;
    let (sp, argv, envp) = build_stack(&vm, args, envs)?;
    let stub = install_signal_stub(&vm)?;

    // Point of no return: swap spaces, drop the old one, clean the
    // environment the way POSIX wants it
    let old = proc.install_vm(vm);
    crate::process::activate_address_space(proc_ptr);
    drop(old);

    proc.signal_stub.store(stub.into_raw(), Ordering::Release);
    proc.fds.lock().close_cloexec();
    {
        let lock = super::process_lock();
        lock.acquire();
        unsafe { *proc.handlers.get() = [SigAction::default(); NSIG] };
        lock.release();
    }
    *proc.name.lock() = alloc::string::String::from(name);

    let argc = args.len();
    unsafe {
        *tf = arch::threading::TrapFrame::new_user(
            entry,
            sp,
            [argc, argv.into_raw(), envp.into_raw()],
        );
    }
    Ok(argc)
}

/// `exec` from a path, read through the filesystem boundary.
pub fn exec(path: &str, args: &[&[u8]], envs: &[&[u8]]) -> Result<usize, i32> {
    let conn = fs::open(path, OpenFlags::empty())?;
    let mut read = |offset: u64, buf: &mut [u8]| fs::read_at(&conn, offset as i64, buf);
    exec_common(&mut read, path, args, envs)
}

/// `exec` from an in-memory image (the embedded init).
pub fn exec_image(name: &str, image: &[u8], args: &[&[u8]], envs: &[&[u8]]) -> Result<usize, i32> {
    let mut read = |offset: u64, buf: &mut [u8]| -> Result<usize, i32> {
        let offset = offset as usize;
        if offset >= image.len() {
            return Ok(0);
        }
        let n = buf.len().min(image.len() - offset);
        buf[..n].copy_from_slice(&image[offset..offset + n]);
        Ok(n)
    };
    exec_common(&mut read, name, args, envs)
}
