//! Signal frame setup and return for i386. The handler arguments go on the
//! stack per the cdecl convention, with the return address pointing at the
//! process's sigreturn trampoline.

use opal_abi::signal::SigInfo;

use crate::memory::vm;
use crate::memory::VirtAddr;

use super::registers::{SEG_UCODE, SEG_UDATA};
use super::threading::TrapFrame;

/// User-mode return trampoline: `mov eax, 15; int 0x40`.
pub const STUB_CODE: &[u8] = &[0xB8, 0x0F, 0x00, 0x00, 0x00, 0xCD, 0x40];

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SignalFrame {
    /// cdecl call plumbing: return address + (signo, siginfo*, context*).
    pub ret: u32,
    pub signo: u32,
    pub info_ptr: u32,
    pub context_ptr: u32,
    pub info: SigInfo,
    pub saved_mask: u32,
    pub context: TrapFrame,
}

pub fn signal_prepare(
    pgtab: &mut vm::PageTable,
    tf: &mut TrapFrame,
    info: &SigInfo,
    handler: VirtAddr,
    stub: VirtAddr,
    saved_mask: u32,
) -> Result<(), ()> {
    let sp = (tf.esp as usize)
        .checked_sub(size_of::<SignalFrame>())
        .ok_or(())?;
    let frame_addr = VirtAddr::new(sp).align_down(4);

    let info_addr = frame_addr.add(core::mem::offset_of!(SignalFrame, info));
    let context_addr = frame_addr.add(core::mem::offset_of!(SignalFrame, context));

    let frame = SignalFrame {
        ret: stub.into_raw() as u32,
        signo: info.si_signo,
        info_ptr: info_addr.into_raw() as u32,
        context_ptr: context_addr.into_raw() as u32,
        info: *info,
        saved_mask,
        context: *tf,
    };

    let bytes = unsafe {
        core::slice::from_raw_parts((&raw const frame).cast::<u8>(), size_of::<SignalFrame>())
    };
    vm::copy_out(pgtab, frame_addr, bytes).map_err(|_| ())?;

    tf.esp = frame_addr.into_raw() as u32;
    tf.eip = handler.into_raw() as u32;
    Ok(())
}

pub fn signal_return(pgtab: &mut vm::PageTable, tf: &mut TrapFrame) -> Result<(usize, u32), ()> {
    // The stub's sigreturn leaves esp pointing into the frame, past the
    // popped return address.
    let frame_addr = VirtAddr::new(tf.esp as usize)
        .into_raw()
        .checked_sub(size_of::<u32>())
        .ok_or(())?;

    let mut frame = SignalFrame {
        ret: 0,
        signo: 0,
        info_ptr: 0,
        context_ptr: 0,
        info: SigInfo::default(),
        saved_mask: 0,
        context: *tf,
    };
    let bytes = unsafe {
        core::slice::from_raw_parts_mut((&raw mut frame).cast::<u8>(), size_of::<SignalFrame>())
    };
    vm::copy_in(pgtab, VirtAddr::new(frame_addr), bytes).map_err(|_| ())?;

    // Restored segments must stay in ring 3
    if frame.context.cs & 3 != 3 {
        return Err(());
    }
    let mut context = frame.context;
    context.cs = SEG_UCODE;
    context.ss = SEG_UDATA;
    context.ds = SEG_UDATA;
    context.es = SEG_UDATA;
    context.fs = SEG_UDATA;
    context.gs = SEG_UDATA;

    *tf = context;
    Ok((tf.return_value(), frame.saved_mask))
}
