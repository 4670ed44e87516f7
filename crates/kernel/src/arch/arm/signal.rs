//! Signal frame setup and return for ARM.
//!
//! Delivery pushes a [`SignalFrame`] (siginfo + the interrupted context)
//! onto the user stack, points the PC at the handler and the return address
//! at the process's user-mode trampoline; the trampoline's `sigreturn`
//! syscall restores the saved context after checking it stays in user mode.

use opal_abi::signal::SigInfo;

use crate::memory::vm;
use crate::memory::{PAGE_SIZE, VirtAddr};

use super::registers::{PSR_M_MASK, PSR_M_USR};
use super::threading::TrapFrame;

/// User-mode return trampoline: `svc #15` (the sigreturn syscall), mapped
/// into every process at creation.
pub const STUB_CODE: &[u8] = &0xEF00_000Fu32.to_le_bytes();

/// What lands on the user stack for each delivered signal.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SignalFrame {
    pub info: SigInfo,
    /// Signal mask to restore on return.
    pub saved_mask: u32,
    /// The interrupted user context.
    pub context: TrapFrame,
}

/// Rewrite `tf` so the process enters `handler(signo, &info, &context)` on
/// its stack, with the return path through `stub`.
pub fn signal_prepare(
    pgtab: &mut vm::PageTable,
    tf: &mut TrapFrame,
    info: &SigInfo,
    handler: VirtAddr,
    stub: VirtAddr,
    saved_mask: u32,
) -> Result<(), ()> {
    let frame = SignalFrame {
        info: *info,
        saved_mask,
        context: *tf,
    };

    let sp = VirtAddr::new(tf.sp_usr as usize)
        .align_down(8)
        .into_raw()
        .checked_sub(size_of::<SignalFrame>())
        .ok_or(())?;
    let frame_addr = VirtAddr::new(sp).align_down(8);

    let bytes = unsafe {
        core::slice::from_raw_parts(
            (&raw const frame).cast::<u8>(),
            size_of::<SignalFrame>(),
        )
    };
    vm::copy_out(pgtab, frame_addr, bytes).map_err(|_| ())?;

    let info_addr = frame_addr.add(core::mem::offset_of!(SignalFrame, info));
    let context_addr = frame_addr.add(core::mem::offset_of!(SignalFrame, context));

    tf.sp_usr = frame_addr.into_raw() as u32;
    tf.lr_usr = stub.into_raw() as u32;
    tf.pc = handler.into_raw() as u32;
    tf.r[0] = frame.info.si_signo;
    tf.r[1] = info_addr.into_raw() as u32;
    tf.r[2] = context_addr.into_raw() as u32;
    // Handlers always start in plain user ARM state
    tf.psr = PSR_M_USR;
    Ok(())
}

/// `sigreturn`: restore the context saved by [`signal_prepare`]. Returns
/// the restored result register and the mask to reinstate.
pub fn signal_return(pgtab: &mut vm::PageTable, tf: &mut TrapFrame) -> Result<(usize, u32), ()> {
    let frame_addr = VirtAddr::new(tf.sp_usr as usize);
    if frame_addr.into_raw() == 0 || frame_addr.into_raw() >= crate::memory::layout::VIRT_KERNEL_BASE {
        return Err(());
    }

    let mut frame = SignalFrame {
        info: SigInfo::default(),
        saved_mask: 0,
        context: *tf,
    };
    let bytes = unsafe {
        core::slice::from_raw_parts_mut(
            (&raw mut frame).cast::<u8>(),
            size_of::<SignalFrame>(),
        )
    };
    vm::copy_in(pgtab, frame_addr, bytes).map_err(|_| ())?;

    // A forged frame must not smuggle the thread into a privileged mode
    if frame.context.psr & PSR_M_MASK != PSR_M_USR {
        return Err(());
    }

    *tf = frame.context;
    Ok((tf.return_value(), frame.saved_mask))
}

// Signal frames must fit comfortably in one stack page
const _: () = assert!(size_of::<SignalFrame>() < PAGE_SIZE / 4);
