//! Boot entry, the minimal entry translation table and the exception vector
//! stubs that build [`TrapFrame`]s for the common `trap` handler.
//!
//! [`TrapFrame`]: super::threading::TrapFrame

use core::arch::global_asm;

use super::registers::{SCTLR_V, sctlr_get, sctlr_set};

// Boot path, executed from physical addresses with the MMU off:
//  1. pick a per-CPU boot stack,
//  2. fill the entry translation table with 1 MiB sections covering the
//     first 16 MiB of RAM, both identity-mapped and aliased at the kernel
//     base, and
//  3. enable the MMU and jump to the high half.
//
// Secondary cores are released by `smp_release` writing their entry into the
// board FLAGSSET register and sending an event.
global_asm!(
    r#"
.section .text.boot, "ax"
.arm
.global _start
_start:
    // CPU index from MPIDR
    mrc     p15, 0, r0, c0, c0, 5
    and     r0, r0, #3

    // Per-CPU boot stack (physical alias of the .bss stacks)
    ldr     sp, =__boot_stack_top
    sub     sp, sp, #0x80000000
    mov     r1, #0x2000
    mul     r2, r0, r1
    sub     sp, sp, r2

    // Only the boot CPU fills the entry table
    cmp     r0, #0
    bne     1f

    ldr     r1, =entry_trtab
    sub     r1, r1, #0x80000000
    mov     r2, #0                  // section index
    mov     r3, #16                 // 16 MiB worth of sections
0:
    lsl     r4, r2, #20
    orr     r4, r4, #0x0C00         // AP = priv RW
    orr     r4, r4, #0x000E         // section, cacheable, bufferable
    str     r4, [r1, r2, lsl #2]    // identity map
    add     r5, r2, #0x800          // + VIRT_KERNEL_BASE >> 20
    str     r4, [r1, r5, lsl #2]    // kernel alias
    add     r2, r2, #1
    cmp     r2, r3
    blo     0b

1:
    // Domain 0: client
    mov     r1, #1
    mcr     p15, 0, r1, c3, c0, 0

    // Load the entry table into both TTBRs (TTBCR.N = 0 for now)
    ldr     r1, =entry_trtab
    sub     r1, r1, #0x80000000
    mcr     p15, 0, r1, c2, c0, 0
    mcr     p15, 0, r1, c2, c0, 1
    mov     r1, #0
    mcr     p15, 0, r1, c2, c0, 2
    mcr     p15, 0, r1, c8, c7, 0   // invalidate TLBs

    // MMU + caches on
    mrc     p15, 0, r1, c1, c0, 0
    orr     r1, r1, #0x1            // M
    orr     r1, r1, #0x4            // C
    orr     r1, r1, #0x1000         // I
    mcr     p15, 0, r1, c1, c0, 0
    isb

    // Jump to the high half
    ldr     r1, =2f
    bx      r1
2:
    add     sp, sp, #0x80000000
    cmp     r0, #0
    bne     3f
    bl      kmain
3:
    bl      kmain_secondary
4:
    wfi
    b       4b
.ltorg

.section .bss.boot
.align 14
.global entry_trtab
entry_trtab:
    .space  0x4000
.align 12
__boot_stacks:
    .space  0x2000 * 4
.global __boot_stack_top
__boot_stack_top:
"#
);

// Exception vectors and trap entry stubs. Every stub funnels into a common
// TrapFrame build on the SVC stack:
//   [sp_usr, lr_usr, trapno, r0-r12, pc, psr]
// which must stay in lockstep with `threading::TrapFrame`.
global_asm!(
    r#"
.section .vectors, "ax"
.arm
.align 5
.global __vectors
__vectors:
    ldr     pc, =vector_reset
    ldr     pc, =vector_undef
    ldr     pc, =vector_svc
    ldr     pc, =vector_pabt
    ldr     pc, =vector_dabt
    ldr     pc, =vector_reserved
    ldr     pc, =vector_irq
    ldr     pc, =vector_fiq
.ltorg

.section .text
.arm

.macro  trap_entry trapno, lradj
    sub     lr, lr, #\lradj
    srsdb   sp!, #0x13              // push pc, spsr onto the SVC stack
    cps     #0x13
    push    {{r0-r12}}
    mov     r0, #\trapno
    push    {{r0}}
    sub     sp, sp, #8
    stmia   sp, {{r13, r14}}^       // banked user sp/lr
    mov     r0, sp
    bl      trap
    b       trap_exit
.endm

vector_reset:
    trap_entry 0, 0
vector_undef:
    trap_entry 1, 0
vector_svc:
    trap_entry 2, 0
vector_pabt:
    trap_entry 3, 4
vector_dabt:
    trap_entry 4, 8
vector_reserved:
    trap_entry 5, 0
vector_irq:
    trap_entry 6, 4
vector_fiq:
    trap_entry 7, 4

.global trap_exit
trap_exit:
    ldmia   sp, {{r13, r14}}^
    add     sp, sp, #12
    pop     {{r0-r12}}
    rfeia   sp!
.ltorg
"#
);

/// Route exceptions through the high-vector page; the kernel map aliases the
/// `.vectors` section at `VIRT_VECTOR_BASE`.
pub fn vectors_init() {
    sctlr_set(sctlr_get() | SCTLR_V);
}

unsafe extern "C" {
    /// Link-time address of the vector page, for the kernel map.
    pub static __vectors: u8;
}

/// Physical address secondary CPUs jump to once released.
pub fn secondary_entry_pa() -> usize {
    unsafe extern "C" {
        fn _start();
    }
    _start as usize - crate::memory::layout::VIRT_KERNEL_BASE
}
