//! i386 boot: multiboot entry, boot GDT, IDT and TSS plumbing, and the
//! trap vector stubs feeding the common `trap` handler.

use core::arch::global_asm;
use core::cell::SyncUnsafeCell;

use super::registers::{SEG_KCODE, SEG_KDATA, SEG_TSS, lidt, ltr};

// Multiboot entry. The boot page directory maps the first 16 MiB both
// identity and at the kernel base with 4 MiB pages, mirroring the ARM
// entry translation table.
global_asm!(
    r#"
.section .multiboot
.align 4
    .long 0x1BADB002
    .long 0x0
    .long -(0x1BADB002)

.section .text.boot
.code32
.global _start
_start:
    // Build the entry page directory: 4 entries of 4 MiB each, twice
    lea     eax, [entry_pgdir - 0x80000000]
    mov     ecx, 0
1:
    mov     edx, ecx
    shl     edx, 22
    or      edx, 0x83           // present, writable, 4 MiB
    mov     [eax + ecx*4], edx
    mov     [eax + 0x800 + ecx*4], edx
    inc     ecx
    cmp     ecx, 4
    jb      1b

    // PSE on, page directory in, paging on
    mov     edx, cr4
    or      edx, 0x10
    mov     cr4, edx
    mov     cr3, eax
    mov     edx, cr0
    or      edx, 0x80010000
    mov     cr0, edx

    lea     eax, [2f]
    jmp     eax
2:
    lgdt    [gdt_desc]
    mov     ax, 0x10
    mov     ds, ax
    mov     es, ax
    mov     ss, ax
    mov     fs, ax
    mov     gs, ax
    ljmp    0x08, 3f
3:
    lea     esp, [__boot_stack_top]
    xor     ebp, ebp
    call    kmain
4:
    hlt
    jmp     4b

.section .data
.align 8
gdt:
    .quad 0x0000000000000000    // null
    .quad 0x00CF9A000000FFFF    // kernel code
    .quad 0x00CF92000000FFFF    // kernel data
    .quad 0x00CFFA000000FFFF    // user code
    .quad 0x00CFF2000000FFFF    // user data
.global gdt_tss
gdt_tss:
    .quad 0x0000000000000000    // TSS, patched at runtime
gdt_desc:
    .word (6 * 8) - 1
    .long gdt

.section .bss.boot
.align 12
.global entry_pgdir
entry_pgdir:
    .space 0x1000
__boot_stacks:
    .space 0x2000 * 4
.global __boot_stack_top
__boot_stack_top:
"#
);

// Trap stubs. Each pushes (err if the CPU did not), the trap number, the
// data segments and the general registers, then calls trap(frame).
global_asm!(
    r#"
.section .text

.macro TRAP_NOEC name, num
.global vector\num
vector\num:
    push    0
    push    \num
    jmp     alltraps
.endm

.macro TRAP_EC name, num
.global vector\num
vector\num:
    push    \num
    jmp     alltraps
.endm

TRAP_NOEC divide, 0
TRAP_NOEC debug, 1
TRAP_NOEC nmi, 2
TRAP_NOEC brkpt, 3
TRAP_NOEC oflow, 4
TRAP_NOEC bound, 5
TRAP_NOEC illop, 6
TRAP_NOEC device, 7
TRAP_EC   dblflt, 8
TRAP_EC   tss, 10
TRAP_EC   segnp, 11
TRAP_EC   stack, 12
TRAP_EC   gpflt, 13
TRAP_EC   pgflt, 14
TRAP_NOEC fperr, 16
TRAP_EC   align, 17
TRAP_NOEC timer, 32
TRAP_NOEC irq1, 33
TRAP_NOEC irq2, 34
TRAP_NOEC irq3, 35
TRAP_NOEC irq4, 36
TRAP_NOEC spurious, 39
TRAP_NOEC syscall, 64
TRAP_NOEC ipi, 240

alltraps:
    push    ds
    push    es
    push    fs
    push    gs
    pushal
    mov     ax, 0x10
    mov     ds, ax
    mov     es, ax
    push    esp
    call    trap
    add     esp, 4
    popal
    pop     gs
    pop     fs
    pop     es
    pop     ds
    add     esp, 8
    iretd
"#
);

unsafe extern "C" {
    fn vector0();
    fn vector1();
    fn vector2();
    fn vector3();
    fn vector4();
    fn vector5();
    fn vector6();
    fn vector7();
    fn vector8();
    fn vector10();
    fn vector11();
    fn vector12();
    fn vector13();
    fn vector14();
    fn vector16();
    fn vector17();
    fn vector32();
    fn vector33();
    fn vector34();
    fn vector35();
    fn vector36();
    fn vector39();
    fn vector64();
    fn vector240();
    static mut gdt_tss: u64;
}

#[repr(C)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    attrs: u8,
    offset_high: u16,
}

impl IdtEntry {
    const EMPTY: Self = Self {
        offset_low: 0,
        selector: 0,
        zero: 0,
        attrs: 0,
        offset_high: 0,
    };

    fn gate(handler: unsafe extern "C" fn(), dpl: u8) -> Self {
        let offset = handler as usize as u32;
        Self {
            offset_low: offset as u16,
            selector: SEG_KCODE as u16,
            zero: 0,
            attrs: 0x8E | (dpl << 5),
            offset_high: (offset >> 16) as u16,
        }
    }
}

static IDT: SyncUnsafeCell<[IdtEntry; 256]> = SyncUnsafeCell::new([IdtEntry::EMPTY; 256]);

/// Hardware task state segment; only `esp0`/`ss0` matter.
#[repr(C, packed)]
struct Tss {
    link: u32,
    esp0: u32,
    ss0: u32,
    _unused: [u32; 23],
}

static TSS: SyncUnsafeCell<Tss> = SyncUnsafeCell::new(Tss {
    link: 0,
    esp0: 0,
    ss0: SEG_KDATA,
    _unused: [0; 23],
});

pub fn idt_init() {
    let idt = unsafe { &mut *IDT.get() };
    let set = |idt: &mut [IdtEntry; 256], n: usize, f: unsafe extern "C" fn(), dpl: u8| {
        idt[n] = IdtEntry::gate(f, dpl);
    };

    set(idt, 0, vector0, 0);
    set(idt, 1, vector1, 0);
    set(idt, 2, vector2, 0);
    set(idt, 3, vector3, 3);
    set(idt, 4, vector4, 0);
    set(idt, 5, vector5, 0);
    set(idt, 6, vector6, 0);
    set(idt, 7, vector7, 0);
    set(idt, 8, vector8, 0);
    set(idt, 10, vector10, 0);
    set(idt, 11, vector11, 0);
    set(idt, 12, vector12, 0);
    set(idt, 13, vector13, 0);
    set(idt, 14, vector14, 0);
    set(idt, 16, vector16, 0);
    set(idt, 17, vector17, 0);
    set(idt, 32, vector32, 0);
    set(idt, 33, vector33, 0);
    set(idt, 34, vector34, 0);
    set(idt, 35, vector35, 0);
    set(idt, 36, vector36, 0);
    set(idt, 39, vector39, 0);
    // the syscall gate is reachable from ring 3
    set(idt, 0x40, vector64, 3);
    set(idt, 0xF0, vector240, 0);

    lidt(IDT.get().cast(), (size_of::<[IdtEntry; 256]>() - 1) as u16);
}

/// Install the TSS descriptor and load the task register.
pub fn tss_init() {
    let base = TSS.get() as u32;
    let limit = (size_of::<Tss>() - 1) as u32;
    let descriptor: u64 = (limit as u64 & 0xFFFF)
        | ((base as u64 & 0xFF_FFFF) << 16)
        | (0x89u64 << 40)
        | (((limit as u64 >> 16) & 0xF) << 48)
        | (((base as u64 >> 24) & 0xFF) << 56);
    unsafe {
        gdt_tss = descriptor;
    }
    ltr(SEG_TSS);
}

pub fn tss_set_esp0(esp0: u32) {
    unsafe { (*TSS.get()).esp0 = esp0 };
}
