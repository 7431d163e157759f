//! x86_64 context switching implementation
//!
//! Uses naked inline assembly for the switch, stable in Rust 1.88+.

use std::arch::naked_asm;

/// Callee-saved register block for a parked fiber.
///
/// Field order is load-bearing: the assembly in [`switch_context`]
/// addresses these by byte offset.
#[repr(C)]
#[derive(Debug)]
pub struct SavedRegs {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl SavedRegs {
    pub const fn zeroed() -> Self {
        SavedRegs {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Initialize a fresh fiber context.
///
/// Sets up the register block so that the first switch into it begins
/// executing `entry_fn(entry_arg)` on the given stack.
///
/// # Safety
///
/// `regs` must point to valid `SavedRegs` memory. `stack_top` must be
/// the one-past-the-end address of a live, writable stack.
#[inline]
pub unsafe fn init_context(
    regs: *mut SavedRegs,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // System V AMD64: rsp must be 16-byte aligned before a call. The
    // trampoline is entered by `jmp`, so align to 16 exactly and let
    // its own `call` produce the conventional entry alignment.
    let aligned_sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = fiber_entry_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64; // entry function
    regs.r13 = entry_arg as u64; // entry argument
    regs.r14 = 0;
    regs.r15 = 0;
}

/// Trampoline that calls the entry function with its argument.
///
/// The entry function must never return: a finished fiber switches
/// away through its saved resumer context instead.
#[unsafe(naked)]
pub unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // Entry functions do not return.
        "ud2",
    );
}

/// Perform a context switch.
///
/// Saves callee-saved registers to `old_regs` and loads `new_regs`.
/// Returns (to the caller) only when something later switches back
/// into `old_regs`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(
    _old_regs: *mut SavedRegs,
    _new_regs: *const SavedRegs,
) {
    naked_asm!(
        // Save callee-saved registers to old_regs (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new_regs (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to new RIP
        "jmp rax",
        // Return point for the saved context
        "1:",
        "ret",
    );
}
